//! candiag-core - CAN network observation and UDS diagnostics
//!
//! This crate connects to a CAN channel, decodes traffic into signals,
//! logs frames and runs UDS requests over ISO-TP.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      NetworkSession                         │
//! │                                                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │ BusListener │─▶│ FrameLogger │  │ DiagnosticEngine    │  │
//! │  │ (decode,    │  │ (CSV)       │  │ (encode, await,     │  │
//! │  │  cache)     │  └─────────────┘  │  classify)          │  │
//! │  └──────┬──────┘                   └──────────┬──────────┘  │
//! │         │         ┌─────────────┐  ┌──────────┴──────────┐  │
//! │         └────────▶│ FrameRouter │─▶│ IsoTpChannel        │  │
//! │                   └─────────────┘  └──────────┬──────────┘  │
//! │                    ┌──────────────────────────┴─┐           │
//! │                    │ FrameSource                │           │
//! │                    │ (SocketCAN/virtual/replay) │           │
//! │                    └────────────────────────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod isotp;
pub mod listener;
pub mod logger;
pub mod router;
pub mod session;
pub mod sim;
pub mod trace;
pub mod transport;
pub mod uds;

pub use config::{
    AppConfig, ChannelDescriptor, DiagnosticsConfig, Driver, IsoTpConfig, ListenerConfig,
    LoggingConfig, NetworkConfig, ReplayOptions,
};
pub use engine::{DiagnosticEngine, DiagnosticResult, EngineState, Outcome};
pub use error::{
    ConfigurationError, ConnectionError, DiagnosticError, ErrorKind, LoggerError, ProtocolError,
    SessionError, TraceError, TransportError,
};
pub use frame::Frame;
pub use isotp::IsoTpChannel;
pub use listener::{BusListener, ListenerState, ListenerStats, NetworkEvent, SignalCache};
pub use logger::{FrameLogger, LogProgress, LOG_HEADER};
pub use router::{BusAccess, FrameRouter};
pub use session::{ConnectionState, NetworkManager, NetworkSession, SessionInfo};
pub use sim::{SimulatedEcu, SimulatedEcuHandle};
pub use trace::{load_trace, TraceProgress, TraceSummary};
pub use transport::{
    DefaultFrameSourceFactory, FrameSource, FrameSourceFactory, ReplaySource, VirtualBus,
    VirtualEndpoint,
};
pub use uds::DiagnosticRequest;

// Re-export the database crates for convenience
pub use candiag_layers::{DiagnosticDatabase, EcuLayer};
pub use candiag_signals::{DecodeError, DecodedSignal, SignalDatabase, SignalValue};
