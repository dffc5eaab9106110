//! Error taxonomy for the bus, transport and diagnostic layers
//!
//! Every error type reports an [`ErrorKind`] so callers can tell
//! configuration mistakes from recoverable or fatal runtime faults without
//! inspecting message text.

use thiserror::Error;

use candiag_layers::{CodecError, LayerError};
use candiag_signals::SignalError;

use crate::engine::DiagnosticResult;

/// Coarse classification shared by all core errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller must fix configuration; retrying will not help
    Configuration,
    /// Hardware or channel could not be opened
    Connection,
    /// Fault on an open connection
    Transport,
    /// Per-frame decode problem
    Decode,
    /// Segmentation or reassembly failure
    Protocol,
    /// The current diagnostic call failed
    Diagnostic,
}

/// Missing or invalid channel, bitrate or addressing
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("No channel selected")]
    MissingChannel,

    #[error("Invalid bitrate: {0}")]
    InvalidBitrate(String),

    #[error("Channel '{0}' does not support CAN FD")]
    FdNotSupported(String),

    #[error("ECU '{0}' has no addressing information")]
    MissingAddressing(String),

    #[error("ECU '{0}' not found in diagnostic database")]
    UnknownEcu(String),

    #[error("No ECU selected")]
    NoEcuSelected,

    #[error("No {0} database loaded")]
    MissingDatabase(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Opening a frame source failed
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("Failed to open {channel}: {reason}")]
    Open { channel: String, reason: String },

    #[error("Driver not supported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// Fault during an open connection
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Bus fault: {0}")]
    BusFault(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Faults that end the listener loop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Closed | TransportError::Receive(_) | TransportError::BusFault(_)
        )
    }
}

/// Segmentation or reassembly failure of one exchange
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("Sequence number mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u8, actual: u8 },

    #[error("Receiver reported buffer overflow")]
    Overflow,

    #[error("Too many flow control WAIT frames ({0})")]
    WaitLimit(u32),

    #[error("Payload of {0} bytes cannot be segmented")]
    PayloadTooLarge(usize),

    #[error("Empty payload")]
    EmptyPayload,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failure of one diagnostic `execute` call
#[derive(Debug, Error, Clone)]
pub enum DiagnosticError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Failed to encode request: {0}")]
    EncodeFailure(String),

    #[error("No response within {0} ms")]
    Timeout(u64),

    #[error("Another diagnostic request is in progress")]
    Busy,

    #[error("Transport closed during diagnostic exchange")]
    TransportClosed,

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Protocol error: {0}")]
    Protocol(ProtocolError),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Failed to decode response: {0}")]
    DecodeFailure(#[from] CodecError),

    #[error("Request type not implemented: {0}")]
    NotImplemented(String),

    #[error("Negative response: {}", .0.summary())]
    NegativeResponse(Box<DiagnosticResult>),
}

impl DiagnosticError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DiagnosticError::Configuration(_) => ErrorKind::Configuration,
            DiagnosticError::Protocol(_) => ErrorKind::Protocol,
            DiagnosticError::TransportClosed | DiagnosticError::Transport(_) => {
                ErrorKind::Transport
            }
            _ => ErrorKind::Diagnostic,
        }
    }
}

impl From<ProtocolError> for DiagnosticError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Transport(TransportError::Closed) => DiagnosticError::TransportClosed,
            ProtocolError::Transport(e) => DiagnosticError::Transport(e),
            other => DiagnosticError::Protocol(other),
        }
    }
}

impl From<TransportError> for DiagnosticError {
    fn from(err: TransportError) -> Self {
        ProtocolError::Transport(err).into()
    }
}

/// Trace file ingestion failure
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame logger failure
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LoggerError {
    #[error("Logger is already running")]
    AlreadyRunning,

    #[error("Logger is not running")]
    NotRunning,

    #[error("Log file error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LoggerError {
    fn from(err: std::io::Error) -> Self {
        LoggerError::Io(err.to_string())
    }
}

/// Network session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Diagnostic(#[from] DiagnosticError),

    #[error(transparent)]
    Logger(#[from] LoggerError),

    #[error("Signal database: {0}")]
    Signals(#[from] SignalError),

    #[error("Diagnostic database: {0}")]
    Layers(#[from] LayerError),

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error("Network is not connected")]
    NotConnected,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Network not found: {0}")]
    NotFound(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Configuration(_)
            | SessionError::Signals(_)
            | SessionError::Layers(_)
            | SessionError::NotFound(_) => ErrorKind::Configuration,
            SessionError::Connection(ConnectionError::Configuration(_)) => {
                ErrorKind::Configuration
            }
            SessionError::Connection(_) => ErrorKind::Connection,
            SessionError::Diagnostic(e) => e.kind(),
            SessionError::Trace(_) => ErrorKind::Decode,
            SessionError::Transport(_)
            | SessionError::Logger(_)
            | SessionError::NotConnected
            | SessionError::InvalidState(_) => ErrorKind::Transport,
        }
    }
}
