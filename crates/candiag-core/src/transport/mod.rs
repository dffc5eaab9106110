//! Frame sources
//!
//! A frame source is one open CAN channel:
//! - SocketCAN raw socket (Linux only)
//! - In-process virtual bus for benches and tests
//! - Trace replay, playing a recorded CSV back as a live channel
//!
//! Sources are blocking: `recv` waits at most the given timeout and returns
//! `Ok(None)` when nothing arrived. Callers on the async runtime drive them
//! from blocking tasks.
//!
//! # Example
//!
//! ```ignore
//! use candiag_core::transport::{DefaultFrameSourceFactory, FrameSourceFactory};
//! use candiag_core::config::ChannelDescriptor;
//!
//! let factory = DefaultFrameSourceFactory::new();
//! let source = factory.open(&ChannelDescriptor::virtual_bus("bench", 0), 500000, None)?;
//! let frame = source.recv(Duration::from_millis(100))?;
//! ```

pub mod replay;
pub mod virtual_bus;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use replay::ReplaySource;
pub use virtual_bus::{VirtualBus, VirtualEndpoint};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::config::{ChannelDescriptor, Driver};
use crate::error::{ConnectionError, TransportError};
use crate::frame::Frame;

/// One open CAN channel
pub trait FrameSource: Send + Sync {
    /// Wait up to `timeout` for the next frame
    fn recv(&self, timeout: Duration) -> Result<Option<Frame>, TransportError>;

    /// Transmit a frame
    fn send(&self, frame: &Frame) -> Result<(), TransportError>;

    /// Release the channel; blocked and later calls fail with `Closed`
    fn close(&self);

    fn is_open(&self) -> bool;

    /// Human-readable channel name for logs
    fn describe(&self) -> String;
}

/// Opens frame sources for channel descriptors
pub trait FrameSourceFactory: Send + Sync {
    fn open(
        &self,
        channel: &ChannelDescriptor,
        bitrate: u32,
        fd_bitrate: Option<u32>,
    ) -> Result<Arc<dyn FrameSource>, ConnectionError>;
}

/// Factory for the built-in drivers
///
/// Virtual buses are created on first use and shared by name, so every
/// channel opened with the same `app_name` sees the same traffic.
#[derive(Default)]
pub struct DefaultFrameSourceFactory {
    buses: Mutex<HashMap<String, VirtualBus>>,
}

impl DefaultFrameSourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The named virtual bus, created if needed
    pub fn virtual_bus(&self, name: &str) -> VirtualBus {
        self.buses
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| VirtualBus::new(name))
            .clone()
    }
}

impl FrameSourceFactory for DefaultFrameSourceFactory {
    fn open(
        &self,
        channel: &ChannelDescriptor,
        bitrate: u32,
        fd_bitrate: Option<u32>,
    ) -> Result<Arc<dyn FrameSource>, ConnectionError> {
        channel.validate(bitrate, fd_bitrate)?;

        let source: Arc<dyn FrameSource> = match channel.driver {
            Driver::Virtual => Arc::new(self.virtual_bus(&channel.app_name).endpoint()),
            Driver::Replay => {
                let options = channel.replay.as_ref().ok_or_else(|| {
                    ConnectionError::Unsupported("replay channel without trace file".to_string())
                })?;
                Arc::new(ReplaySource::open(options)?)
            }
            #[cfg(all(target_os = "linux", feature = "socketcan"))]
            Driver::SocketCan => Arc::new(socketcan::SocketCanSource::open(channel, fd_bitrate)?),
            #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
            Driver::SocketCan => {
                return Err(ConnectionError::Unsupported(
                    "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
                ))
            }
        };

        info!(
            channel = %source.describe(),
            driver = %channel.driver,
            bitrate,
            fd_bitrate = ?fd_bitrate,
            "Opened frame source"
        );
        Ok(source)
    }
}
