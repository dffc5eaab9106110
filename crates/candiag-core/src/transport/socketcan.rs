//! SocketCAN raw frame source (Linux)
//!
//! Opens `<app_name><channel_index>` as a classic CAN raw socket. The
//! interface bitrate is owned by the OS (`ip link set canX type can
//! bitrate ...`); the configured value is only checked and logged.

use std::io::ErrorKind;
use std::time::Duration;

use parking_lot::RwLock;
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket, StandardId};
use tracing::{debug, error};

use super::FrameSource;
use crate::config::ChannelDescriptor;
use crate::error::{ConnectionError, TransportError};
use crate::frame::{monotonic_seconds, Frame};

pub struct SocketCanSource {
    interface: String,
    socket: RwLock<Option<CanSocket>>,
}

impl SocketCanSource {
    pub fn open(
        channel: &ChannelDescriptor,
        fd_bitrate: Option<u32>,
    ) -> Result<Self, ConnectionError> {
        let interface = channel.interface();
        if fd_bitrate.is_some() {
            return Err(ConnectionError::Unsupported(format!(
                "CAN FD on {} is not supported by the raw socket driver",
                interface
            )));
        }

        let socket = CanSocket::open(&interface).map_err(|e| ConnectionError::Open {
            channel: interface.clone(),
            reason: e.to_string(),
        })?;

        // Drain anything queued before we attached
        socket.set_nonblocking(true).map_err(|e| ConnectionError::Open {
            channel: interface.clone(),
            reason: format!("failed to set non-blocking: {}", e),
        })?;
        while let Ok(frame) = socket.read_frame() {
            debug!(id = format!("0x{:X}", frame_id(&frame)), "Drained stale frame");
        }
        socket.set_nonblocking(false).map_err(|e| ConnectionError::Open {
            channel: interface.clone(),
            reason: format!("failed to set blocking: {}", e),
        })?;

        Ok(Self {
            interface,
            socket: RwLock::new(Some(socket)),
        })
    }
}

fn frame_id(frame: &CanFrame) -> u32 {
    match frame.id() {
        Id::Standard(id) => id.as_raw() as u32,
        Id::Extended(id) => id.as_raw(),
    }
}

fn from_can_frame(frame: &CanFrame) -> Frame {
    let mut out = Frame::new(frame_id(frame), frame.data().to_vec())
        .with_timestamp(monotonic_seconds())
        .extended(frame.is_extended());
    out.is_remote = frame.is_remote_frame();
    out.is_error = matches!(frame, CanFrame::Error(_));
    out
}

fn to_can_frame(frame: &Frame) -> Result<CanFrame, TransportError> {
    let id: Id = if frame.is_extended {
        ExtendedId::new(frame.id).map(Id::Extended)
    } else {
        u16::try_from(frame.id)
            .ok()
            .and_then(StandardId::new)
            .map(Id::Standard)
    }
    .ok_or_else(|| TransportError::Send(format!("invalid CAN id 0x{:X}", frame.id)))?;

    let can_frame = if frame.is_remote {
        CanFrame::new_remote(id, frame.dlc())
    } else {
        CanFrame::new(id, &frame.data)
    };
    can_frame.ok_or_else(|| {
        TransportError::Send(format!(
            "{} data bytes do not fit a classic CAN frame",
            frame.dlc()
        ))
    })
}

impl FrameSource for SocketCanSource {
    fn recv(&self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        let guard = self.socket.read();
        let socket = guard.as_ref().ok_or(TransportError::Closed)?;
        socket
            .set_read_timeout(timeout)
            .map_err(|e| TransportError::Receive(e.to_string()))?;

        match socket.read_frame() {
            Ok(frame) => Ok(Some(from_can_frame(&frame))),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => {
                error!(interface = %self.interface, error = %e, "SocketCAN read error");
                Err(TransportError::BusFault(e.to_string()))
            }
        }
    }

    fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let guard = self.socket.read();
        let socket = guard.as_ref().ok_or(TransportError::Closed)?;
        let can_frame = to_can_frame(frame)?;
        socket
            .write_frame(&can_frame)
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn close(&self) {
        if self.socket.write().take().is_some() {
            debug!(interface = %self.interface, "SocketCAN source closed");
        }
    }

    fn is_open(&self) -> bool {
        self.socket.read().is_some()
    }

    fn describe(&self) -> String {
        format!("socketcan:{}", self.interface)
    }
}
