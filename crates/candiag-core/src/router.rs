//! Shared access to one frame source during diagnostic exchanges
//!
//! While a bus listener owns reception, a diagnostic exchange claims its
//! response identifier on the [`FrameRouter`]. The listener hands every
//! received frame to the router first; claimed frames go to the exchange
//! and are kept out of logging and decoding.
//!
//! Without a listener the exchange reads the source directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::frame::Frame;
use crate::transport::FrameSource;

/// Routes received frames to claimed receive identifiers
#[derive(Default)]
pub struct FrameRouter {
    taps: Mutex<HashMap<u32, mpsc::UnboundedSender<Frame>>>,
    closed: AtomicBool,
}

impl FrameRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim frames with `rx_id` until the guard is dropped
    pub fn claim(self: &Arc<Self>, rx_id: u32) -> Result<TapGuard, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.taps.lock().insert(rx_id, tx);
        trace!(rx_id = format!("0x{:X}", rx_id), "Claimed receive id");
        Ok(TapGuard {
            router: Arc::clone(self),
            rx_id,
            rx,
        })
    }

    /// Hand a frame to its tap; unclaimed frames are returned
    pub fn dispatch(&self, frame: Frame) -> Option<Frame> {
        let taps = self.taps.lock();
        match taps.get(&frame.id) {
            Some(tx) => match tx.send(frame) {
                Ok(()) => None,
                Err(mpsc::error::SendError(frame)) => Some(frame),
            },
            None => Some(frame),
        }
    }

    /// Whether any exchange currently claims `rx_id`
    pub fn is_claimed(&self, rx_id: u32) -> bool {
        self.taps.lock().contains_key(&rx_id)
    }

    /// Stop routing; waiting exchanges observe a closed transport
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.taps.lock().clear();
            debug!("Frame router closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Receiving end of a claimed identifier
pub struct TapGuard {
    router: Arc<FrameRouter>,
    rx_id: u32,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl Drop for TapGuard {
    fn drop(&mut self) {
        self.router.taps.lock().remove(&self.rx_id);
    }
}

/// Frame-level channel used by the segmenter
#[async_trait]
pub trait FrameLink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Next frame from the peer, `None` on timeout
    async fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError>;
}

/// Link fed by a router tap
pub struct RoutedLink {
    source: Arc<dyn FrameSource>,
    tap: TapGuard,
}

#[async_trait]
impl FrameLink for RoutedLink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.source.send(&frame)
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        match tokio::time::timeout(timeout, self.tap.rx.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Ok(None),
        }
    }
}

/// Link reading the source itself, dropping frames for other ids
pub struct DirectLink {
    source: Arc<dyn FrameSource>,
    rx_id: u32,
}

#[async_trait]
impl FrameLink for DirectLink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let source = Arc::clone(&self.source);
        tokio::task::spawn_blocking(move || source.send(&frame))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let source = Arc::clone(&self.source);
            let received = tokio::task::spawn_blocking(move || source.recv(remaining))
                .await
                .map_err(|e| TransportError::Receive(e.to_string()))??;
            match received {
                Some(frame) if frame.id == self.rx_id => return Ok(Some(frame)),
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }
}

/// How a diagnostic exchange reaches the bus
#[derive(Clone)]
pub enum BusAccess {
    /// A listener owns reception and routes claimed frames
    Routed {
        source: Arc<dyn FrameSource>,
        router: Arc<FrameRouter>,
    },
    /// Nobody else reads the source
    Direct(Arc<dyn FrameSource>),
}

impl BusAccess {
    /// Open a link receiving frames with `rx_id`
    pub fn link(&self, rx_id: u32) -> Result<Box<dyn FrameLink>, TransportError> {
        match self {
            BusAccess::Routed { source, router } => {
                if !source.is_open() {
                    return Err(TransportError::Closed);
                }
                Ok(Box::new(RoutedLink {
                    source: Arc::clone(source),
                    tap: router.claim(rx_id)?,
                }))
            }
            BusAccess::Direct(source) => {
                if !source.is_open() {
                    return Err(TransportError::Closed);
                }
                Ok(Box::new(DirectLink {
                    source: Arc::clone(source),
                    rx_id,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::VirtualBus;

    #[tokio::test]
    async fn test_claimed_frames_are_routed() {
        let router = FrameRouter::new();
        let bus = VirtualBus::new("router");
        let source: Arc<dyn FrameSource> = Arc::new(bus.endpoint());
        let access = BusAccess::Routed {
            source,
            router: router.clone(),
        };

        let mut link = access.link(0x7E8).unwrap();
        assert!(router.is_claimed(0x7E8));
        assert!(router.dispatch(Frame::new(0x100, vec![1])).is_some());
        assert!(router.dispatch(Frame::new(0x7E8, vec![2])).is_none());

        let frame = link.recv(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(frame.data.as_ref(), &[2]);

        drop(link);
        assert!(!router.is_claimed(0x7E8));
        assert!(router.dispatch(Frame::new(0x7E8, vec![3])).is_some());
    }

    #[tokio::test]
    async fn test_close_ends_waiting_exchange() {
        let router = FrameRouter::new();
        let bus = VirtualBus::new("router");
        let access = BusAccess::Routed {
            source: Arc::new(bus.endpoint()),
            router: router.clone(),
        };
        let mut link = access.link(0x7E8).unwrap();

        let closer = router.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });
        assert_eq!(
            link.recv(Duration::from_secs(5)).await.err(),
            Some(TransportError::Closed)
        );
        assert!(access.link(0x7E8).is_err());
    }

    #[tokio::test]
    async fn test_direct_link_filters_ids() {
        let bus = VirtualBus::new("direct");
        let ecu = bus.endpoint();
        let access = BusAccess::Direct(Arc::new(bus.endpoint()));
        let mut link = access.link(0x7E8).unwrap();

        ecu.send(&Frame::new(0x100, vec![1])).unwrap();
        ecu.send(&Frame::new(0x7E8, vec![2])).unwrap();
        let frame = link.recv(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(frame.id, 0x7E8);
        assert!(link.recv(Duration::from_millis(20)).await.unwrap().is_none());
    }
}
