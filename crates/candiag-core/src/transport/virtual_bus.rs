//! In-process virtual CAN bus
//!
//! Every frame sent by one endpoint is delivered to all other open
//! endpoints of the same bus, in send order. A fault injected on the bus is
//! reported once by every endpoint's next `recv`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::FrameSource;
use crate::error::TransportError;
use crate::frame::{monotonic_seconds, Frame};

/// Shared handle to one virtual bus
#[derive(Clone)]
pub struct VirtualBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    name: String,
    next_id: AtomicUsize,
    endpoints: Mutex<Vec<Weak<EndpointShared>>>,
}

struct EndpointShared {
    id: usize,
    state: Mutex<EndpointState>,
    ready: Condvar,
}

struct EndpointState {
    queue: VecDeque<Frame>,
    open: bool,
    fault: Option<TransportError>,
}

impl VirtualBus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                name: name.into(),
                next_id: AtomicUsize::new(0),
                endpoints: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Attach a new endpoint
    pub fn endpoint(&self) -> VirtualEndpoint {
        let shared = Arc::new(EndpointShared {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(EndpointState {
                queue: VecDeque::new(),
                open: true,
                fault: None,
            }),
            ready: Condvar::new(),
        });
        self.inner.endpoints.lock().push(Arc::downgrade(&shared));
        debug!(bus = %self.inner.name, endpoint = shared.id, "Virtual endpoint attached");
        VirtualEndpoint {
            bus: self.clone(),
            shared,
        }
    }

    /// Number of endpoints still open
    pub fn endpoint_count(&self) -> usize {
        self.live_endpoints()
            .iter()
            .filter(|e| e.state.lock().open)
            .count()
    }

    /// Report a bus-level fault to every open endpoint
    pub fn inject_fault(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(bus = %self.inner.name, %reason, "Injecting bus fault");
        for endpoint in self.live_endpoints() {
            let mut state = endpoint.state.lock();
            if state.open {
                state.fault = Some(TransportError::BusFault(reason.clone()));
                endpoint.ready.notify_all();
            }
        }
    }

    fn live_endpoints(&self) -> Vec<Arc<EndpointShared>> {
        let mut endpoints = self.inner.endpoints.lock();
        endpoints.retain(|w| w.strong_count() > 0);
        endpoints.iter().filter_map(Weak::upgrade).collect()
    }

    fn deliver(&self, from: usize, frame: &Frame) {
        let timestamp = monotonic_seconds();
        for endpoint in self.live_endpoints() {
            if endpoint.id == from {
                continue;
            }
            let mut state = endpoint.state.lock();
            if state.open {
                let mut copy = frame.clone();
                copy.timestamp = timestamp;
                state.queue.push_back(copy);
                endpoint.ready.notify_one();
            }
        }
    }
}

/// One node on a [`VirtualBus`]
pub struct VirtualEndpoint {
    bus: VirtualBus,
    shared: Arc<EndpointShared>,
}

impl VirtualEndpoint {
    pub fn bus(&self) -> &VirtualBus {
        &self.bus
    }

    /// Frames waiting to be received
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }
}

impl FrameSource for VirtualEndpoint {
    fn recv(&self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(fault) = state.fault.take() {
                return Err(fault);
            }
            if !state.open {
                return Err(TransportError::Closed);
            }
            if let Some(frame) = state.queue.pop_front() {
                return Ok(Some(frame));
            }
            if self
                .shared
                .ready
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Ok(state.queue.pop_front());
            }
        }
    }

    fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        if !self.shared.state.lock().open {
            return Err(TransportError::Closed);
        }
        self.bus.deliver(self.shared.id, frame);
        Ok(())
    }

    fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.open {
            state.open = false;
            state.queue.clear();
            self.shared.ready.notify_all();
            debug!(bus = %self.bus.name(), endpoint = self.shared.id, "Virtual endpoint closed");
        }
    }

    fn is_open(&self) -> bool {
        self.shared.state.lock().open
    }

    fn describe(&self) -> String {
        format!("virtual:{}#{}", self.bus.name(), self.shared.id)
    }
}

impl Drop for VirtualEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_delivery_to_other_endpoints_in_order() {
        let bus = VirtualBus::new("test");
        let a = bus.endpoint();
        let b = bus.endpoint();
        let c = bus.endpoint();

        for i in 0..5u8 {
            a.send(&Frame::new(0x100, vec![i])).unwrap();
        }
        for endpoint in [&b, &c] {
            for i in 0..5u8 {
                let frame = endpoint.recv(Duration::from_millis(10)).unwrap().unwrap();
                assert_eq!(frame.data[0], i);
            }
        }
        assert_eq!(a.pending(), 0);
    }

    #[test]
    fn test_recv_timeout_returns_none() {
        let bus = VirtualBus::new("test");
        let a = bus.endpoint();
        let start = Instant::now();
        assert!(a.recv(Duration::from_millis(30)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_close_wakes_blocked_receiver() {
        let bus = VirtualBus::new("test");
        let a = Arc::new(bus.endpoint());
        let waiter = {
            let a = a.clone();
            thread::spawn(move || a.recv(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        a.close();
        assert_eq!(waiter.join().unwrap(), Err(TransportError::Closed));
        assert!(a.send(&Frame::new(1, vec![0])).is_err());
    }

    #[test]
    fn test_fault_reported_once() {
        let bus = VirtualBus::new("test");
        let a = bus.endpoint();
        bus.inject_fault("bus off");
        assert!(matches!(
            a.recv(Duration::from_millis(10)),
            Err(TransportError::BusFault(_))
        ));
        assert!(a.recv(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn test_dropped_endpoints_are_pruned() {
        let bus = VirtualBus::new("test");
        let a = bus.endpoint();
        {
            let _b = bus.endpoint();
            assert_eq!(bus.endpoint_count(), 2);
        }
        assert_eq!(bus.endpoint_count(), 1);
        a.send(&Frame::new(0x1, vec![1])).unwrap();
    }
}
