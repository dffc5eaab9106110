//! Bus listener
//!
//! Owns reception on one frame source. Each received frame is offered to the
//! [`FrameRouter`] first (diagnostic responses stop there), then logged,
//! decoded into the latest-value cache and published as [`NetworkEvent`]s.
//!
//! ```text
//! Idle -> Running -> Stopping -> Stopped
//!            \______ fault _______/
//! ```
//!
//! The loop polls with a short timeout and checks the stop flag once per
//! iteration. Whatever ends it, exactly one `ConnectionClosed` event is
//! published and it is the last event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use candiag_signals::{DecodeError, DecodeOptions, DecodedSignal, SignalDatabase};

use crate::config::ListenerConfig;
use crate::error::{SessionError, TransportError};
use crate::frame::Frame;
use crate::logger::FrameLogger;
use crate::router::FrameRouter;
use crate::transport::FrameSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Notification published by a listener
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NetworkEvent {
    Frame { frame: Frame },
    Signal { message: String, signal: DecodedSignal },
    /// Reception ended; `fault` is set when a bus fault ended it
    ConnectionClosed { fault: Option<String> },
}

/// Latest decoded value per signal name
///
/// Written only by the listener; readers get cloned snapshots.
#[derive(Debug, Clone, Default)]
pub struct SignalCache {
    values: Arc<RwLock<HashMap<String, DecodedSignal>>>,
}

impl SignalCache {
    pub fn get(&self, name: &str) -> Option<DecodedSignal> {
        self.values.read().get(name).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, DecodedSignal> {
        self.values.read().clone()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    pub fn clear(&self) {
        self.values.write().clear();
    }

    fn update(&self, signals: &[DecodedSignal]) {
        let mut values = self.values.write();
        for signal in signals {
            values.insert(signal.name.clone(), signal.clone());
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    frames_received: AtomicU64,
    frames_decoded: AtomicU64,
    unknown_ids: AtomicU64,
    decode_errors: AtomicU64,
    diagnostic_frames: AtomicU64,
}

/// Listener counters at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListenerStats {
    pub frames_received: u64,
    pub frames_decoded: u64,
    pub unknown_ids: u64,
    pub decode_errors: u64,
    /// Frames handed to a diagnostic exchange instead of decoding
    pub diagnostic_frames: u64,
}

impl Counters {
    fn snapshot(&self) -> ListenerStats {
        ListenerStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            unknown_ids: self.unknown_ids.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            diagnostic_frames: self.diagnostic_frames.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the listener handle and its loop
struct Shared {
    state: Mutex<ListenerState>,
    stop: AtomicBool,
    fault: Mutex<Option<String>>,
    counters: Counters,
}

/// Everything one run of the loop needs
struct RunContext {
    source: Arc<dyn FrameSource>,
    database: Option<Arc<SignalDatabase>>,
    logger: Arc<FrameLogger>,
    router: Arc<FrameRouter>,
    cache: SignalCache,
    events: broadcast::Sender<NetworkEvent>,
    options: DecodeOptions,
    config: ListenerConfig,
    shared: Arc<Shared>,
}

pub struct BusListener {
    config: ListenerConfig,
    shared: Arc<Shared>,
    cache: SignalCache,
    events: broadcast::Sender<NetworkEvent>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BusListener {
    pub fn new(config: ListenerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(ListenerState::Idle),
                stop: AtomicBool::new(false),
                fault: Mutex::new(None),
                counters: Counters::default(),
            }),
            cache: SignalCache::default(),
            events,
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.shared.state.lock()
    }

    /// Fault that ended the last run, if any
    pub fn fault(&self) -> Option<String> {
        self.shared.fault.lock().clone()
    }

    pub fn stats(&self) -> ListenerStats {
        self.shared.counters.snapshot()
    }

    pub fn cache(&self) -> &SignalCache {
        &self.cache
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    /// Start the receive loop on a blocking task
    ///
    /// Must be called within a tokio runtime.
    pub fn start(
        &self,
        source: Arc<dyn FrameSource>,
        database: Option<Arc<SignalDatabase>>,
        logger: Arc<FrameLogger>,
        router: Arc<FrameRouter>,
    ) -> Result<(), SessionError> {
        let mut handle = self.handle.lock();
        {
            let mut state = self.shared.state.lock();
            if matches!(*state, ListenerState::Running | ListenerState::Stopping) {
                return Err(SessionError::InvalidState(
                    "listener is already running".to_string(),
                ));
            }
            *state = ListenerState::Running;
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        *self.shared.fault.lock() = None;

        let context = RunContext {
            source,
            database,
            logger,
            router,
            cache: self.cache.clone(),
            events: self.events.clone(),
            options: DecodeOptions {
                allow_truncated: self.config.allow_truncated,
                resolve_choices: self.config.resolve_choices,
            },
            config: self.config.clone(),
            shared: self.shared.clone(),
        };
        info!(source = %context.source.describe(), "Bus listener started");
        *handle = Some(tokio::task::spawn_blocking(move || context.run()));
        Ok(())
    }

    /// Ask the loop to stop without waiting
    pub fn request_stop(&self) {
        let mut state = self.shared.state.lock();
        if *state == ListenerState::Running {
            *state = ListenerState::Stopping;
        }
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    /// Stop and wait until the loop has published `ConnectionClosed`
    pub async fn stop(&self) {
        self.request_stop();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Bus listener task failed");
                *self.shared.state.lock() = ListenerState::Stopped;
            }
        }
    }
}

impl Drop for BusListener {
    fn drop(&mut self) {
        self.request_stop();
    }
}

impl RunContext {
    fn run(self) {
        let poll = self.config.poll_timeout();
        let mut fault = None;

        while !self.shared.stop.load(Ordering::SeqCst) {
            match self.source.recv(poll) {
                Ok(Some(frame)) => self.handle_frame(frame),
                Ok(None) => {}
                Err(TransportError::Closed) if self.shared.stop.load(Ordering::SeqCst) => break,
                Err(e) if e.is_fatal() => {
                    error!(source = %self.source.describe(), error = %e, "Bus fault, stopping listener");
                    fault = Some(e.to_string());
                    break;
                }
                Err(e) => warn!(source = %self.source.describe(), error = %e, "Receive error"),
            }
        }

        self.router.close();
        *self.shared.fault.lock() = fault.clone();
        *self.shared.state.lock() = ListenerState::Stopped;
        let stats = self.shared.counters.snapshot();
        info!(
            source = %self.source.describe(),
            frames = stats.frames_received,
            decoded = stats.frames_decoded,
            "Bus listener stopped"
        );
        let _ = self.events.send(NetworkEvent::ConnectionClosed { fault });
    }

    fn handle_frame(&self, frame: Frame) {
        let counters = &self.shared.counters;
        counters.frames_received.fetch_add(1, Ordering::Relaxed);

        let Some(frame) = self.router.dispatch(frame) else {
            counters.diagnostic_frames.fetch_add(1, Ordering::Relaxed);
            return;
        };

        self.logger.enqueue(&frame);

        if let (Some(database), true) = (&self.database, frame.is_decodable()) {
            self.decode(database, &frame);
        }

        let _ = self.events.send(NetworkEvent::Frame { frame });
    }

    fn decode(&self, database: &SignalDatabase, frame: &Frame) {
        let counters = &self.shared.counters;
        match database.decode(frame.id, &frame.data, self.options) {
            Ok(values) => {
                counters.frames_decoded.fetch_add(1, Ordering::Relaxed);
                let message = database.lookup(frame.id);
                let signals: Vec<DecodedSignal> = values
                    .into_iter()
                    .map(|(name, value)| DecodedSignal {
                        unit: message
                            .and_then(|m| m.signal(&name))
                            .and_then(|s| s.unit.clone()),
                        name,
                        value,
                        timestamp: frame.timestamp,
                    })
                    .collect();
                self.cache.update(&signals);

                let message_name = message.map(|m| m.name.clone()).unwrap_or_default();
                for signal in signals {
                    let _ = self.events.send(NetworkEvent::Signal {
                        message: message_name.clone(),
                        signal,
                    });
                }
            }
            Err(DecodeError::UnknownFrame(_)) => {
                counters.unknown_ids.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "Decode error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::VirtualBus;
    use candiag_signals::{MessageDef, SignalDef, SignalValue};
    use std::time::Duration;

    fn speed_db() -> Arc<SignalDatabase> {
        Arc::new(
            SignalDatabase::from_messages([MessageDef::new(0x100, "Vehicle", 1)
                .with_signal(SignalDef::new("Speed", 0, 8).with_scale(0.5, 0.0).with_unit("km/h"))])
            .unwrap(),
        )
    }

    fn listener() -> BusListener {
        BusListener::new(ListenerConfig {
            poll_timeout_ms: 20,
            ..Default::default()
        })
    }

    async fn next_event(rx: &mut broadcast::Receiver<NetworkEvent>) -> NetworkEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_decodes_into_cache_and_publishes() {
        let bus = VirtualBus::new("listener");
        let sender = bus.endpoint();
        let listener = listener();
        let mut events = listener.subscribe();
        let logger = Arc::new(FrameLogger::new(Duration::from_millis(50)));
        listener
            .start(Arc::new(bus.endpoint()), Some(speed_db()), logger, FrameRouter::new())
            .unwrap();
        assert_eq!(listener.state(), ListenerState::Running);

        sender.send(&Frame::new(0x100, vec![40])).unwrap();
        match next_event(&mut events).await {
            NetworkEvent::Signal { message, signal } => {
                assert_eq!(message, "Vehicle");
                assert_eq!(signal.value, SignalValue::Physical(20.0));
                assert_eq!(signal.unit.as_deref(), Some("km/h"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(next_event(&mut events).await, NetworkEvent::Frame { .. }));
        assert_eq!(
            listener.cache().get("Speed").unwrap().value,
            SignalValue::Physical(20.0)
        );

        sender.send(&Frame::new(0x200, vec![1])).unwrap();
        assert!(matches!(next_event(&mut events).await, NetworkEvent::Frame { .. }));
        let stats = listener.stats();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.frames_decoded, 1);
        assert_eq!(stats.unknown_ids, 1);

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_stop_publishes_one_close_last() {
        let bus = VirtualBus::new("listener");
        let sender = bus.endpoint();
        let listener = listener();
        let mut events = listener.subscribe();
        listener
            .start(
                Arc::new(bus.endpoint()),
                None,
                Arc::new(FrameLogger::new(Duration::from_millis(50))),
                FrameRouter::new(),
            )
            .unwrap();

        sender.send(&Frame::new(0x1, vec![1])).unwrap();
        assert!(matches!(next_event(&mut events).await, NetworkEvent::Frame { .. }));
        listener.stop().await;
        assert_eq!(listener.state(), ListenerState::Stopped);
        sender.send(&Frame::new(0x2, vec![2])).unwrap();

        let mut closed = 0;
        while let Ok(event) = events.try_recv() {
            assert!(matches!(event, NetworkEvent::ConnectionClosed { fault: None }));
            closed += 1;
        }
        assert_eq!(closed, 1);
        assert!(listener.fault().is_none());
    }

    #[tokio::test]
    async fn test_bus_fault_stops_listener() {
        let bus = VirtualBus::new("listener");
        let listener = listener();
        let mut events = listener.subscribe();
        let router = FrameRouter::new();
        listener
            .start(
                Arc::new(bus.endpoint()),
                None,
                Arc::new(FrameLogger::new(Duration::from_millis(50))),
                router.clone(),
            )
            .unwrap();

        bus.inject_fault("bus off");
        match next_event(&mut events).await {
            NetworkEvent::ConnectionClosed { fault } => assert!(fault.unwrap().contains("bus off")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(listener.state(), ListenerState::Stopped);
        assert!(router.is_closed());
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_claimed_frames_skip_logging_and_decoding() {
        let dir = tempfile::tempdir().unwrap();
        let bus = VirtualBus::new("listener");
        let sender = bus.endpoint();
        let listener = listener();
        let mut events = listener.subscribe();
        let logger = Arc::new(FrameLogger::new(Duration::from_millis(10)));
        logger.start(dir.path().join("log.csv")).unwrap();
        let router = FrameRouter::new();
        listener
            .start(Arc::new(bus.endpoint()), None, logger.clone(), router.clone())
            .unwrap();

        let _tap = router.claim(0x7E8).unwrap();
        sender.send(&Frame::new(0x7E8, vec![0x03, 0x62, 0xF1, 0x90])).unwrap();
        sender.send(&Frame::new(0x123, vec![1])).unwrap();
        match next_event(&mut events).await {
            NetworkEvent::Frame { frame } => assert_eq!(frame.id, 0x123),
            other => panic!("unexpected {:?}", other),
        }
        listener.stop().await;

        assert_eq!(listener.stats().diagnostic_frames, 1);
        assert_eq!(logger.stop().await.unwrap(), 1);
    }
}
