//! Network sessions
//!
//! A [`NetworkSession`] binds one channel, one signal database, one
//! diagnostic database, a bus listener, a frame logger and a diagnostic
//! engine under a single connection state:
//!
//! ```text
//! Offline -> Connecting -> Online -> Offline
//!                 \           \
//!                  `-> Error   `-> Error (bus fault)
//! ```
//!
//! Several sessions are held by the [`NetworkManager`].

mod manager;

pub use manager::NetworkManager;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use candiag_layers::{DiagnosticDatabase, EcuLayer};
use candiag_signals::SignalDatabase;

use crate::config::{ChannelDescriptor, NetworkConfig};
use crate::engine::{DiagnosticEngine, DiagnosticResult};
use crate::error::{ConfigurationError, SessionError};
use crate::listener::{BusListener, ListenerState, ListenerStats, NetworkEvent, SignalCache};
use crate::logger::{FrameLogger, LogProgress};
use crate::router::{BusAccess, FrameRouter};
use crate::transport::{FrameSource, FrameSourceFactory};
use crate::uds::DiagnosticRequest;

/// Connection state of a network session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Offline,
    Connecting,
    Online,
    Error,
}

/// Open channel of an online session
struct Connection {
    source: Arc<dyn FrameSource>,
    router: Arc<FrameRouter>,
    channel: ChannelDescriptor,
    bitrate: u32,
    fd_bitrate: Option<u32>,
    connected_at: DateTime<Utc>,
}

/// Snapshot of a session for presentation
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub name: String,
    pub state: ConnectionState,
    pub channel: Option<String>,
    pub bitrate: Option<u32>,
    pub fd_bitrate: Option<u32>,
    pub connected_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub signal_database: Option<PathBuf>,
    pub diagnostic_database: Option<PathBuf>,
    pub ecu: Option<String>,
    pub logging: LogProgress,
    pub stats: ListenerStats,
    pub signals: usize,
}

/// One CAN network with its databases, listener, logger and diagnostics
pub struct NetworkSession {
    id: Uuid,
    name: RwLock<String>,
    config: NetworkConfig,
    factory: Arc<dyn FrameSourceFactory>,
    state: RwLock<ConnectionState>,
    last_error: RwLock<Option<String>>,
    connection: RwLock<Option<Connection>>,
    signals: RwLock<Option<Arc<SignalDatabase>>>,
    layers: RwLock<Option<Arc<DiagnosticDatabase>>>,
    ecu: RwLock<Option<String>>,
    listener: BusListener,
    logger: Arc<FrameLogger>,
    engine: DiagnosticEngine,
}

impl NetworkSession {
    pub fn new(config: NetworkConfig, factory: Arc<dyn FrameSourceFactory>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: RwLock::new(config.name.clone()),
            listener: BusListener::new(config.listener.clone()),
            logger: Arc::new(FrameLogger::new(Duration::from_millis(
                config.logging.flush_interval_ms,
            ))),
            engine: DiagnosticEngine::new(config.diagnostics.clone()),
            factory,
            state: RwLock::new(ConnectionState::Offline),
            last_error: RwLock::new(None),
            connection: RwLock::new(None),
            signals: RwLock::new(None),
            layers: RwLock::new(None),
            ecu: RwLock::new(config.ecu.clone()),
            config,
        }
    }

    /// Create a session and load the databases named in its configuration
    pub fn from_config(
        config: NetworkConfig,
        factory: Arc<dyn FrameSourceFactory>,
    ) -> Result<Self, SessionError> {
        let session = Self::new(config, factory);
        if let Some(path) = session.config.signal_database.clone() {
            session.load_signal_database(path)?;
        }
        if let Some(path) = session.config.diagnostic_database.clone() {
            session.load_diagnostic_database(path)?;
        }
        if let Some(ecu) = session.config.ecu.clone() {
            session.select_ecu(&ecu)?;
        }
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn rename(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Current connection state
    ///
    /// An online session whose listener stopped on a bus fault reports
    /// `Error`.
    pub fn state(&self) -> ConnectionState {
        let state = *self.state.read();
        if state == ConnectionState::Online && self.listener.state() == ListenerState::Stopped {
            if let Some(fault) = self.listener.fault() {
                *self.last_error.write() = Some(fault);
                *self.state.write() = ConnectionState::Error;
                return ConnectionState::Error;
            }
        }
        state
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    // =========================================================================
    // Databases
    // =========================================================================

    /// Load a DBC or YAML signal database
    ///
    /// Takes effect for decoding on the next connect.
    pub fn load_signal_database(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let db = SignalDatabase::load(path.as_ref())?;
        info!(
            network = %self.name(),
            path = %path.as_ref().display(),
            messages = db.len(),
            signals = db.signal_count(),
            "Signal database loaded"
        );
        self.set_signal_database(db);
        Ok(())
    }

    pub fn set_signal_database(&self, db: SignalDatabase) {
        *self.signals.write() = Some(Arc::new(db));
    }

    pub fn signal_database(&self) -> Option<Arc<SignalDatabase>> {
        self.signals.read().clone()
    }

    /// Load a diagnostic description or bundled package
    pub fn load_diagnostic_database(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let db = DiagnosticDatabase::load(path.as_ref())?;
        info!(
            network = %self.name(),
            path = %path.as_ref().display(),
            ecus = db.len(),
            "Diagnostic database loaded"
        );
        self.set_diagnostic_database(db);
        Ok(())
    }

    /// Replace the diagnostic database; a selected ECU it lacks is deselected
    pub fn set_diagnostic_database(&self, db: DiagnosticDatabase) {
        let mut ecu = self.ecu.write();
        if let Some(name) = ecu.as_deref() {
            if db.ecu(name).is_none() {
                warn!(network = %self.name(), ecu = name, "Selected ECU not in new database");
                *ecu = None;
            }
        }
        *self.layers.write() = Some(Arc::new(db));
    }

    pub fn diagnostic_database(&self) -> Option<Arc<DiagnosticDatabase>> {
        self.layers.read().clone()
    }

    /// Select the ECU layer diagnostics run against
    pub fn select_ecu(&self, name: &str) -> Result<(), SessionError> {
        let layers = self
            .diagnostic_database()
            .ok_or(ConfigurationError::MissingDatabase("diagnostic"))?;
        if layers.ecu(name).is_none() {
            return Err(ConfigurationError::UnknownEcu(name.to_string()).into());
        }
        *self.ecu.write() = Some(name.to_string());
        info!(network = %self.name(), ecu = name, "ECU selected");
        Ok(())
    }

    pub fn selected_ecu(&self) -> Option<String> {
        self.ecu.read().clone()
    }

    fn selected_layer(&self) -> Result<EcuLayer, ConfigurationError> {
        let name = self.selected_ecu().ok_or(ConfigurationError::NoEcuSelected)?;
        let layers = self
            .diagnostic_database()
            .ok_or(ConfigurationError::MissingDatabase("diagnostic"))?;
        layers
            .ecu(&name)
            .cloned()
            .ok_or(ConfigurationError::UnknownEcu(name))
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect with the channel and bitrates from the configuration
    pub async fn connect_configured(&self) -> Result<(), SessionError> {
        let config = &self.config;
        self.connect(config.channel.clone(), config.bitrate, config.fd_bitrate)
            .await
    }

    /// Open a channel and start the bus listener
    pub async fn connect(
        &self,
        channel: ChannelDescriptor,
        bitrate: u32,
        fd_bitrate: Option<u32>,
    ) -> Result<(), SessionError> {
        {
            let mut state = self.state.write();
            if matches!(*state, ConnectionState::Connecting | ConnectionState::Online) {
                return Err(SessionError::InvalidState(format!(
                    "network '{}' is already connected",
                    self.name()
                )));
            }
            *state = ConnectionState::Connecting;
        }
        info!(network = %self.name(), channel = %channel.interface(), driver = %channel.driver, bitrate, "Connecting");

        match self.open(&channel, bitrate, fd_bitrate) {
            Ok(connection) => {
                *self.connection.write() = Some(connection);
                *self.last_error.write() = None;
                *self.state.write() = ConnectionState::Online;
                info!(network = %self.name(), "Online");
                Ok(())
            }
            Err(e) => {
                warn!(network = %self.name(), error = %e, "Connect failed");
                *self.last_error.write() = Some(e.to_string());
                *self.state.write() = ConnectionState::Error;
                Err(e)
            }
        }
    }

    fn open(
        &self,
        channel: &ChannelDescriptor,
        bitrate: u32,
        fd_bitrate: Option<u32>,
    ) -> Result<Connection, SessionError> {
        self.config.diagnostics.isotp.validate()?;
        let source = self.factory.open(channel, bitrate, fd_bitrate)?;
        let router = FrameRouter::new();
        if let Err(e) = self.listener.start(
            source.clone(),
            self.signal_database(),
            self.logger.clone(),
            router.clone(),
        ) {
            source.close();
            return Err(e);
        }
        Ok(Connection {
            source,
            router,
            channel: channel.clone(),
            bitrate,
            fd_bitrate,
            connected_at: Utc::now(),
        })
    }

    /// Stop the listener, wait for it to finish, then release the channel
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let connection = self.connection.write().take();
        let Some(connection) = connection else {
            *self.state.write() = ConnectionState::Offline;
            return Ok(());
        };

        self.listener.stop().await;
        connection.router.close();
        connection.source.close();
        self.listener.cache().clear();
        *self.state.write() = ConnectionState::Offline;
        info!(network = %self.name(), channel = %connection.source.describe(), "Disconnected");
        Ok(())
    }

    /// Stop logging and disconnect
    pub async fn shutdown(&self) {
        if self.logger.is_running() {
            if let Err(e) = self.logger.stop().await {
                warn!(network = %self.name(), error = %e, "Failed to stop logging");
            }
        }
        if let Err(e) = self.disconnect().await {
            warn!(network = %self.name(), error = %e, "Failed to disconnect");
        }
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.listener.subscribe()
    }

    /// Latest decoded values
    pub fn signals(&self) -> &SignalCache {
        self.listener.cache()
    }

    pub fn stats(&self) -> ListenerStats {
        self.listener.stats()
    }

    /// Start logging to `path`, or to the configured log file
    pub fn start_logging(&self, path: Option<PathBuf>) -> Result<PathBuf, SessionError> {
        let path = path
            .or_else(|| self.config.logging.path.clone())
            .ok_or_else(|| ConfigurationError::Invalid("no log file given".to_string()))?;
        self.logger.start(&path)?;
        Ok(path)
    }

    /// Stop logging; returns the number of rows written
    pub async fn stop_logging(&self) -> Result<u64, SessionError> {
        Ok(self.logger.stop().await?)
    }

    pub fn logging(&self) -> LogProgress {
        self.logger.progress()
    }

    /// Message count updates while logging
    pub fn subscribe_logging(&self) -> tokio::sync::watch::Receiver<u64> {
        self.logger.subscribe()
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Run a request against the selected ECU
    pub async fn diagnose(&self, request: &DiagnosticRequest) -> Result<DiagnosticResult, SessionError> {
        let layer = self.selected_layer()?;
        let bus = {
            let connection = self.connection.read();
            let connection = connection.as_ref().ok_or(SessionError::NotConnected)?;
            BusAccess::Routed {
                source: connection.source.clone(),
                router: connection.router.clone(),
            }
        };
        Ok(self.engine.execute(&bus, &layer, request).await?)
    }

    pub fn engine(&self) -> &DiagnosticEngine {
        &self.engine
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state();
        let connection = self.connection.read();
        SessionInfo {
            id: self.id,
            name: self.name(),
            state,
            channel: connection.as_ref().map(|c| c.channel.interface()),
            bitrate: connection.as_ref().map(|c| c.bitrate),
            fd_bitrate: connection.as_ref().and_then(|c| c.fd_bitrate),
            connected_at: connection.as_ref().map(|c| c.connected_at),
            error: self.last_error(),
            signal_database: self
                .signal_database()
                .and_then(|db| db.source().map(Path::to_path_buf)),
            diagnostic_database: self
                .diagnostic_database()
                .and_then(|db| db.source().map(Path::to_path_buf)),
            ecu: self.selected_ecu(),
            logging: self.logging(),
            stats: self.stats(),
            signals: self.listener.cache().len(),
        }
    }
}

impl Drop for NetworkSession {
    fn drop(&mut self) {
        self.listener.request_stop();
        self.logger.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedEcu;
    use crate::transport::DefaultFrameSourceFactory;
    use crate::frame::Frame;
    use crate::transport::FrameSource;
    use candiag_layers::{LayerMeta, ParamDef, ParamType, ServiceDef};

    fn layers() -> DiagnosticDatabase {
        DiagnosticDatabase::from_layers(
            LayerMeta::default(),
            vec![EcuLayer::new("Engine")
                .with_addressing(0x7E0, 0x7E8)
                .with_service(
                    ServiceDef::new("ReadDataByIdentifier", 0x22)
                        .with_request(ParamDef::new("did", ParamType::Uint16))
                        .with_response(ParamDef::new("did", ParamType::Uint16))
                        .with_response(ParamDef::new("value", ParamType::Ascii)),
                )],
        )
        .unwrap()
    }

    fn session(factory: Arc<DefaultFrameSourceFactory>, bus: &str) -> NetworkSession {
        let mut config = NetworkConfig::new("Powertrain", ChannelDescriptor::virtual_bus(bus, 0));
        config.listener.poll_timeout_ms = 20;
        NetworkSession::new(config, factory)
    }

    #[tokio::test]
    async fn test_connect_disconnect() {
        let factory = Arc::new(DefaultFrameSourceFactory::new());
        let session = session(factory.clone(), "session-connect");
        assert_eq!(session.state(), ConnectionState::Offline);

        session.connect_configured().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Online);
        assert_eq!(session.info().channel.as_deref(), Some("session-connect0"));
        assert!(matches!(
            session.connect_configured().await,
            Err(SessionError::InvalidState(_))
        ));

        session.disconnect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Offline);
        assert!(session.info().channel.is_none());
        assert_eq!(factory.virtual_bus("session-connect").endpoint_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_is_error_state() {
        let factory = Arc::new(DefaultFrameSourceFactory::new());
        let session = session(factory, "session-fail");
        let err = session
            .connect(ChannelDescriptor::virtual_bus("session-fail", 0), 0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Connection(_)));
        assert_eq!(session.state(), ConnectionState::Error);
        assert!(session.last_error().is_some());
    }

    #[tokio::test]
    async fn test_bus_fault_reports_error() {
        let factory = Arc::new(DefaultFrameSourceFactory::new());
        let session = session(factory.clone(), "session-fault");
        let mut events = session.subscribe();
        session.connect_configured().await.unwrap();

        factory.virtual_bus("session-fault").inject_fault("bus off");
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, NetworkEvent::ConnectionClosed { fault: Some(_) }));
        assert_eq!(session.state(), ConnectionState::Error);
        session.disconnect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Offline);
    }

    #[tokio::test]
    async fn test_diagnose_requires_selection_and_connection() {
        let factory = Arc::new(DefaultFrameSourceFactory::new());
        let session = session(factory, "session-select");
        let request = DiagnosticRequest::ReadDataByIdentifier { did: 0xF190 };

        assert!(matches!(
            session.select_ecu("Engine"),
            Err(SessionError::Configuration(ConfigurationError::MissingDatabase(_)))
        ));
        session.set_diagnostic_database(layers());
        assert!(matches!(
            session.select_ecu("Brakes"),
            Err(SessionError::Configuration(ConfigurationError::UnknownEcu(_)))
        ));
        assert!(matches!(
            session.diagnose(&request).await,
            Err(SessionError::Configuration(ConfigurationError::NoEcuSelected))
        ));
        session.select_ecu("Engine").unwrap();
        assert!(matches!(
            session.diagnose(&request).await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_diagnose_while_listening() {
        let factory = Arc::new(DefaultFrameSourceFactory::new());
        let bus = factory.virtual_bus("session-diag");
        let ecu = SimulatedEcu::new("Engine", 0x7E0, 0x7E8).spawn(bus.endpoint());
        let traffic = bus.endpoint();

        let session = session(factory, "session-diag");
        session.set_diagnostic_database(layers());
        session.select_ecu("Engine").unwrap();
        session.connect_configured().await.unwrap();
        traffic.send(&Frame::new(0x100, vec![1])).unwrap();

        let result = session
            .diagnose(&DiagnosticRequest::ReadDataByIdentifier { did: 0xF190 })
            .await
            .unwrap();
        assert!(result.is_positive());
        assert_eq!(result.values["value"], "1HGCM82633A123456");
        // Three response frames went to the exchange, not the decoder
        assert_eq!(session.stats().diagnostic_frames, 3);

        session.shutdown().await;
        ecu.shutdown().await;
    }
}
