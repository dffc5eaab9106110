//! Registry of network sessions

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;
use uuid::Uuid;

use super::{NetworkSession, SessionInfo};
use crate::config::{AppConfig, NetworkConfig};
use crate::error::SessionError;
use crate::transport::FrameSourceFactory;

/// Holds every open network session by id
pub struct NetworkManager {
    factory: Arc<dyn FrameSourceFactory>,
    sessions: RwLock<HashMap<Uuid, Arc<NetworkSession>>>,
}

impl NetworkManager {
    pub fn new(factory: Arc<dyn FrameSourceFactory>) -> Self {
        Self {
            factory,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create a session per configured network
    pub fn from_config(
        config: &AppConfig,
        factory: Arc<dyn FrameSourceFactory>,
    ) -> Result<Self, SessionError> {
        let manager = Self::new(factory);
        for network in &config.networks {
            manager.add_configured(network.clone())?;
        }
        Ok(manager)
    }

    /// Add a session without loading databases
    pub fn add(&self, config: NetworkConfig) -> Arc<NetworkSession> {
        self.insert(NetworkSession::new(config, self.factory.clone()))
    }

    /// Add a session and load the databases its configuration names
    pub fn add_configured(&self, config: NetworkConfig) -> Result<Arc<NetworkSession>, SessionError> {
        Ok(self.insert(NetworkSession::from_config(config, self.factory.clone())?))
    }

    fn insert(&self, session: NetworkSession) -> Arc<NetworkSession> {
        let session = Arc::new(session);
        info!(network = %session.name(), id = %session.id(), "Network added");
        self.sessions.write().insert(session.id(), session.clone());
        session
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<NetworkSession>> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn find(&self, name: &str) -> Option<Arc<NetworkSession>> {
        self.sessions
            .read()
            .values()
            .find(|s| s.name() == name)
            .cloned()
    }

    pub fn rename(&self, id: Uuid, name: impl Into<String>) -> Result<(), SessionError> {
        let session = self.get(id).ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.rename(name);
        Ok(())
    }

    /// Remove a session, stopping its logger and listener first
    pub async fn remove(&self, id: Uuid) -> Result<(), SessionError> {
        let session = self
            .sessions
            .write()
            .remove(&id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.shutdown().await;
        info!(network = %session.name(), %id, "Network removed");
        Ok(())
    }

    /// Sessions sorted by name
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.sessions.read().values().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Shut every session down; used on application exit
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<NetworkSession>> =
            self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.shutdown().await;
        }
        if !sessions.is_empty() {
            info!(count = sessions.len(), "All networks shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelDescriptor;
    use crate::session::ConnectionState;
    use crate::transport::DefaultFrameSourceFactory;

    fn manager() -> (Arc<DefaultFrameSourceFactory>, NetworkManager) {
        let factory = Arc::new(DefaultFrameSourceFactory::new());
        (factory.clone(), NetworkManager::new(factory))
    }

    #[tokio::test]
    async fn test_add_find_rename_remove() {
        let (_, manager) = manager();
        let body = manager.add(NetworkConfig::new("Body", ChannelDescriptor::virtual_bus("m1", 0)));
        manager.add(NetworkConfig::new("Chassis", ChannelDescriptor::virtual_bus("m2", 0)));
        assert_eq!(manager.len(), 2);

        assert_eq!(manager.find("Body").unwrap().id(), body.id());
        manager.rename(body.id(), "Comfort").unwrap();
        assert!(manager.find("Body").is_none());
        let names: Vec<String> = manager.list().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["Chassis", "Comfort"]);

        manager.remove(body.id()).await.unwrap();
        assert!(manager.get(body.id()).is_none());
        assert!(matches!(
            manager.remove(body.id()).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_stops_running_session() {
        let (factory, manager) = manager();
        let mut config = NetworkConfig::new("Body", ChannelDescriptor::virtual_bus("m3", 0));
        config.listener.poll_timeout_ms = 20;
        let session = manager.add(config);
        session.connect_configured().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        session.start_logging(Some(dir.path().join("body.csv"))).unwrap();
        manager.remove(session.id()).await.unwrap();

        assert_eq!(session.state(), ConnectionState::Offline);
        assert!(!session.logging().running);
        assert_eq!(factory.virtual_bus("m3").endpoint_count(), 0);
    }

    #[tokio::test]
    async fn test_from_config_and_shutdown_all() {
        let config = AppConfig::from_toml(
            r#"
            [[networks]]
            name = "Bench"
            [networks.channel]
            driver = "virtual"
            app_name = "m4"
            channel_index = 0
            "#,
        )
        .unwrap();
        let manager = NetworkManager::from_config(&config, Arc::new(DefaultFrameSourceFactory::new()))
            .unwrap();
        let bench = manager.find("Bench").unwrap();
        bench.connect_configured().await.unwrap();

        manager.shutdown_all().await;
        assert!(manager.is_empty());
        assert_eq!(bench.state(), ConnectionState::Offline);
    }
}
