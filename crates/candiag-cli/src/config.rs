//! Configuration file handling for candiag

use anyhow::{Context, Result};
use candiag_core::{AppConfig, NetworkConfig};
use std::path::{Path, PathBuf};

/// Resolved configuration and where it came from
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub app: AppConfig,
    /// File the configuration was read from, if any
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load the configuration named on the command line, or the default file
    ///
    /// An explicit path must exist. A missing default file yields an empty
    /// configuration.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load_from(path),
            None => {
                let path = Self::config_path()?;
                if path.exists() {
                    Self::load_from(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let app = AppConfig::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        let app = Self::rebase(app, path.parent().unwrap_or_else(|| Path::new(".")));
        tracing::debug!(path = %path.display(), networks = app.networks.len(), "Loaded configuration");
        Ok(Self {
            app,
            path: Some(path.to_path_buf()),
        })
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("candiag");

        Ok(config_dir.join("config.toml"))
    }

    /// The named network section
    pub fn network(&self, name: &str) -> Result<NetworkConfig> {
        self.app.network(name).cloned().with_context(|| {
            let known: Vec<&str> = self.app.networks.iter().map(|n| n.name.as_str()).collect();
            match &self.path {
                Some(path) => format!(
                    "Network '{}' not found in {} (known: {})",
                    name,
                    path.display(),
                    known.join(", ")
                ),
                None => format!("Network '{}' not found: no configuration file", name),
            }
        })
    }

    /// Resolve relative database and trace paths against the config file's directory
    fn rebase(mut app: AppConfig, base: &Path) -> AppConfig {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        for network in &mut app.networks {
            if let Some(p) = network.signal_database.as_mut() {
                join(p);
            }
            if let Some(p) = network.diagnostic_database.as_mut() {
                join(p);
            }
            if let Some(replay) = network.channel.replay.as_mut() {
                join(&mut replay.path);
            }
        }
        app
    }
}
