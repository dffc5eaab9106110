//! Network configuration
//!
//! This module contains configuration types for networks, including the
//! channel, bus timing, databases, listener, logging and diagnostic settings.
//!
//! # Example
//!
//! ```toml
//! [[networks]]
//! name = "Powertrain"
//! bitrate = 500000
//! signal_database = "powertrain.dbc"
//! diagnostic_database = "powertrain.dpk"
//! ecu = "Engine"
//!
//! [networks.channel]
//! driver = "socketcan"
//! app_name = "can"
//! channel_index = 0
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
}

impl AppConfig {
    /// Read a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::Invalid(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigurationError> {
        toml::from_str(content).map_err(|e| ConfigurationError::Invalid(e.to_string()))
    }

    pub fn network(&self, name: &str) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.name == name)
    }
}

/// One logical CAN network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Display name
    pub name: String,
    pub channel: ChannelDescriptor,
    /// Nominal bitrate in bit/s
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// CAN FD data-phase bitrate in bit/s
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fd_bitrate: Option<u32>,
    /// DBC or YAML signal database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_database: Option<PathBuf>,
    /// Diagnostic description or bundled package
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic_database: Option<PathBuf>,
    /// ECU layer selected for diagnostics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecu: Option<String>,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

fn default_bitrate() -> u32 {
    500000
}

impl NetworkConfig {
    pub fn new(name: impl Into<String>, channel: ChannelDescriptor) -> Self {
        Self {
            name: name.into(),
            channel,
            bitrate: default_bitrate(),
            fd_bitrate: None,
            signal_database: None,
            diagnostic_database: None,
            ecu: None,
            listener: ListenerConfig::default(),
            logging: LoggingConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

// =============================================================================
// Channel
// =============================================================================

/// Frame source driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    /// Raw SocketCAN interface (Linux only)
    SocketCan,
    /// In-process virtual bus
    Virtual,
    /// Trace file played back as a channel
    Replay,
}

impl std::fmt::Display for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Driver::SocketCan => write!(f, "socketcan"),
            Driver::Virtual => write!(f, "virtual"),
            Driver::Replay => write!(f, "replay"),
        }
    }
}

/// Hardware channel as produced by channel enumeration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub driver: Driver,
    /// Vendor/application name; the interface prefix for SocketCAN, the bus
    /// name for the virtual driver
    pub app_name: String,
    /// Zero-based channel index
    #[serde(default)]
    pub channel_index: u32,
    /// Channel supports CAN FD
    #[serde(default)]
    pub fd_capable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay: Option<ReplayOptions>,
}

impl ChannelDescriptor {
    pub fn new(driver: Driver, app_name: impl Into<String>, channel_index: u32) -> Self {
        Self {
            driver,
            app_name: app_name.into(),
            channel_index,
            fd_capable: false,
            replay: None,
        }
    }

    pub fn virtual_bus(bus: impl Into<String>, channel_index: u32) -> Self {
        Self::new(Driver::Virtual, bus, channel_index)
    }

    pub fn replay(options: ReplayOptions) -> Self {
        let mut channel = Self::new(Driver::Replay, "replay", 0);
        channel.replay = Some(options);
        channel
    }

    pub fn with_fd(mut self) -> Self {
        self.fd_capable = true;
        self
    }

    /// Interface name, e.g. `can0`
    pub fn interface(&self) -> String {
        format!("{}{}", self.app_name, self.channel_index)
    }

    /// Check bitrate settings against this channel
    pub fn validate(&self, bitrate: u32, fd_bitrate: Option<u32>) -> Result<(), ConfigurationError> {
        if self.app_name.trim().is_empty() {
            return Err(ConfigurationError::MissingChannel);
        }
        if bitrate == 0 {
            return Err(ConfigurationError::InvalidBitrate(
                "bitrate must be greater than zero".to_string(),
            ));
        }
        if let Some(data) = fd_bitrate {
            if !self.fd_capable {
                return Err(ConfigurationError::FdNotSupported(self.interface()));
            }
            if data < bitrate {
                return Err(ConfigurationError::InvalidBitrate(format!(
                    "FD data bitrate {} is below nominal bitrate {}",
                    data, bitrate
                )));
            }
        }
        if self.driver == Driver::Replay && self.replay.is_none() {
            return Err(ConfigurationError::Invalid(
                "replay channel requires a trace file".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trace replay settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayOptions {
    pub path: PathBuf,
    /// Playback speed multiplier; 0 plays as fast as possible
    #[serde(default = "default_speed")]
    pub speed: f64,
}

fn default_speed() -> f64 {
    1.0
}

impl ReplayOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            speed: default_speed(),
        }
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }
}

// =============================================================================
// Listener and Logging
// =============================================================================

/// Bus listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Receive timeout per loop iteration; bounds stop latency
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub allow_truncated: bool,
    #[serde(default)]
    pub resolve_choices: bool,
    /// Capacity of the notification channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_poll_timeout() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout(),
            allow_truncated: default_true(),
            resolve_choices: false,
            event_capacity: default_event_capacity(),
        }
    }
}

impl ListenerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Frame logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log file for this network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Drain and flush cadence
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
}

fn default_flush_interval() -> u64 {
    50
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            path: None,
            flush_interval_ms: default_flush_interval(),
        }
    }
}

// =============================================================================
// Diagnostics
// =============================================================================

/// Diagnostic engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    /// Upper bound while the ECU keeps answering "response pending"
    #[serde(default = "default_pending_timeout")]
    pub response_pending_timeout_ms: u64,
    #[serde(default)]
    pub isotp: IsoTpConfig,
}

fn default_response_timeout() -> u64 {
    5000
}

fn default_pending_timeout() -> u64 {
    30000
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout(),
            response_pending_timeout_ms: default_pending_timeout(),
            isotp: IsoTpConfig::default(),
        }
    }
}

impl DiagnosticsConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn response_pending_timeout(&self) -> Duration {
        Duration::from_millis(self.response_pending_timeout_ms)
    }
}

/// Segmenter options of the tester side
///
/// Addressing is not configured here; it comes from the ECU layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsoTpConfig {
    /// Frame data length: 8 for classic CAN, up to 64 for CAN FD
    #[serde(default = "default_tx_dl")]
    pub tx_dl: u8,
    /// Pad frames to full length with this byte
    #[serde(default = "default_padding")]
    pub padding: Option<u8>,
    /// Block size announced in our flow control frames
    #[serde(default)]
    pub block_size: u8,
    /// STmin announced in our flow control frames (raw encoding)
    #[serde(default)]
    pub st_min: u8,
    /// Wait for flow control after a first frame or block
    #[serde(default = "default_n_timeout")]
    pub n_bs_ms: u64,
    /// Wait for the next consecutive frame
    #[serde(default = "default_n_timeout")]
    pub n_cr_ms: u64,
    /// Accepted flow control WAIT frames per exchange
    #[serde(default = "default_max_wait_frames")]
    pub max_wait_frames: u32,
    /// Largest segmented payload we accept; longer First Frames get an
    /// overflow flow control
    #[serde(default = "default_max_rx_len")]
    pub max_rx_len: usize,
}

fn default_tx_dl() -> u8 {
    8
}

fn default_padding() -> Option<u8> {
    Some(0xCC)
}

fn default_n_timeout() -> u64 {
    1000
}

fn default_max_wait_frames() -> u32 {
    10
}

fn default_max_rx_len() -> usize {
    4095
}

impl Default for IsoTpConfig {
    fn default() -> Self {
        Self {
            tx_dl: default_tx_dl(),
            padding: default_padding(),
            block_size: 0,
            st_min: 0,
            n_bs_ms: default_n_timeout(),
            n_cr_ms: default_n_timeout(),
            max_wait_frames: default_max_wait_frames(),
            max_rx_len: default_max_rx_len(),
        }
    }
}

impl IsoTpConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self.tx_dl {
            8 | 12 | 16 | 20 | 24 | 32 | 48 | 64 => Ok(()),
            other => Err(ConfigurationError::Invalid(format!(
                "tx_dl must be 8 or a CAN FD length, got {}",
                other
            ))),
        }
    }

    pub fn is_fd(&self) -> bool {
        self.tx_dl > 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_defaults_from_toml() {
        let config = AppConfig::from_toml(
            r#"
[[networks]]
name = "Body"

[networks.channel]
driver = "virtual"
app_name = "bench"
"#,
        )
        .unwrap();

        let net = config.network("Body").unwrap();
        assert_eq!(net.bitrate, 500000);
        assert_eq!(net.channel.driver, Driver::Virtual);
        assert_eq!(net.channel.interface(), "bench0");
        assert_eq!(net.listener.poll_timeout_ms, 100);
        assert!(net.listener.allow_truncated);
        assert!(!net.listener.resolve_choices);
        assert_eq!(net.logging.flush_interval_ms, 50);
        assert_eq!(net.diagnostics.response_timeout_ms, 5000);
        assert_eq!(net.diagnostics.response_pending_timeout_ms, 30000);
        assert_eq!(net.diagnostics.isotp, IsoTpConfig::default());
    }

    #[test]
    fn test_channel_validation() {
        let classic = ChannelDescriptor::new(Driver::SocketCan, "can", 0);
        assert!(classic.validate(500000, None).is_ok());
        assert!(matches!(
            classic.validate(0, None),
            Err(ConfigurationError::InvalidBitrate(_))
        ));
        assert!(matches!(
            classic.validate(500000, Some(2000000)),
            Err(ConfigurationError::FdNotSupported(_))
        ));

        let fd = classic.clone().with_fd();
        assert!(fd.validate(500000, Some(2000000)).is_ok());
        assert!(matches!(
            fd.validate(500000, Some(250000)),
            Err(ConfigurationError::InvalidBitrate(_))
        ));

        let unnamed = ChannelDescriptor::new(Driver::SocketCan, " ", 0);
        assert_eq!(
            unnamed.validate(500000, None),
            Err(ConfigurationError::MissingChannel)
        );
    }

    #[test]
    fn test_replay_requires_path() {
        let channel = ChannelDescriptor::new(Driver::Replay, "replay", 0);
        assert!(channel.validate(500000, None).is_err());
        let channel = ChannelDescriptor::replay(ReplayOptions::new("trace.csv"));
        assert!(channel.validate(500000, None).is_ok());
    }

    #[test]
    fn test_isotp_tx_dl_validation() {
        assert!(IsoTpConfig::default().validate().is_ok());
        let fd = IsoTpConfig {
            tx_dl: 64,
            ..Default::default()
        };
        assert!(fd.validate().is_ok() && fd.is_fd());
        let bad = IsoTpConfig {
            tx_dl: 10,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
