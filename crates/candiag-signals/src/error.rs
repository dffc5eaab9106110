//! Error types for signal database loading, decoding and encoding

use thiserror::Error;

/// Errors raised while building a [`SignalDatabase`](crate::SignalDatabase)
#[derive(Debug, Error)]
pub enum SignalError {
    /// The file extension is not a known database format
    #[error("unsupported signal database format: {0}")]
    UnsupportedFormat(String),

    /// DBC text could not be parsed
    #[error("DBC parse error: {0}")]
    Dbc(String),

    /// Structural problem in an otherwise parseable database
    #[error("invalid signal database: {0}")]
    Invalid(String),

    /// Invalid frame identifier string
    #[error("invalid frame id: {0}")]
    InvalidFrameId(String),

    /// YAML parsing error
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the frame decoder
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// No message definition matches the frame identifier
    #[error("unknown frame id 0x{0:X}")]
    UnknownFrame(u32),

    /// Payload length incompatible with the message layout
    #[error("malformed data for 0x{id:X}: expected {expected} bytes, got {actual}")]
    MalformedData {
        id: u32,
        expected: usize,
        actual: usize,
    },
}

/// Errors raised when packing physical values into a payload
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error("missing value for signal '{0}'")]
    MissingSignal(String),

    #[error("value {value} for signal '{signal}' does not fit raw range [{min}, {max}]")]
    ValueOutOfRange {
        signal: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("signal '{signal}' exceeds the {length}-byte payload")]
    LayoutOverflow { signal: String, length: usize },
}

/// Parse a frame identifier string (hex)
///
/// Accepts formats: "100", "0x100", "0X18DAF110", "7e8"
pub fn parse_frame_id(s: &str) -> Result<u32, SignalError> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u32::from_str_radix(digits, 16).map_err(|_| SignalError::InvalidFrameId(s.to_string()))
}

/// Format a frame identifier as uppercase hex without prefix
pub fn format_frame_id(id: u32) -> String {
    format!("{:X}", id)
}
