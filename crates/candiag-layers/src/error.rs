//! Error types for diagnostic layer loading and parameter coding

use thiserror::Error;

/// Errors raised while loading a [`DiagnosticDatabase`](crate::DiagnosticDatabase)
#[derive(Debug, Error)]
pub enum LayerError {
    #[error("unsupported diagnostic description format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid diagnostic description: {0}")]
    Invalid(String),

    #[error("diagnostic package contains no ECU layers")]
    EmptyPackage,

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while encoding or decoding service parameters
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("missing value for parameter '{0}'")]
    MissingValue(String),

    #[error("{supplied} values supplied but the service declares {declared} parameters")]
    TooManyValues { supplied: usize, declared: usize },

    #[error("value {value:#X} does not fit parameter '{param}' ({bits} bits)")]
    ValueOutOfRange { param: String, value: u64, bits: u32 },

    #[error("parameter '{param}' expects {expected} bytes, got {actual}")]
    LengthMismatch {
        param: String,
        expected: usize,
        actual: usize,
    },

    #[error("parameter '{param}' cannot take {kind} values")]
    TypeMismatch { param: String, kind: &'static str },

    #[error("data too short for '{param}': expected {expected} bytes, got {actual}")]
    DataTooShort {
        param: String,
        expected: usize,
        actual: usize,
    },

    #[error("constant parameter '{param}' expected {expected:#X}, got {actual:#X}")]
    ConstMismatch {
        param: String,
        expected: u64,
        actual: u64,
    },
}
