//! Signal database - frame identifier to message layout
//!
//! Built once from a DBC or YAML/JSON file, then shared read-only (usually
//! behind an `Arc`) between the bus listener, trace import and any number
//! of readers.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dbc::parse_dbc;
use crate::decode::{decode_with, DecodeOptions};
use crate::error::{DecodeError, SignalError};
use crate::types::{DecodedMessage, MessageDef};

/// Metadata about the database
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// On-disk YAML/JSON layout
#[derive(Debug, Deserialize)]
struct DefinitionFile {
    #[serde(default)]
    meta: Option<DatabaseMeta>,
    #[serde(default)]
    messages: Vec<MessageDef>,
}

/// Immutable mapping frame id → [`MessageDef`]
#[derive(Debug, Clone, Default)]
pub struct SignalDatabase {
    meta: DatabaseMeta,
    messages: BTreeMap<u32, MessageDef>,
    by_name: HashMap<String, u32>,
    source: Option<PathBuf>,
}

impl SignalDatabase {
    /// Load a database file, choosing the parser from the extension
    ///
    /// `.dbc` files go through the DBC parser; `.yaml`, `.yml` and `.json`
    /// use the native definition format.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SignalError> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let content = std::fs::read_to_string(path)?;
        let mut db = match ext.as_str() {
            "dbc" => Self::from_dbc(&content)?,
            "yaml" | "yml" => Self::from_yaml(&content)?,
            "json" => Self::from_json(&content)?,
            other => return Err(SignalError::UnsupportedFormat(other.to_string())),
        };

        if db.meta.name.is_none() {
            db.meta.name = path.file_stem().map(|s| s.to_string_lossy().into_owned());
        }
        db.source = Some(path.to_path_buf());

        info!(
            path = %path.display(),
            messages = db.len(),
            signals = db.signal_count(),
            "Signal database loaded"
        );
        Ok(db)
    }

    /// Parse DBC text
    pub fn from_dbc(content: &str) -> Result<Self, SignalError> {
        Self::from_messages(parse_dbc(content)?)
    }

    /// Parse the YAML definition format
    pub fn from_yaml(content: &str) -> Result<Self, SignalError> {
        let file: DefinitionFile = serde_yaml::from_str(content)?;
        let mut db = Self::from_messages(file.messages)?;
        db.meta = file.meta.unwrap_or_default();
        Ok(db)
    }

    /// Parse the JSON definition format
    pub fn from_json(content: &str) -> Result<Self, SignalError> {
        let file: DefinitionFile = serde_json::from_str(content)?;
        let mut db = Self::from_messages(file.messages)?;
        db.meta = file.meta.unwrap_or_default();
        Ok(db)
    }

    /// Build from message definitions
    ///
    /// Duplicate frame ids and duplicate signal names inside a message are
    /// rejected.
    pub fn from_messages(messages: impl IntoIterator<Item = MessageDef>) -> Result<Self, SignalError> {
        let mut db = Self::default();
        for message in messages {
            let mut seen = std::collections::HashSet::new();
            for signal in &message.signals {
                if !seen.insert(signal.name.as_str()) {
                    return Err(SignalError::Invalid(format!(
                        "duplicate signal '{}' in message '{}'",
                        signal.name, message.name
                    )));
                }
                if signal.bit_length == 0 || signal.bit_length > 64 {
                    return Err(SignalError::Invalid(format!(
                        "signal '{}' has unsupported length {}",
                        signal.name, signal.bit_length
                    )));
                }
            }
            if message.signals.iter().filter(|s| s.multiplexor).count() > 1 {
                warn!(message = %message.name, "More than one multiplexor; using the first");
            }
            if db.messages.contains_key(&message.id) {
                return Err(SignalError::Invalid(format!(
                    "duplicate frame id 0x{:X}",
                    message.id
                )));
            }
            db.by_name.insert(message.name.clone(), message.id);
            db.messages.insert(message.id, message);
        }
        Ok(db)
    }

    /// Look up the layout of a frame
    pub fn lookup(&self, frame_id: u32) -> Option<&MessageDef> {
        self.messages.get(&frame_id)
    }

    pub fn message_by_name(&self, name: &str) -> Option<&MessageDef> {
        self.by_name.get(name).and_then(|id| self.messages.get(id))
    }

    /// All messages in ascending frame id order
    pub fn messages(&self) -> impl Iterator<Item = &MessageDef> {
        self.messages.values()
    }

    /// Look up and decode a frame
    ///
    /// Fails with [`DecodeError::UnknownFrame`] before looking at the data
    /// when no message matches.
    pub fn decode(
        &self,
        frame_id: u32,
        data: &[u8],
        options: DecodeOptions,
    ) -> Result<DecodedMessage, DecodeError> {
        let message = self
            .lookup(frame_id)
            .ok_or(DecodeError::UnknownFrame(frame_id))?;
        decode_with(message, data, options)
    }

    pub fn meta(&self) -> &DatabaseMeta {
        &self.meta
    }

    /// File the database was loaded from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn signal_count(&self) -> usize {
        self.messages.values().map(|m| m.signals.len()).sum()
    }
}
