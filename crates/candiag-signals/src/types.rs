//! Message and signal definitions
//!
//! These are the immutable building blocks of a [`SignalDatabase`](crate::SignalDatabase).
//! They can be produced from a DBC file or written by hand in YAML.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::parse_frame_id;
use crate::precision::format_physical;

/// Bit numbering convention of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Intel: start bit is the least significant bit
    #[default]
    LittleEndian,
    /// Motorola: start bit is the most significant bit
    BigEndian,
}

/// Layout and scaling of one signal inside a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDef {
    /// Signal name, unique within its message
    pub name: String,
    /// Start bit (DBC numbering)
    pub start_bit: u16,
    /// Length in bits (1..=64)
    pub bit_length: u16,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub signed: bool,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub receivers: Vec<String>,
    /// Enumerated raw value → label mapping
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub choices: BTreeMap<i64, String>,
    /// This signal selects which multiplexed signals are present
    #[serde(default)]
    pub multiplexor: bool,
    /// Present only when the multiplexor holds this raw value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplexer_value: Option<u64>,
}

fn default_scale() -> f64 {
    1.0
}

impl SignalDef {
    /// Create an unsigned little-endian signal with unit scale
    pub fn new(name: impl Into<String>, start_bit: u16, bit_length: u16) -> Self {
        Self {
            name: name.into(),
            start_bit,
            bit_length,
            byte_order: ByteOrder::LittleEndian,
            signed: false,
            scale: 1.0,
            offset: 0.0,
            min: None,
            max: None,
            unit: None,
            receivers: Vec::new(),
            choices: BTreeMap::new(),
            multiplexor: false,
            multiplexer_value: None,
        }
    }

    /// Set scale and offset
    pub fn with_scale(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Add an enumerated choice
    pub fn with_choice(mut self, raw: i64, label: impl Into<String>) -> Self {
        self.choices.insert(raw, label.into());
        self
    }

    pub fn as_multiplexor(mut self) -> Self {
        self.multiplexor = true;
        self
    }

    pub fn multiplexed_on(mut self, value: u64) -> Self {
        self.multiplexer_value = Some(value);
        self
    }

    /// Smallest and largest raw integer the signal can carry
    pub fn raw_range(&self) -> (i128, i128) {
        let bits = u32::from(self.bit_length.clamp(1, 64));
        if self.signed {
            let half = 1i128 << (bits - 1);
            (-half, half - 1)
        } else {
            (0, (1i128 << bits) - 1)
        }
    }
}

/// Layout of a frame: identifier, expected length and signals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDef {
    #[serde(deserialize_with = "deserialize_frame_id")]
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub is_extended: bool,
    /// Expected payload length in bytes
    pub length: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub senders: Vec<String>,
    #[serde(default)]
    pub signals: Vec<SignalDef>,
}

impl MessageDef {
    pub fn new(id: u32, name: impl Into<String>, length: usize) -> Self {
        Self {
            id,
            name: name.into(),
            is_extended: id > 0x7FF,
            length,
            senders: Vec::new(),
            signals: Vec::new(),
        }
    }

    pub fn with_signal(mut self, signal: SignalDef) -> Self {
        self.signals.push(signal);
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.senders.push(sender.into());
        self
    }

    /// Find a signal by name
    pub fn signal(&self, name: &str) -> Option<&SignalDef> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// The multiplexor switch, if this message is multiplexed
    pub fn multiplexor(&self) -> Option<&SignalDef> {
        self.signals.iter().find(|s| s.multiplexor)
    }
}

fn deserialize_frame_id<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdRepr {
        Number(u32),
        Text(String),
    }

    match IdRepr::deserialize(deserializer)? {
        IdRepr::Number(n) => Ok(n),
        IdRepr::Text(s) => parse_frame_id(&s).map_err(serde::de::Error::custom),
    }
}

/// Decoded value of one signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    /// raw × scale + offset
    Physical(f64),
    /// Enumerated label substituted for the raw value
    Choice { raw: i64, label: String },
}

impl SignalValue {
    /// Numeric view of the value (raw value for choices)
    pub fn as_f64(&self) -> f64 {
        match self {
            SignalValue::Physical(v) => *v,
            SignalValue::Choice { raw, .. } => *raw as f64,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            SignalValue::Physical(_) => None,
            SignalValue::Choice { label, .. } => Some(label),
        }
    }
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Physical(v) => f.write_str(&format_physical(*v, 6)),
            SignalValue::Choice { label, .. } => f.write_str(label),
        }
    }
}

/// A signal value observed at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedSignal {
    pub name: String,
    pub value: SignalValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Seconds, monotonic
    pub timestamp: f64,
}

/// Decoder output: signal name → value, in name order
pub type DecodedMessage = BTreeMap<String, SignalValue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_range() {
        assert_eq!(SignalDef::new("a", 0, 8).raw_range(), (0, 255));
        assert_eq!(SignalDef::new("b", 0, 8).signed().raw_range(), (-128, 127));
        assert_eq!(SignalDef::new("c", 0, 1).raw_range(), (0, 1));
        assert_eq!(
            SignalDef::new("d", 0, 64).raw_range(),
            (0, u64::MAX as i128)
        );
    }

    #[test]
    fn test_message_from_yaml_accepts_hex_id() {
        let yaml = r#"
id: "0x18FEF100"
name: CruiseControl
length: 8
signals:
  - name: WheelSpeed
    start_bit: 8
    bit_length: 16
    scale: 0.00390625
    unit: km/h
"#;
        let msg: MessageDef = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(msg.id, 0x18FE_F100);
        assert_eq!(msg.signals.len(), 1);
        assert_eq!(msg.signals[0].byte_order, ByteOrder::LittleEndian);
        assert_eq!(msg.signals[0].unit.as_deref(), Some("km/h"));
    }

    #[test]
    fn test_signal_value_display() {
        assert_eq!(SignalValue::Physical(20.0).to_string(), "20");
        assert_eq!(
            SignalValue::Choice {
                raw: 3,
                label: "Drive".to_string()
            }
            .to_string(),
            "Drive"
        );
    }
}
