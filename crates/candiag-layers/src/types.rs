//! ECU diagnostic layer model
//!
//! A description file lists ECU layers. Each layer carries its addressing,
//! a negative response table and the services it supports with positional
//! request and positive-response parameter schemas. The service identifier
//! byte itself is not part of either schema.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize};

use crate::nrc::NegativeResponseCode;

/// Wire type of a service parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Uint8,
    Uint16,
    Uint24,
    Uint32,
    Int8,
    Int16,
    Int32,
    Float32,
    /// ASCII text, fixed `length` or the rest of the message
    Ascii,
    /// Opaque bytes, fixed `length` or the rest of the message
    Bytes,
}

impl ParamType {
    /// Fixed width in bytes, `None` for text/bytes
    pub fn byte_size(&self) -> Option<usize> {
        match self {
            ParamType::Uint8 | ParamType::Int8 => Some(1),
            ParamType::Uint16 | ParamType::Int16 => Some(2),
            ParamType::Uint24 => Some(3),
            ParamType::Uint32 | ParamType::Int32 | ParamType::Float32 => Some(4),
            ParamType::Ascii | ParamType::Bytes => None,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, ParamType::Int8 | ParamType::Int16 | ParamType::Int32)
    }
}

/// One positional parameter of a request or response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// Fixed length for `ascii`/`bytes`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    /// Coded constant: always sent with this value, checked on receive
    #[serde(
        default,
        rename = "const",
        deserialize_with = "de::opt_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub constant: Option<u64>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub choices: BTreeMap<i64, String>,
}

fn default_scale() -> f64 {
    1.0
}

impl ParamDef {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            length: None,
            constant: None,
            scale: 1.0,
            offset: 0.0,
            unit: None,
            choices: BTreeMap::new(),
        }
    }

    pub fn with_length(mut self, length: usize) -> Self {
        self.length = Some(length);
        self
    }

    pub fn with_const(mut self, value: u64) -> Self {
        self.constant = Some(value);
        self
    }

    pub fn with_scale(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    pub fn with_choice(mut self, raw: i64, label: impl Into<String>) -> Self {
        self.choices.insert(raw, label.into());
        self
    }
}

/// A diagnostic service an ECU layer supports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDef {
    /// Short name, e.g. `ReadDataByIdentifier`
    pub name: String,
    #[serde(deserialize_with = "de::u8_value")]
    pub service_id: u8,
    #[serde(default)]
    pub request: Vec<ParamDef>,
    #[serde(default)]
    pub positive_response: Vec<ParamDef>,
    /// Codes the ECU may answer with for this service
    #[serde(default, deserialize_with = "de::u8_list")]
    pub negative_response_codes: Vec<u8>,
}

impl ServiceDef {
    pub fn new(name: impl Into<String>, service_id: u8) -> Self {
        Self {
            name: name.into(),
            service_id,
            request: Vec::new(),
            positive_response: Vec::new(),
            negative_response_codes: Vec::new(),
        }
    }

    pub fn with_request(mut self, param: ParamDef) -> Self {
        self.request.push(param);
        self
    }

    pub fn with_response(mut self, param: ParamDef) -> Self {
        self.positive_response.push(param);
        self
    }

    pub fn with_nrcs(mut self, codes: &[u8]) -> Self {
        self.negative_response_codes.extend_from_slice(codes);
        self
    }

    /// First byte of a positive response
    pub fn positive_response_id(&self) -> u8 {
        self.service_id.wrapping_add(0x40)
    }
}

/// CAN identifiers used for physical addressing of one ECU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addressing {
    /// Frame id the ECU listens on (tester → ECU)
    #[serde(deserialize_with = "de::u32_value")]
    pub request_id: u32,
    /// Frame id the ECU answers on (ECU → tester)
    #[serde(deserialize_with = "de::u32_value")]
    pub response_id: u32,
    /// Force 29-bit identifiers; inferred from the ids when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended: Option<bool>,
}

impl Addressing {
    pub fn new(request_id: u32, response_id: u32) -> Self {
        Self {
            request_id,
            response_id,
            extended: None,
        }
    }

    pub fn is_extended(&self) -> bool {
        self.extended
            .unwrap_or(self.request_id > 0x7FF || self.response_id > 0x7FF)
    }
}

/// Diagnostic layer of one ECU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcuLayer {
    /// Short name, unique within the database
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addressing: Option<Addressing>,
    /// Layer-specific NRC texts
    #[serde(default, deserialize_with = "de::nrc_table")]
    pub negative_responses: HashMap<u8, String>,
    #[serde(default)]
    pub services: Vec<ServiceDef>,
}

impl EcuLayer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            addressing: None,
            negative_responses: HashMap::new(),
            services: Vec::new(),
        }
    }

    pub fn with_addressing(mut self, request_id: u32, response_id: u32) -> Self {
        self.addressing = Some(Addressing::new(request_id, response_id));
        self
    }

    pub fn with_service(mut self, service: ServiceDef) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_nrc_text(mut self, code: u8, text: impl Into<String>) -> Self {
        self.negative_responses.insert(code, text.into());
        self
    }

    /// Find a service by short name, falling back to the service identifier
    pub fn service(&self, name: &str, service_id: u8) -> Option<&ServiceDef> {
        self.services
            .iter()
            .find(|s| s.name == name)
            .or_else(|| self.services.iter().find(|s| s.service_id == service_id))
    }

    /// Text for a negative response code
    ///
    /// Looks at the layer table, then the standard names. Codes known to
    /// neither become `Unknown NRC (0xNN)`.
    pub fn nrc_text(&self, code: u8) -> String {
        if let Some(text) = self.negative_responses.get(&code) {
            return text.clone();
        }
        NegativeResponseCode::from(code).to_string()
    }
}

/// Hex-tolerant deserializers: numbers or `"0x.."` strings
mod de {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumRepr {
        Number(u64),
        Text(String),
    }

    impl NumRepr {
        fn into_u64<E: serde::de::Error>(self) -> Result<u64, E> {
            match self {
                NumRepr::Number(n) => Ok(n),
                NumRepr::Text(s) => parse_u64(&s).map_err(E::custom),
            }
        }
    }

    pub(super) fn parse_u64(s: &str) -> Result<u64, String> {
        let t = s.trim();
        let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => t.parse::<u64>(),
        };
        parsed.map_err(|_| format!("invalid number '{}'", s))
    }

    fn narrow<T: TryFrom<u64>, E: serde::de::Error>(value: u64) -> Result<T, E> {
        T::try_from(value).map_err(|_| E::custom(format!("value {:#X} out of range", value)))
    }

    pub fn u8_value<'de, D: Deserializer<'de>>(d: D) -> Result<u8, D::Error> {
        narrow(NumRepr::deserialize(d)?.into_u64()?)
    }

    pub fn u32_value<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        narrow(NumRepr::deserialize(d)?.into_u64()?)
    }

    pub fn opt_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        Option::<NumRepr>::deserialize(d)?
            .map(NumRepr::into_u64)
            .transpose()
    }

    pub fn u8_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        Vec::<NumRepr>::deserialize(d)?
            .into_iter()
            .map(|n| n.into_u64().and_then(narrow))
            .collect()
    }

    pub fn nrc_table<'de, D: Deserializer<'de>>(d: D) -> Result<HashMap<u8, String>, D::Error> {
        let raw = BTreeMap::<String, String>::deserialize(d)?;
        raw.into_iter()
            .map(|(k, v)| {
                let code = parse_u64(&k).map_err(serde::de::Error::custom)?;
                Ok((narrow(code)?, v))
            })
            .collect()
    }
}
