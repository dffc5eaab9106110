//! UDS (ISO 14229) request model
//!
//! [`DiagnosticRequest`] is the closed set of requests the engine knows how
//! to encode. Each kind names the layer service it runs and supplies its
//! values in declaration order of that service's request parameters.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use candiag_layers::ParamValue;

use crate::error::DiagnosticError;

/// UDS service identifiers
pub mod service_id {
    pub const ECU_RESET: u8 = 0x11;
    pub const CLEAR_DIAGNOSTIC_INFO: u8 = 0x14;
    pub const READ_DTC_INFO: u8 = 0x19;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// ReadDTCInformation sub-functions
pub mod dtc_sub_function {
    pub const REPORT_NUMBER_OF_DTC_BY_STATUS_MASK: u8 = 0x01;
    pub const REPORT_DTC_BY_STATUS_MASK: u8 = 0x02;
    pub const REPORT_SUPPORTED_DTC: u8 = 0x0A;
}

/// ECUReset sub-functions
pub mod reset_type {
    pub const HARD_RESET: u8 = 0x01;
    pub const KEY_OFF_ON_RESET: u8 = 0x02;
    pub const SOFT_RESET: u8 = 0x03;
}

/// ClearDiagnosticInformation group covering every DTC
pub const ALL_DTC_GROUPS: u32 = 0xFF_FFFF;

/// Offset between a request SID and its positive response SID
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// A diagnostic request the engine can run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiagnosticRequest {
    #[serde(rename = "read_did")]
    ReadDataByIdentifier {
        #[serde(deserialize_with = "number")]
        did: u16,
    },
    #[serde(rename = "read_dtc")]
    ReadDtcInformation {
        #[serde(deserialize_with = "number")]
        subfunction: u8,
        #[serde(default, deserialize_with = "opt_number")]
        status_mask: Option<u8>,
    },
    #[serde(rename = "clear_dtc")]
    ClearDiagnosticInformation {
        #[serde(default = "all_groups", deserialize_with = "number")]
        group_of_dtc: u32,
    },
    #[serde(rename = "ecu_reset")]
    EcuReset {
        #[serde(deserialize_with = "number")]
        reset_type: u8,
    },
    #[serde(rename = "security_access")]
    SecurityAccess {
        #[serde(deserialize_with = "number")]
        level: u8,
        #[serde(default, deserialize_with = "opt_bytes", serialize_with = "opt_hex")]
        key: Option<Vec<u8>>,
    },
    #[serde(rename = "write_did")]
    WriteDataByIdentifier {
        #[serde(deserialize_with = "number")]
        did: u16,
        #[serde(deserialize_with = "bytes", serialize_with = "hex_str")]
        data: Vec<u8>,
    },
}

const KNOWN_TYPES: &[&str] = &[
    "read_did",
    "read_dtc",
    "clear_dtc",
    "ecu_reset",
    "security_access",
    "write_did",
];

fn all_groups() -> u32 {
    ALL_DTC_GROUPS
}

impl DiagnosticRequest {
    /// Build a request from its JSON form, e.g. `{"type": "read_did", "did": 61840}`
    pub fn from_json(value: &Value) -> Result<Self, DiagnosticError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| DiagnosticError::EncodeFailure("request has no type".to_string()))?;
        if !KNOWN_TYPES.contains(&kind) {
            return Err(DiagnosticError::NotImplemented(kind.to_string()));
        }
        serde_json::from_value(value.clone())
            .map_err(|e| DiagnosticError::EncodeFailure(format!("invalid {} request: {}", kind, e)))
    }

    /// Build a request from a kind and positional arguments
    ///
    /// Numbers accept decimal or `0x` hex; byte arguments are hex strings.
    pub fn from_args(kind: &str, args: &[String]) -> Result<Self, DiagnosticError> {
        let mut object = serde_json::Map::new();
        object.insert("type".into(), Value::String(kind.to_string()));
        let fields: &[&str] = match kind {
            "read_did" => &["did"],
            "read_dtc" => &["subfunction", "status_mask"],
            "clear_dtc" => &["group_of_dtc"],
            "ecu_reset" => &["reset_type"],
            "security_access" => &["level", "key"],
            "write_did" => &["did", "data"],
            other => return Err(DiagnosticError::NotImplemented(other.to_string())),
        };
        if args.len() > fields.len() {
            return Err(DiagnosticError::EncodeFailure(format!(
                "{} takes at most {} arguments",
                kind,
                fields.len()
            )));
        }
        for (field, arg) in fields.iter().zip(args) {
            object.insert((*field).into(), Value::String(arg.clone()));
        }
        Self::from_json(&Value::Object(object))
    }

    /// Short name of the layer service this request runs
    pub fn service_name(&self) -> &'static str {
        match self {
            DiagnosticRequest::ReadDataByIdentifier { .. } => "ReadDataByIdentifier",
            DiagnosticRequest::ReadDtcInformation { .. } => "ReadDTCInformation",
            DiagnosticRequest::ClearDiagnosticInformation { .. } => "ClearDiagnosticInformation",
            DiagnosticRequest::EcuReset { .. } => "ECUReset",
            DiagnosticRequest::SecurityAccess { .. } => "SecurityAccess",
            DiagnosticRequest::WriteDataByIdentifier { .. } => "WriteDataByIdentifier",
        }
    }

    /// Standard service identifier, used when the layer names services differently
    pub fn service_id(&self) -> u8 {
        match self {
            DiagnosticRequest::ReadDataByIdentifier { .. } => service_id::READ_DATA_BY_ID,
            DiagnosticRequest::ReadDtcInformation { .. } => service_id::READ_DTC_INFO,
            DiagnosticRequest::ClearDiagnosticInformation { .. } => {
                service_id::CLEAR_DIAGNOSTIC_INFO
            }
            DiagnosticRequest::EcuReset { .. } => service_id::ECU_RESET,
            DiagnosticRequest::SecurityAccess { .. } => service_id::SECURITY_ACCESS,
            DiagnosticRequest::WriteDataByIdentifier { .. } => service_id::WRITE_DATA_BY_ID,
        }
    }

    /// Values for the service's request parameters, in order
    pub fn param_values(&self) -> Vec<ParamValue> {
        match self {
            DiagnosticRequest::ReadDataByIdentifier { did } => {
                vec![ParamValue::Integer(u64::from(*did))]
            }
            DiagnosticRequest::ReadDtcInformation {
                subfunction,
                status_mask,
            } => {
                let mut values = vec![ParamValue::Integer(u64::from(*subfunction))];
                if let Some(mask) = status_mask {
                    values.push(ParamValue::Integer(u64::from(*mask)));
                }
                values
            }
            DiagnosticRequest::ClearDiagnosticInformation { group_of_dtc } => {
                vec![ParamValue::Integer(u64::from(*group_of_dtc))]
            }
            DiagnosticRequest::EcuReset { reset_type } => {
                vec![ParamValue::Integer(u64::from(*reset_type))]
            }
            // A seed request carries an empty key
            DiagnosticRequest::SecurityAccess { level, key } => vec![
                ParamValue::Integer(u64::from(*level)),
                ParamValue::Bytes(key.clone().unwrap_or_default()),
            ],
            DiagnosticRequest::WriteDataByIdentifier { did, data } => vec![
                ParamValue::Integer(u64::from(*did)),
                ParamValue::Bytes(data.clone()),
            ],
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberRepr {
    Number(u64),
    Text(String),
}

fn parse_number(text: &str) -> Result<u64, String> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| format!("invalid number '{}'", text))
}

fn number<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    let raw = match NumberRepr::deserialize(d)? {
        NumberRepr::Number(n) => n,
        NumberRepr::Text(s) => parse_number(&s).map_err(serde::de::Error::custom)?,
    };
    T::try_from(raw).map_err(|_| serde::de::Error::custom(format!("{} is out of range", raw)))
}

fn opt_number<'de, D, T>(d: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    number(d).map(Some)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BytesRepr {
    List(Vec<u8>),
    Hex(String),
}

fn bytes<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    match BytesRepr::deserialize(d)? {
        BytesRepr::List(list) => Ok(list),
        BytesRepr::Hex(text) => {
            let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
            let compact = compact.strip_prefix("0x").unwrap_or(&compact);
            hex::decode(compact).map_err(serde::de::Error::custom)
        }
    }
}

fn opt_bytes<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
    bytes(d).map(Some)
}

fn hex_str<S: serde::Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode_upper(data))
}

fn opt_hex<S: serde::Serializer>(data: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    match data {
        Some(data) => hex_str(data, s),
        None => s.serialize_none(),
    }
}
