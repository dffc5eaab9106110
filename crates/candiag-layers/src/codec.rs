//! Positional parameter coding for service requests and responses
//!
//! Requests are built from raw values mapped onto the declared request
//! parameters by position. Positive responses are decoded parameter by
//! parameter into JSON values, scaled like DID values are.

use serde_json::{json, Map, Value};
use tracing::debug;

use candiag_signals::to_json_number;

use crate::error::CodecError;
use crate::types::{ParamDef, ParamType, ServiceDef};

/// A raw value supplied for one request parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Integer(u64),
    Bytes(Vec<u8>),
}

/// Encode a full request: service identifier followed by its parameters
///
/// `values[i]` fills the i-th declared parameter. Parameters with a coded
/// constant take it when no value is supplied. Trailing parameters may be
/// left out only if they are constants.
pub fn encode_request(service: &ServiceDef, values: &[ParamValue]) -> Result<Vec<u8>, CodecError> {
    if values.len() > service.request.len() {
        return Err(CodecError::TooManyValues {
            supplied: values.len(),
            declared: service.request.len(),
        });
    }

    let mut out = vec![service.service_id];
    for (index, param) in service.request.iter().enumerate() {
        match values.get(index) {
            Some(value) => encode_param(param, value, &mut out)?,
            None => match param.constant {
                Some(constant) => encode_param(param, &ParamValue::Integer(constant), &mut out)?,
                None => return Err(CodecError::MissingValue(param.name.clone())),
            },
        }
    }
    Ok(out)
}

fn encode_param(param: &ParamDef, value: &ParamValue, out: &mut Vec<u8>) -> Result<(), CodecError> {
    match (param.param_type.byte_size(), value) {
        (Some(_), ParamValue::Integer(raw)) if param.param_type == ParamType::Float32 => {
            out.extend_from_slice(&(*raw as f32).to_be_bytes());
        }
        (Some(size), ParamValue::Integer(raw)) => {
            let bits = (size * 8) as u32;
            if bits < 64 && *raw >> bits != 0 {
                return Err(CodecError::ValueOutOfRange {
                    param: param.name.clone(),
                    value: *raw,
                    bits,
                });
            }
            let be = raw.to_be_bytes();
            out.extend_from_slice(&be[8 - size..]);
        }
        (Some(size), ParamValue::Bytes(bytes)) => {
            if bytes.len() != size {
                return Err(CodecError::LengthMismatch {
                    param: param.name.clone(),
                    expected: size,
                    actual: bytes.len(),
                });
            }
            out.extend_from_slice(bytes);
        }
        (None, ParamValue::Bytes(bytes)) => {
            if let Some(len) = param.length {
                if bytes.len() != len {
                    return Err(CodecError::LengthMismatch {
                        param: param.name.clone(),
                        expected: len,
                        actual: bytes.len(),
                    });
                }
            }
            out.extend_from_slice(bytes);
        }
        (None, ParamValue::Integer(_)) => {
            return Err(CodecError::TypeMismatch {
                param: param.name.clone(),
                kind: "integer",
            });
        }
    }
    Ok(())
}

/// Decode the parameters of a positive response
///
/// `data` excludes the response service identifier byte.
pub fn decode_response(service: &ServiceDef, data: &[u8]) -> Result<Map<String, Value>, CodecError> {
    decode_params(&service.positive_response, data)
}

/// Decode a parameter list from `data`, in declaration order
pub fn decode_params(params: &[ParamDef], data: &[u8]) -> Result<Map<String, Value>, CodecError> {
    let mut values = Map::new();
    let mut offset = 0usize;

    for param in params {
        let remaining = &data[offset.min(data.len())..];
        let (value, used) = decode_param(param, remaining)?;
        values.insert(param.name.clone(), value);
        offset += used;
    }

    if offset < data.len() {
        debug!(
            trailing = data.len() - offset,
            "Response carries bytes beyond the declared parameters"
        );
    }
    Ok(values)
}

fn decode_param(param: &ParamDef, data: &[u8]) -> Result<(Value, usize), CodecError> {
    match param.param_type {
        ParamType::Ascii => {
            let len = take_len(param, data)?;
            let text = String::from_utf8_lossy(&data[..len])
                .trim_end_matches(['\0', ' '])
                .to_string();
            Ok((json!(text), len))
        }
        ParamType::Bytes => {
            let len = take_len(param, data)?;
            Ok((json!(hex::encode_upper(&data[..len])), len))
        }
        ParamType::Float32 => {
            let bytes: [u8; 4] = fixed(param, data)?;
            let physical = f64::from(f32::from_be_bytes(bytes)) * param.scale + param.offset;
            Ok((to_json_number(physical, param.scale.min(0.001)), 4))
        }
        numeric => {
            let size = numeric.byte_size().unwrap_or(1);
            if data.len() < size {
                return Err(CodecError::DataTooShort {
                    param: param.name.clone(),
                    expected: size,
                    actual: data.len(),
                });
            }
            let unsigned = data[..size]
                .iter()
                .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));

            if let Some(constant) = param.constant {
                if unsigned != constant {
                    return Err(CodecError::ConstMismatch {
                        param: param.name.clone(),
                        expected: constant,
                        actual: unsigned,
                    });
                }
            }

            let raw: i64 = if numeric.is_signed() {
                let shift = 64 - (size as u32 * 8);
                ((unsigned << shift) as i64) >> shift
            } else {
                unsigned as i64
            };

            if let Some(label) = param.choices.get(&raw) {
                return Ok((json!({ "value": raw, "label": label }), size));
            }

            let physical = raw as f64 * param.scale + param.offset;
            Ok((to_json_number(physical, param.scale), size))
        }
    }
}

fn take_len(param: &ParamDef, data: &[u8]) -> Result<usize, CodecError> {
    match param.length {
        Some(len) if len > data.len() => Err(CodecError::DataTooShort {
            param: param.name.clone(),
            expected: len,
            actual: data.len(),
        }),
        Some(len) => Ok(len),
        None => Ok(data.len()),
    }
}

fn fixed<const N: usize>(param: &ParamDef, data: &[u8]) -> Result<[u8; N], CodecError> {
    data.get(..N)
        .and_then(|s| <[u8; N]>::try_from(s).ok())
        .ok_or_else(|| CodecError::DataTooShort {
            param: param.name.clone(),
            expected: N,
            actual: data.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn read_did() -> ServiceDef {
        ServiceDef::new("ReadDataByIdentifier", 0x22)
            .with_request(ParamDef::new("DataIdentifier", ParamType::Uint16))
            .with_response(ParamDef::new("DataIdentifier", ParamType::Uint16))
            .with_response(ParamDef::new("Value", ParamType::Ascii))
    }

    #[test]
    fn test_encode_read_did() {
        let bytes = encode_request(&read_did(), &[ParamValue::Integer(0xF190)]).unwrap();
        assert_eq!(bytes, vec![0x22, 0xF1, 0x90]);
    }

    #[test]
    fn test_decode_read_did_response() {
        let values = decode_response(&read_did(), &[0xF1, 0x90, 0x31, 0x32, 0x33]).unwrap();
        assert_eq!(values["DataIdentifier"], json!(0xF190));
        assert_eq!(values["Value"], json!("123"));
    }

    #[test]
    fn test_encode_missing_and_extra_values() {
        assert_eq!(
            encode_request(&read_did(), &[]).unwrap_err(),
            CodecError::MissingValue("DataIdentifier".to_string())
        );
        let err = encode_request(
            &read_did(),
            &[ParamValue::Integer(1), ParamValue::Integer(2)],
        )
        .unwrap_err();
        assert!(matches!(err, CodecError::TooManyValues { supplied: 2, declared: 1 }));
    }

    #[test]
    fn test_encode_value_too_wide() {
        let service = ServiceDef::new("ECUReset", 0x11)
            .with_request(ParamDef::new("ResetType", ParamType::Uint8));
        let err = encode_request(&service, &[ParamValue::Integer(0x100)]).unwrap_err();
        assert!(matches!(err, CodecError::ValueOutOfRange { bits: 8, .. }));
    }

    #[test]
    fn test_constant_fills_missing_trailing_param() {
        let service = ServiceDef::new("ReadDTCInformation", 0x19)
            .with_request(ParamDef::new("SubFunction", ParamType::Uint8))
            .with_request(ParamDef::new("StatusMask", ParamType::Uint8).with_const(0xFF));
        let bytes = encode_request(&service, &[ParamValue::Integer(0x02)]).unwrap();
        assert_eq!(bytes, vec![0x19, 0x02, 0xFF]);
    }

    #[test]
    fn test_bytes_into_fixed_and_variable_params() {
        let service = ServiceDef::new("WriteDataByIdentifier", 0x2E)
            .with_request(ParamDef::new("DataIdentifier", ParamType::Uint16))
            .with_request(ParamDef::new("Data", ParamType::Bytes));
        let bytes = encode_request(
            &service,
            &[ParamValue::Integer(0xF199), ParamValue::Bytes(vec![0x20, 0x26, 0x10])],
        )
        .unwrap();
        assert_eq!(bytes, vec![0x2E, 0xF1, 0x99, 0x20, 0x26, 0x10]);

        let wrong = encode_request(
            &service,
            &[ParamValue::Bytes(vec![0xF1]), ParamValue::Bytes(vec![])],
        )
        .unwrap_err();
        assert!(matches!(wrong, CodecError::LengthMismatch { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn test_integer_into_float_param_uses_ieee_bits() {
        let service = ServiceDef::new("WriteDataByIdentifier", 0x2E)
            .with_request(ParamDef::new("DataIdentifier", ParamType::Uint16))
            .with_request(ParamDef::new("Setpoint", ParamType::Float32));
        let bytes = encode_request(
            &service,
            &[ParamValue::Integer(0x0100), ParamValue::Integer(90)],
        )
        .unwrap();
        assert_eq!(bytes, vec![0x2E, 0x01, 0x00, 0x42, 0xB4, 0x00, 0x00]);

        let decoded = decode_params(&service.request[1..], &bytes[3..]).unwrap();
        assert_eq!(decoded["Setpoint"], serde_json::json!(90));
    }

    #[test]
    fn test_decode_scaled_signed_and_choices() {
        let params = vec![
            ParamDef::new("Coolant", ParamType::Uint8).with_scale(1.0, -40.0),
            ParamDef::new("Rpm", ParamType::Uint16).with_scale(0.25, 0.0),
            ParamDef::new("Trim", ParamType::Int8),
            ParamDef::new("Gear", ParamType::Uint8).with_choice(3, "Drive"),
        ];
        let values = decode_params(&params, &[132, 0x1C, 0x20, 0xFE, 3]).unwrap();
        assert_eq!(values["Coolant"], json!(92));
        assert_eq!(values["Rpm"], json!(1800));
        assert_eq!(values["Trim"], json!(-2));
        assert_eq!(values["Gear"], json!({ "value": 3, "label": "Drive" }));
    }

    #[test]
    fn test_decode_too_short_and_const_mismatch() {
        let params = vec![ParamDef::new("Did", ParamType::Uint16)];
        assert!(matches!(
            decode_params(&params, &[0xF1]).unwrap_err(),
            CodecError::DataTooShort { expected: 2, actual: 1, .. }
        ));

        let params = vec![ParamDef::new("Sub", ParamType::Uint8).with_const(0x01)];
        assert!(matches!(
            decode_params(&params, &[0x02]).unwrap_err(),
            CodecError::ConstMismatch { expected: 1, actual: 2, .. }
        ));
    }

    #[test]
    fn test_decode_fixed_ascii_then_bytes() {
        let params = vec![
            ParamDef::new("Part", ParamType::Ascii).with_length(4),
            ParamDef::new("Raw", ParamType::Bytes),
        ];
        let values = decode_params(&params, b"AB\0\0\x01\x02").unwrap();
        assert_eq!(values["Part"], json!("AB"));
        assert_eq!(values["Raw"], json!("0102"));
    }
}
