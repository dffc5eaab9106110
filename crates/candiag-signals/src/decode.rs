//! Decoding raw frame payloads to physical signal values

use crate::error::DecodeError;
use crate::layout::SignalLayout;
use crate::types::{DecodedMessage, MessageDef, SignalDef, SignalValue};

/// Per-call decoder policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Decode the signals that fit when the payload is shorter than the layout
    pub allow_truncated: bool,
    /// Substitute enumerated labels for raw values
    pub resolve_choices: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            allow_truncated: false,
            resolve_choices: true,
        }
    }
}

impl DecodeOptions {
    /// Policy used for live traffic and trace import: tolerant and numeric
    pub fn lenient() -> Self {
        Self {
            allow_truncated: true,
            resolve_choices: false,
        }
    }
}

/// Decode a payload against a message definition
///
/// Pure and deterministic: the same inputs always give the same map.
pub fn decode(
    message: &MessageDef,
    data: &[u8],
    allow_truncated: bool,
    resolve_choices: bool,
) -> Result<DecodedMessage, DecodeError> {
    if data.len() < message.length && !allow_truncated {
        return Err(DecodeError::MalformedData {
            id: message.id,
            expected: message.length,
            actual: data.len(),
        });
    }

    let mut values = DecodedMessage::new();

    // The multiplexor gates every multiplexed signal, so resolve it first
    let mux_raw = match message.multiplexor() {
        Some(mux) => {
            let layout = SignalLayout::for_signal(mux);
            if layout.fits(data.len()) {
                let raw = layout.extract(data);
                values.insert(
                    mux.name.clone(),
                    signal_value(mux, &layout, data, resolve_choices),
                );
                Some(raw)
            } else if allow_truncated {
                None
            } else {
                return Err(malformed(message, &layout, data));
            }
        }
        None => None,
    };

    for signal in &message.signals {
        if signal.multiplexor {
            continue;
        }
        if let Some(selector) = signal.multiplexer_value {
            if mux_raw != Some(selector) {
                continue;
            }
        }

        let layout = SignalLayout::for_signal(signal);
        if !layout.fits(data.len()) {
            if allow_truncated {
                continue;
            }
            return Err(malformed(message, &layout, data));
        }
        values.insert(
            signal.name.clone(),
            signal_value(signal, &layout, data, resolve_choices),
        );
    }

    Ok(values)
}

/// Decode with a [`DecodeOptions`] policy
pub fn decode_with(
    message: &MessageDef,
    data: &[u8],
    options: DecodeOptions,
) -> Result<DecodedMessage, DecodeError> {
    decode(
        message,
        data,
        options.allow_truncated,
        options.resolve_choices,
    )
}

/// Raw integer of a single signal, sign-extended when signed
pub fn raw_value(signal: &SignalDef, layout: &SignalLayout, data: &[u8]) -> i128 {
    if signal.signed {
        i128::from(layout.extract_signed(data))
    } else {
        i128::from(layout.extract(data))
    }
}

fn signal_value(
    signal: &SignalDef,
    layout: &SignalLayout,
    data: &[u8],
    resolve_choices: bool,
) -> SignalValue {
    let raw = raw_value(signal, layout, data);

    if resolve_choices {
        if let Ok(key) = i64::try_from(raw) {
            if let Some(label) = signal.choices.get(&key) {
                return SignalValue::Choice {
                    raw: key,
                    label: label.clone(),
                };
            }
        }
    }

    SignalValue::Physical(raw as f64 * signal.scale + signal.offset)
}

fn malformed(message: &MessageDef, layout: &SignalLayout, data: &[u8]) -> DecodeError {
    DecodeError::MalformedData {
        id: message.id,
        expected: message.length.max(layout.required_len()),
        actual: data.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ByteOrder;
    use pretty_assertions::assert_eq;

    fn speed_message() -> MessageDef {
        MessageDef::new(0x100, "VehicleSpeed", 1)
            .with_signal(SignalDef::new("Speed", 0, 8).with_scale(0.5, 0.0))
    }

    fn gear_message() -> MessageDef {
        MessageDef::new(0x200, "Transmission", 2)
            .with_signal(
                SignalDef::new("Gear", 0, 4)
                    .with_choice(0, "Park")
                    .with_choice(1, "Reverse")
                    .with_choice(2, "Neutral")
                    .with_choice(3, "Drive"),
            )
            .with_signal(SignalDef::new("OilTemp", 8, 8).signed().with_scale(1.0, 40.0))
    }

    #[test]
    fn test_decode_speed_scaled() {
        let values = decode(&speed_message(), &[40], false, true).unwrap();
        assert_eq!(values["Speed"], SignalValue::Physical(20.0));
    }

    #[test]
    fn test_decode_choice_resolution() {
        let msg = gear_message();

        let labelled = decode(&msg, &[0x03, 0xF6], false, true).unwrap();
        assert_eq!(
            labelled["Gear"],
            SignalValue::Choice {
                raw: 3,
                label: "Drive".to_string()
            }
        );
        assert_eq!(labelled["OilTemp"], SignalValue::Physical(30.0));

        let numeric = decode(&msg, &[0x03, 0xF6], false, false).unwrap();
        assert_eq!(numeric["Gear"], SignalValue::Physical(3.0));
    }

    #[test]
    fn test_unmapped_choice_stays_numeric() {
        let values = decode(&gear_message(), &[0x09, 0x00], false, true).unwrap();
        assert_eq!(values["Gear"], SignalValue::Physical(9.0));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let err = decode(&gear_message(), &[0x03], false, true).unwrap_err();
        assert_eq!(
            err,
            DecodeError::MalformedData {
                id: 0x200,
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_truncated_payload_allowed() {
        let values = decode(&gear_message(), &[0x02], true, true).unwrap();
        assert_eq!(values.len(), 1);
        assert!(values.contains_key("Gear"));
        assert!(!values.contains_key("OilTemp"));
    }

    #[test]
    fn test_longer_payload_accepted() {
        let values = decode(&speed_message(), &[40, 0xFF, 0xFF], false, true).unwrap();
        assert_eq!(values["Speed"], SignalValue::Physical(20.0));
    }

    #[test]
    fn test_big_endian_signal() {
        let msg = MessageDef::new(0x300, "Engine", 8).with_signal(
            SignalDef::new("Rpm", 7, 16)
                .with_byte_order(ByteOrder::BigEndian)
                .with_scale(0.25, 0.0),
        );
        let values = decode(&msg, &[0x1C, 0x20, 0, 0, 0, 0, 0, 0], false, true).unwrap();
        assert_eq!(values["Rpm"], SignalValue::Physical(1800.0));
    }

    #[test]
    fn test_multiplexed_signals() {
        let msg = MessageDef::new(0x400, "Diag", 3)
            .with_signal(SignalDef::new("Page", 0, 8).as_multiplexor())
            .with_signal(SignalDef::new("Voltage", 8, 16).multiplexed_on(0).with_scale(0.01, 0.0))
            .with_signal(SignalDef::new("Current", 8, 16).multiplexed_on(1).with_scale(0.1, 0.0));

        let page0 = decode(&msg, &[0x00, 0x10, 0x27], false, true).unwrap();
        assert_eq!(page0["Page"], SignalValue::Physical(0.0));
        assert!(page0.contains_key("Voltage"));
        assert!(!page0.contains_key("Current"));

        let page1 = decode(&msg, &[0x01, 0x64, 0x00], false, true).unwrap();
        assert_eq!(page1["Current"], SignalValue::Physical(10.0));
        assert!(!page1.contains_key("Voltage"));
    }

    #[test]
    fn test_decode_is_deterministic() {
        let msg = gear_message();
        let data = [0x01, 0x80];
        let first = decode(&msg, &data, false, true).unwrap();
        for _ in 0..10 {
            assert_eq!(decode(&msg, &data, false, true).unwrap(), first);
        }
    }

    #[test]
    fn test_lenient_options() {
        let opts = DecodeOptions::lenient();
        let values = decode_with(&gear_message(), &[0x03], opts).unwrap();
        assert_eq!(values["Gear"], SignalValue::Physical(3.0));
    }
}
