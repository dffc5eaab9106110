//! Encoding physical signal values into a frame payload
//!
//! The inverse of [`decode`](crate::decode::decode), used for building
//! test traffic and for virtual bus nodes.

use std::collections::BTreeMap;

use crate::error::EncodeError;
use crate::layout::SignalLayout;
use crate::types::MessageDef;

/// Encode physical values into a payload of `message.length` bytes
///
/// Every signal active for the given multiplexor value must be present.
/// raw = round((physical - offset) / scale)
pub fn encode(message: &MessageDef, values: &BTreeMap<String, f64>) -> Result<Vec<u8>, EncodeError> {
    let mut data = vec![0u8; message.length];

    let mux_raw = match message.multiplexor() {
        Some(mux) => {
            let physical = *values
                .get(&mux.name)
                .ok_or_else(|| EncodeError::MissingSignal(mux.name.clone()))?;
            Some(((physical - mux.offset) / mux.scale).round() as i128)
        }
        None => None,
    };

    for signal in &message.signals {
        if let Some(selector) = signal.multiplexer_value {
            if mux_raw != Some(i128::from(selector)) {
                continue;
            }
        }

        let physical = *values
            .get(&signal.name)
            .ok_or_else(|| EncodeError::MissingSignal(signal.name.clone()))?;

        let raw = ((physical - signal.offset) / signal.scale).round();
        let (min, max) = signal.raw_range();
        if !raw.is_finite() || raw < min as f64 || raw > max as f64 {
            return Err(EncodeError::ValueOutOfRange {
                signal: signal.name.clone(),
                value: physical,
                min: min as f64 * signal.scale + signal.offset,
                max: max as f64 * signal.scale + signal.offset,
            });
        }

        let layout = SignalLayout::for_signal(signal);
        if !layout.fits(data.len()) {
            return Err(EncodeError::LayoutOverflow {
                signal: signal.name.clone(),
                length: data.len(),
            });
        }

        // two's complement bits for negative raw values
        let bits = if raw < 0.0 {
            (raw as i64) as u64
        } else {
            raw as u64
        };
        layout.pack(&mut data, bits);
    }

    Ok(data)
}
