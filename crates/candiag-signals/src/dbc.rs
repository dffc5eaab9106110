//! DBC import via the `can-dbc` parser

use std::collections::BTreeMap;

use can_dbc::{ByteOrder as DbcByteOrder, MessageId, MultiplexIndicator, Transmitter, ValueType, DBC};
use tracing::debug;

use crate::error::SignalError;
use crate::types::{ByteOrder, MessageDef, SignalDef};

/// Parse DBC text into message definitions
pub fn parse_dbc(content: &str) -> Result<Vec<MessageDef>, SignalError> {
    let dbc = DBC::try_from(content).map_err(|e| match e {
        can_dbc::Error::Incomplete(_, remaining) => SignalError::Dbc(format!(
            "incomplete input, {} bytes left unparsed",
            remaining.len()
        )),
        can_dbc::Error::Nom(err) => SignalError::Dbc(format!("{:?}", err)),
        can_dbc::Error::MultipleMultiplexors => {
            SignalError::Dbc("multiple multiplexors in one message".to_string())
        }
    })?;

    let mut messages = Vec::with_capacity(dbc.messages().len());

    for message in dbc.messages() {
        let (id, is_extended) = match message.message_id() {
            MessageId::Standard(id) => (u32::from(*id), false),
            MessageId::Extended(id) => (*id, true),
        };

        let senders = match message.transmitter() {
            Transmitter::NodeName(name) => vec![name.clone()],
            Transmitter::VectorXXX => Vec::new(),
        };

        let mut signals = Vec::with_capacity(message.signals().len());
        for signal in message.signals() {
            let choices: BTreeMap<i64, String> = dbc
                .value_descriptions_for_signal(*message.message_id(), signal.name())
                .map(|descs| {
                    descs
                        .iter()
                        .map(|d| (*d.a() as i64, d.b().clone()))
                        .collect()
                })
                .unwrap_or_default();

            let (multiplexor, multiplexer_value) = match signal.multiplexer_indicator() {
                MultiplexIndicator::Multiplexor => (true, None),
                MultiplexIndicator::MultiplexedSignal(v) => (false, Some(*v)),
                MultiplexIndicator::MultiplexorAndMultiplexedSignal(v) => (true, Some(*v)),
                MultiplexIndicator::Plain => (false, None),
            };

            let unit = signal.unit().trim();
            signals.push(SignalDef {
                name: signal.name().clone(),
                start_bit: signal.start_bit as u16,
                bit_length: signal.signal_size as u16,
                byte_order: match signal.byte_order() {
                    DbcByteOrder::LittleEndian => ByteOrder::LittleEndian,
                    DbcByteOrder::BigEndian => ByteOrder::BigEndian,
                },
                signed: matches!(signal.value_type(), ValueType::Signed),
                scale: signal.factor,
                offset: signal.offset,
                // DBC writes [0|0] when no range is specified
                min: (signal.min != 0.0 || signal.max != 0.0).then_some(signal.min),
                max: (signal.min != 0.0 || signal.max != 0.0).then_some(signal.max),
                unit: (!unit.is_empty()).then(|| unit.to_string()),
                receivers: signal
                    .receivers()
                    .iter()
                    .filter(|r| r.as_str() != "Vector__XXX")
                    .cloned()
                    .collect(),
                choices,
                multiplexor,
                multiplexer_value,
            });
        }

        debug!(
            frame_id = format!("0x{:X}", id),
            name = %message.message_name(),
            signals = signals.len(),
            "Imported DBC message"
        );

        messages.push(MessageDef {
            id,
            name: message.message_name().clone(),
            is_extended,
            length: *message.message_size() as usize,
            senders,
            signals,
        });
    }

    Ok(messages)
}
