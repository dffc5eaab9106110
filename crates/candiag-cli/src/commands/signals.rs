//! Signals command - inspect a signal database

use anyhow::{Context, Result};
use candiag_signals::{format_frame_id, format_physical, parse_frame_id, ByteOrder, SignalDatabase};
use std::path::Path;

use crate::output::{MessageRow, OutputContext, SignalRow};

/// Show the messages of a database, or the signals of one message
pub fn signals(path: &Path, message: Option<&str>, ctx: &OutputContext) -> Result<()> {
    let db = SignalDatabase::load(path)
        .with_context(|| format!("Failed to load signal database: {}", path.display()))?;

    let name = db.meta().name.as_deref().unwrap_or("unnamed");
    ctx.info(&format!(
        "{}: {} messages, {} signals",
        name,
        db.len(),
        db.signal_count()
    ));

    let Some(selector) = message else {
        let rows: Vec<MessageRow> = db
            .messages()
            .map(|m| MessageRow {
                id: format!("0x{}", format_frame_id(m.id)),
                name: m.name.clone(),
                length: m.length,
                signals: m.signals.len(),
                senders: m.senders.join(", "),
            })
            .collect();
        ctx.print(&rows);
        return Ok(());
    };

    let def = db
        .message_by_name(selector)
        .or_else(|| parse_frame_id(selector).ok().and_then(|id| db.lookup(id)))
        .with_context(|| format!("No message '{}' in {}", selector, path.display()))?;

    let rows: Vec<SignalRow> = def
        .signals
        .iter()
        .map(|s| SignalRow {
            name: s.name.clone(),
            start_bit: s.start_bit,
            bit_length: s.bit_length,
            byte_order: match s.byte_order {
                ByteOrder::LittleEndian => "intel".to_string(),
                ByteOrder::BigEndian => "motorola".to_string(),
            },
            scale: format_physical(s.scale, 6),
            offset: format_physical(s.offset, 6),
            unit: s.unit.clone().unwrap_or_default(),
            choices: s.choices.len(),
        })
        .collect();
    ctx.print(&rows);
    Ok(())
}
