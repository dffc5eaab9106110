//! Trace command - load and summarize a recorded trace

use anyhow::{Context, Result};
use candiag_core::trace::load_trace;
use candiag_signals::{format_frame_id, SignalDatabase};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;

use crate::output::{FrameRow, OutputContext, OutputFormat, ValueRow};

fn progress_bar(ctx: &OutputContext) -> ProgressBar {
    if ctx.quiet || ctx.format != OutputFormat::Table {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    pb.set_style(style);
    pb
}

/// Load a trace file, decoding it when a database is given
pub fn trace(path: &Path, db_path: Option<&Path>, rows: bool, ctx: &OutputContext) -> Result<()> {
    let db = db_path
        .map(|p| {
            SignalDatabase::load(p)
                .with_context(|| format!("Failed to load signal database: {}", p.display()))
        })
        .transpose()?;

    let pb = progress_bar(ctx);
    pb.set_message(format!("Reading {}", path.display()));
    let summary = load_trace(path, db.as_ref(), |progress| {
        pb.set_position(u64::from(progress.percent));
        pb.set_message(format!("{} lines, {} lines/s", progress.lines, progress.rate));
    })
    .with_context(|| format!("Failed to load trace: {}", path.display()));
    pb.finish_and_clear();
    let summary = summary?;

    ctx.print_kv(&[
        ("File", path.display().to_string()),
        ("Messages", summary.message_count.to_string()),
        ("Decoded", summary.decoded_count.to_string()),
        ("Malformed rows", summary.malformed_count.to_string()),
        ("Decode errors", summary.decode_errors.to_string()),
        ("Signals", summary.series.len().to_string()),
    ]);
    if summary.malformed_count > 0 {
        ctx.warn(&format!(
            "{} malformed rows were skipped",
            summary.malformed_count
        ));
    }

    if rows {
        let frames: Vec<FrameRow> = summary
            .records
            .iter()
            .map(|r| FrameRow {
                line: r.line,
                timestamp: r.timestamp.clone(),
                id: format_frame_id(r.frame.id),
                dlc: r.frame.dlc(),
                data: r.frame.data_hex(),
            })
            .collect();
        ctx.print(&frames);
    }

    if db.is_some() {
        let values: Vec<ValueRow> = summary
            .latest_values()
            .into_values()
            .map(|s| {
                let unit = db
                    .as_ref()
                    .and_then(|db| {
                        db.messages()
                            .find_map(|m| m.signal(&s.name))
                            .and_then(|def| def.unit.clone())
                    })
                    .unwrap_or_default();
                ValueRow {
                    signal: s.name,
                    value: s.value.to_string(),
                    unit,
                    time: format!("{:.6}", s.timestamp),
                }
            })
            .collect();
        ctx.print(&values);
    }

    Ok(())
}
