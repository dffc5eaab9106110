//! Trace file ingestion
//!
//! Trace files are CSV with four required leading columns:
//! `timestamp, id_hex, dlc, data_hex`. The data column may only be empty
//! for zero-length frames. Optional `IsExtended, IsRemote,
//! IsError` columns, as written by the frame logger, are honoured. Bad rows
//! are skipped and counted; they never fail the load.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};

use candiag_signals::{DecodeOptions, DecodedSignal, SignalDatabase, SignalValue};

use crate::error::TraceError;
use crate::frame::{Frame, MAX_FD_DATA};

/// Rows between progress callbacks
pub const PROGRESS_INTERVAL: usize = 5000;

/// One accepted trace row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceRecord {
    /// 1-based line number in the file
    pub line: usize,
    /// Timestamp column as written, for display
    pub timestamp: String,
    /// Numeric timestamp, or the line number when the column is not numeric
    pub time: f64,
    pub frame: Frame,
}

/// Outcome of parsing one line
#[derive(Debug, Clone, PartialEq)]
pub enum TraceRow {
    /// Empty line
    Blank,
    /// Column header line
    Header,
    Malformed(String),
    Record(TraceRecord),
}

/// Parse one trace line
pub fn parse_row(line_no: usize, line: &str) -> TraceRow {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let non_empty = fields.iter().filter(|f| !f.is_empty()).count();
    if non_empty == 0 {
        return TraceRow::Blank;
    }
    if fields.len() < 4 || fields[..3].iter().any(|f| f.is_empty()) {
        return TraceRow::Malformed(format!("expected 4 columns, got {}", non_empty));
    }

    let (timestamp, id_field, dlc_field, data_field) = (fields[0], fields[1], fields[2], fields[3]);

    let id = match parse_id(id_field) {
        Some(id) => id,
        None if line_no == 1 && timestamp.eq_ignore_ascii_case("timestamp") => {
            return TraceRow::Header
        }
        None => return TraceRow::Malformed(format!("invalid id '{}'", id_field)),
    };

    let dlc = match dlc_field.parse::<usize>() {
        Ok(dlc) if dlc <= MAX_FD_DATA => dlc,
        _ => return TraceRow::Malformed(format!("invalid dlc '{}'", dlc_field)),
    };

    let compact: String = data_field.split_whitespace().collect();
    let data = match hex::decode(&compact) {
        Ok(data) => data,
        Err(_) => return TraceRow::Malformed(format!("invalid data '{}'", data_field)),
    };
    if data.is_empty() && dlc != 0 {
        return TraceRow::Malformed("missing data".to_string());
    }
    if data.len() != dlc {
        debug!(line = line_no, dlc, bytes = data.len(), "DLC does not match data length");
    }

    let time = timestamp
        .parse::<f64>()
        .ok()
        .filter(|t| t.is_finite())
        .unwrap_or(line_no as f64);
    let mut frame = Frame::new(id, data).with_timestamp(time);
    if let Some(extended) = fields.get(4).and_then(|f| parse_flag(f)) {
        frame.is_extended = extended;
    }
    if fields.get(5).and_then(|f| parse_flag(f)) == Some(true) {
        frame.is_remote = true;
    }
    if fields.get(6).and_then(|f| parse_flag(f)) == Some(true) {
        frame.is_error = true;
    }

    TraceRow::Record(TraceRecord {
        line: line_no,
        timestamp: timestamp.to_string(),
        time,
        frame,
    })
}

fn parse_id(field: &str) -> Option<u32> {
    let hex = field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
        .unwrap_or(field);
    u32::from_str_radix(hex, 16)
        .ok()
        .filter(|id| *id <= 0x1FFF_FFFF)
}

fn parse_flag(field: &str) -> Option<bool> {
    match field.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Read every valid frame of a trace, skipping bad rows
pub fn read_frames(path: impl AsRef<Path>) -> Result<(Vec<TraceRecord>, usize), TraceError> {
    let reader = BufReader::new(std::fs::File::open(path.as_ref())?);
    let mut records = Vec::new();
    let mut malformed = 0;
    for (index, line) in reader.lines().enumerate() {
        match parse_row(index + 1, &line?) {
            TraceRow::Record(record) => records.push(record),
            TraceRow::Malformed(_) => malformed += 1,
            TraceRow::Blank | TraceRow::Header => {}
        }
    }
    Ok((records, malformed))
}

/// Time series of one signal
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SignalSeries {
    pub times: Vec<f64>,
    pub values: Vec<SignalValue>,
}

/// Periodic progress report
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TraceProgress {
    pub lines: usize,
    /// Approximate completion, 0-100, from bytes read
    pub percent: u8,
    /// Lines per second so far
    pub rate: u64,
}

/// Result of loading a trace file
#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceSummary {
    pub records: Vec<TraceRecord>,
    pub message_count: usize,
    pub decoded_count: usize,
    pub malformed_count: usize,
    /// Rows whose id is known but whose payload failed to decode
    pub decode_errors: usize,
    pub series: BTreeMap<String, SignalSeries>,
}

impl TraceSummary {
    /// Last value of every signal seen
    pub fn latest_values(&self) -> BTreeMap<String, DecodedSignal> {
        self.series
            .iter()
            .filter_map(|(name, series)| {
                let value = series.values.last()?.clone();
                let timestamp = *series.times.last()?;
                Some((
                    name.clone(),
                    DecodedSignal {
                        name: name.clone(),
                        value,
                        unit: None,
                        timestamp,
                    },
                ))
            })
            .collect()
    }
}

/// Load a trace file, optionally decoding every row
///
/// Rows decode with truncation allowed and choices kept numeric. Unknown
/// frame ids are not errors.
pub fn load_trace(
    path: impl AsRef<Path>,
    db: Option<&SignalDatabase>,
    mut progress: impl FnMut(TraceProgress),
) -> Result<TraceSummary, TraceError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)?;
    let total_bytes = file.metadata().map(|m| m.len()).unwrap_or(0);
    let mut reader = BufReader::new(file);

    let started = std::time::Instant::now();
    let options = DecodeOptions::lenient();
    let mut summary = TraceSummary::default();
    let mut bytes_read = 0u64;
    let mut line = String::new();
    let mut line_no = 0usize;

    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        bytes_read += n as u64;
        line_no += 1;

        if line_no % PROGRESS_INTERVAL == 0 {
            let elapsed = started.elapsed().as_secs_f64();
            progress(TraceProgress {
                lines: line_no,
                percent: percent(bytes_read, total_bytes),
                rate: if elapsed > 0.0 {
                    (line_no as f64 / elapsed) as u64
                } else {
                    0
                },
            });
        }

        let record = match parse_row(line_no, line.trim_end_matches(['\r', '\n'])) {
            TraceRow::Record(record) => record,
            TraceRow::Malformed(reason) => {
                summary.malformed_count += 1;
                debug!(line = line_no, %reason, "Skipping malformed trace row");
                continue;
            }
            TraceRow::Blank | TraceRow::Header => continue,
        };
        summary.message_count += 1;

        if let Some(db) = db {
            if record.frame.is_decodable() {
                decode_into(db, &record, options, &mut summary);
            }
        }
        summary.records.push(record);
    }

    progress(TraceProgress {
        lines: line_no,
        percent: 100,
        rate: 0,
    });

    if summary.malformed_count > 0 {
        warn!(
            path = %path.display(),
            malformed = summary.malformed_count,
            "Trace contains malformed rows"
        );
    }
    info!(
        path = %path.display(),
        messages = summary.message_count,
        decoded = summary.decoded_count,
        malformed = summary.malformed_count,
        "Loaded trace"
    );
    Ok(summary)
}

fn decode_into(
    db: &SignalDatabase,
    record: &TraceRecord,
    options: DecodeOptions,
    summary: &mut TraceSummary,
) {
    let Some(message) = db.lookup(record.frame.id) else {
        return;
    };
    match candiag_signals::decode_with(message, &record.frame.data, options) {
        Ok(values) => {
            summary.decoded_count += 1;
            for (name, value) in values {
                let series = summary.series.entry(name).or_default();
                series.times.push(record.time);
                series.values.push(value);
            }
        }
        Err(e) => {
            summary.decode_errors += 1;
            debug!(line = record.line, error = %e, "Failed to decode trace row");
        }
    }
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done.min(total) * 100) / total) as u8
}
