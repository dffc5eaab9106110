//! Output formatting for candiag (table, json, csv)

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
    /// CSV format
    Csv,
}

/// Context for output rendering
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    /// Human-oriented messages are suppressed for machine formats
    fn chatty(&self) -> bool {
        !self.quiet && self.format == OutputFormat::Table
    }

    /// Print a success message (unless in quiet mode)
    pub fn success(&self, msg: &str) {
        if self.chatty() {
            println!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet mode)
    pub fn info(&self, msg: &str) {
        if self.chatty() {
            println!("{}", msg);
        }
    }

    /// Print a warning message
    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    /// Print an error message
    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// Print data in the configured format
    pub fn print<T: Tabled + Serialize>(&self, data: &[T]) {
        match self.format {
            OutputFormat::Table => {
                if data.is_empty() {
                    if !self.quiet {
                        println!("No data");
                    }
                } else {
                    println!("{}", Table::new(data));
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(data).unwrap_or_else(|_| "[]".to_string())
                );
            }
            OutputFormat::Csv => print_csv(data),
        }
    }

    /// Print one streamed record: a table line, a JSON line or a CSV row
    pub fn print_stream<T: Serialize>(&self, line: &str, data: &T) {
        match self.format {
            OutputFormat::Table => println!("{}", line),
            OutputFormat::Json => {
                if let Ok(json) = serde_json::to_string(data) {
                    println!("{}", json);
                }
            }
            OutputFormat::Csv => {
                if let Ok(serde_json::Value::Object(row)) = serde_json::to_value(data) {
                    let values: Vec<String> = row.values().map(csv_cell).collect();
                    println!("{}", values.join(","));
                }
            }
        }
    }

    /// Print key-value pairs
    pub fn print_kv(&self, pairs: &[(&str, String)]) {
        match self.format {
            OutputFormat::Table => {
                for (key, value) in pairs {
                    println!("{}: {}", key.bold(), value);
                }
            }
            OutputFormat::Json => {
                let map: serde_json::Map<String, serde_json::Value> = pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&map).unwrap_or_else(|_| "{}".to_string())
                );
            }
            OutputFormat::Csv => {
                let keys: Vec<&str> = pairs.iter().map(|(k, _)| *k).collect();
                println!("{}", keys.join(","));
                let values: Vec<String> = pairs.iter().map(|(_, v)| escape_csv(v)).collect();
                println!("{}", values.join(","));
            }
        }
    }
}

/// Print data as CSV
fn print_csv<T: Serialize>(data: &[T]) {
    let Some(first) = data.first() else {
        return;
    };

    // Field names come from the first item
    let first = serde_json::to_value(first).unwrap_or_default();
    if let serde_json::Value::Object(map) = &first {
        let headers: Vec<&str> = map.keys().map(|s| s.as_str()).collect();
        println!("{}", headers.join(","));

        for item in data {
            if let Ok(serde_json::Value::Object(row)) = serde_json::to_value(item) {
                let values: Vec<String> = headers
                    .iter()
                    .map(|h| row.get(*h).map(csv_cell).unwrap_or_default())
                    .collect();
                println!("{}", values.join(","));
            }
        }
    }
}

fn csv_cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => escape_csv(s),
        serde_json::Value::Null => String::new(),
        other => escape_csv(&other.to_string()),
    }
}

/// Escape a value for CSV output
fn escape_csv(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// =============================================================================
// Display types for various commands
// =============================================================================

/// Network display for networks command
#[derive(Debug, Tabled, Serialize)]
pub struct NetworkRow {
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Driver")]
    pub driver: String,
    #[tabled(rename = "Channel")]
    pub channel: String,
    #[tabled(rename = "Bitrate")]
    pub bitrate: String,
    #[tabled(rename = "Signals")]
    pub signal_database: String,
    #[tabled(rename = "Diagnostics")]
    pub diagnostic_database: String,
    #[tabled(rename = "ECU")]
    pub ecu: String,
}

/// Message display for signals command
#[derive(Debug, Tabled, Serialize)]
pub struct MessageRow {
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Length")]
    pub length: usize,
    #[tabled(rename = "Signals")]
    pub signals: usize,
    #[tabled(rename = "Senders")]
    pub senders: String,
}

/// Signal display for signals --message
#[derive(Debug, Tabled, Serialize)]
pub struct SignalRow {
    #[tabled(rename = "Signal")]
    pub name: String,
    #[tabled(rename = "Start")]
    pub start_bit: u16,
    #[tabled(rename = "Length")]
    pub bit_length: u16,
    #[tabled(rename = "Order")]
    pub byte_order: String,
    #[tabled(rename = "Scale")]
    pub scale: String,
    #[tabled(rename = "Offset")]
    pub offset: String,
    #[tabled(rename = "Unit")]
    pub unit: String,
    #[tabled(rename = "Choices")]
    pub choices: usize,
}

/// ECU layer display for layers command
#[derive(Debug, Tabled, Serialize)]
pub struct EcuRow {
    #[tabled(rename = "ECU")]
    pub name: String,
    #[tabled(rename = "Request ID")]
    pub request_id: String,
    #[tabled(rename = "Response ID")]
    pub response_id: String,
    #[tabled(rename = "Services")]
    pub services: usize,
    #[tabled(rename = "Description")]
    pub description: String,
}

/// Service display for layers --ecu
#[derive(Debug, Tabled, Serialize)]
pub struct ServiceRow {
    #[tabled(rename = "Service")]
    pub name: String,
    #[tabled(rename = "SID")]
    pub service_id: String,
    #[tabled(rename = "Request")]
    pub request: String,
    #[tabled(rename = "Response")]
    pub response: String,
    #[tabled(rename = "NRCs")]
    pub nrcs: String,
}

/// Latest signal value display
#[derive(Debug, Tabled, Serialize)]
pub struct ValueRow {
    #[tabled(rename = "Signal")]
    pub signal: String,
    #[tabled(rename = "Value")]
    pub value: String,
    #[tabled(rename = "Unit")]
    pub unit: String,
    #[tabled(rename = "Time")]
    pub time: String,
}

/// Trace row display for trace --rows
#[derive(Debug, Tabled, Serialize)]
pub struct FrameRow {
    #[tabled(rename = "Line")]
    pub line: usize,
    #[tabled(rename = "Time")]
    pub timestamp: String,
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "DLC")]
    pub dlc: usize,
    #[tabled(rename = "Data")]
    pub data: String,
}

/// Streamed event for monitor command
#[derive(Debug, Serialize)]
pub struct StreamRow {
    pub time: String,
    pub message: String,
    pub signal: String,
    pub value: String,
    pub unit: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_csv() {
        assert_eq!(escape_csv("plain"), "plain");
        assert_eq!(escape_csv("a,b"), "\"a,b\"");
        assert_eq!(escape_csv("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_csv_cell() {
        assert_eq!(csv_cell(&serde_json::json!(null)), "");
        assert_eq!(csv_cell(&serde_json::json!(20.5)), "20.5");
        assert_eq!(csv_cell(&serde_json::json!("km/h")), "km/h");
    }
}
