//! Captured CAN frames

use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;

/// Largest CAN FD payload
pub const MAX_FD_DATA: usize = 64;
/// Largest classic CAN payload
pub const MAX_CLASSIC_DATA: usize = 8;

/// One CAN frame; immutable once captured
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    /// 11- or 29-bit arbitration identifier
    pub id: u32,
    #[serde(serialize_with = "serialize_hex")]
    pub data: Bytes,
    pub is_extended: bool,
    pub is_remote: bool,
    pub is_error: bool,
    pub is_fd: bool,
    /// Monotonic seconds
    pub timestamp: f64,
}

fn serialize_hex<S: serde::Serializer>(data: &Bytes, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode_upper(data))
}

impl Frame {
    /// Data frame stamped with the current monotonic time
    pub fn new(id: u32, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            id,
            is_extended: id > 0x7FF,
            is_fd: data.len() > MAX_CLASSIC_DATA,
            data,
            is_remote: false,
            is_error: false,
            timestamp: monotonic_seconds(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn extended(mut self, extended: bool) -> Self {
        self.is_extended = extended;
        self
    }

    pub fn remote(mut self) -> Self {
        self.is_remote = true;
        self
    }

    pub fn error(mut self) -> Self {
        self.is_error = true;
        self
    }

    pub fn dlc(&self) -> usize {
        self.data.len()
    }

    /// Frames the decoder should see: data frames with payload
    pub fn is_decodable(&self) -> bool {
        !self.is_remote && !self.is_error && !self.data.is_empty()
    }

    pub fn data_hex(&self) -> String {
        hex::encode_upper(&self.data)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_extended {
            write!(f, "{:08X}", self.id)?;
        } else {
            write!(f, "{:03X}", self.id)?;
        }
        write!(f, " [{}]", self.data.len())?;
        for byte in self.data.iter() {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

/// Seconds since the first call in this process
pub fn monotonic_seconds() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Smallest CAN FD length that holds `len` bytes
pub fn fd_frame_len(len: usize) -> usize {
    match len {
        0..=8 => len,
        9..=12 => 12,
        13..=16 => 16,
        17..=20 => 20,
        21..=24 => 24,
        25..=32 => 32,
        33..=48 => 48,
        _ => 64,
    }
}
