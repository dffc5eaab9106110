//! Trace replay frame source
//!
//! Plays a trace file back as a receive-only channel. Frames keep their
//! relative timing, scaled by the speed factor; speed 0 delivers them as
//! fast as they are read. Once the trace is exhausted `recv` keeps timing
//! out like an idle bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

use super::FrameSource;
use crate::config::ReplayOptions;
use crate::error::{ConnectionError, TransportError};
use crate::frame::{monotonic_seconds, Frame};
use crate::trace::{read_frames, TraceRecord};

pub struct ReplaySource {
    name: String,
    speed: f64,
    records: Vec<TraceRecord>,
    cursor: Mutex<Cursor>,
    open: AtomicBool,
}

struct Cursor {
    next: usize,
    /// Wall-clock instant matching the first record's time
    started: Option<Instant>,
    finished_logged: bool,
}

impl ReplaySource {
    pub fn open(options: &ReplayOptions) -> Result<Self, ConnectionError> {
        let (records, malformed) =
            read_frames(&options.path).map_err(|e| ConnectionError::Open {
                channel: options.path.display().to_string(),
                reason: e.to_string(),
            })?;

        info!(
            path = %options.path.display(),
            frames = records.len(),
            malformed,
            speed = options.speed,
            "Replay source ready"
        );

        Ok(Self {
            name: options.path.display().to_string(),
            speed: options.speed.max(0.0),
            records,
            cursor: Mutex::new(Cursor {
                next: 0,
                started: None,
                finished_logged: false,
            }),
            open: AtomicBool::new(true),
        })
    }

    /// Frames not yet delivered
    pub fn remaining(&self) -> usize {
        self.records.len() - self.cursor.lock().next
    }

    /// `None` when the record lies beyond any representable instant
    fn due_at(&self, started: Instant, record: &TraceRecord) -> Option<Instant> {
        if self.speed == 0.0 {
            return Some(started);
        }
        let first = self.records.first().map(|r| r.time).unwrap_or(0.0);
        let offset = ((record.time - first) / self.speed).max(0.0);
        Duration::try_from_secs_f64(offset)
            .ok()
            .and_then(|offset| started.checked_add(offset))
    }
}

impl FrameSource for ReplaySource {
    fn recv(&self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }

        let mut cursor = self.cursor.lock();
        let Some(record) = self.records.get(cursor.next) else {
            if !cursor.finished_logged {
                cursor.finished_logged = true;
                info!(source = %self.name, "Replay finished");
            }
            drop(cursor);
            std::thread::sleep(timeout);
            return Ok(None);
        };

        let started = *cursor.started.get_or_insert_with(Instant::now);
        let now = Instant::now();
        let Some(due) = self.due_at(started, record).filter(|due| *due <= now + timeout) else {
            drop(cursor);
            std::thread::sleep(timeout);
            return Ok(None);
        };
        if due > now {
            std::thread::sleep(due - now);
        }

        cursor.next += 1;
        let mut frame = record.frame.clone();
        frame.timestamp = monotonic_seconds();
        Ok(Some(frame))
    }

    fn send(&self, _frame: &Frame) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(
            "replay channels are receive-only".to_string(),
        ))
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        format!("replay:{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn trace_file(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_fast_replay_in_order() {
        let file = trace_file(&["0.0,100,1,01", "junk", "5.0,101,1,02", "9.0,102,1,03"]);
        let source = ReplaySource::open(&ReplayOptions::new(file.path()).with_speed(0.0)).unwrap();

        let ids: Vec<u32> = (0..3)
            .map(|_| source.recv(Duration::from_millis(10)).unwrap().unwrap().id)
            .collect();
        assert_eq!(ids, vec![0x100, 0x101, 0x102]);
        assert_eq!(source.remaining(), 0);
        assert!(source.recv(Duration::from_millis(5)).unwrap().is_none());
    }

    #[test]
    fn test_timed_replay_respects_gaps() {
        let file = trace_file(&["0.0,100,1,01", "10.0,101,1,02"]);
        let source = ReplaySource::open(&ReplayOptions::new(file.path())).unwrap();

        assert!(source.recv(Duration::from_millis(10)).unwrap().is_some());
        assert!(source.recv(Duration::from_millis(20)).unwrap().is_none());
        assert_eq!(source.remaining(), 1);
    }

    #[test]
    fn test_out_of_range_timestamps_do_not_panic() {
        // inf and NaN fall back to their line numbers, 2 and 3 seconds in
        let file = trace_file(&["0.0,100,1,01", "inf,101,1,02", "NaN,102,1,03"]);
        let source = ReplaySource::open(&ReplayOptions::new(file.path())).unwrap();
        assert_eq!(source.recv(Duration::from_millis(10)).unwrap().unwrap().id, 0x100);
        assert!(source.recv(Duration::from_millis(10)).unwrap().is_none());
        assert_eq!(source.remaining(), 2);

        // an offset past any instant never comes due; the source stays idle
        let file = trace_file(&["0.0,100,1,01", "1e300,101,1,02"]);
        let source = ReplaySource::open(&ReplayOptions::new(file.path())).unwrap();
        assert!(source.recv(Duration::from_millis(10)).unwrap().is_some());
        assert!(source.recv(Duration::from_millis(10)).unwrap().is_none());
        assert_eq!(source.remaining(), 1);

        let fast = ReplaySource::open(&ReplayOptions::new(file.path()).with_speed(0.0)).unwrap();
        assert!(fast.recv(Duration::from_millis(10)).unwrap().is_some());
        assert_eq!(fast.recv(Duration::from_millis(10)).unwrap().unwrap().id, 0x101);
    }

    #[test]
    fn test_send_rejected_and_close() {
        let file = trace_file(&["0.0,100,1,01"]);
        let source = ReplaySource::open(&ReplayOptions::new(file.path())).unwrap();
        assert!(matches!(
            source.send(&Frame::new(0x1, vec![0])),
            Err(TransportError::Unsupported(_))
        ));
        source.close();
        assert_eq!(source.recv(Duration::from_millis(1)), Err(TransportError::Closed));
    }
}
