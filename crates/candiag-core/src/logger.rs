//! Queue-backed CSV frame logger
//!
//! Producers enqueue frames from any thread; a tokio task drains the queue
//! on a fixed cadence and hands the formatted rows to a blocking task that
//! appends and flushes them. `stop` drains everything enqueued before it was
//! called, then closes the file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::LoggerError;
use crate::frame::Frame;

/// First line of every log file
pub const LOG_HEADER: &str = "Timestamp, ID_Hex, DLC, Data_Hex, IsExtended, IsRemote, IsError";

/// Snapshot of the logging state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogProgress {
    pub path: Option<PathBuf>,
    pub running: bool,
    pub messages: u64,
}

/// Format one frame as a log row
pub fn format_row(frame: &Frame) -> String {
    format!(
        "{:.6},{:X},{},{},{},{},{}",
        frame.timestamp,
        frame.id,
        frame.dlc(),
        frame.data_hex(),
        frame.is_extended,
        frame.is_remote,
        frame.is_error
    )
}

struct Active {
    path: PathBuf,
    queue: mpsc::UnboundedSender<Frame>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<u64, LoggerError>>,
}

/// Asynchronous frame logger
pub struct FrameLogger {
    flush_interval: Duration,
    active: Mutex<Option<Active>>,
    count: Arc<AtomicU64>,
    progress: watch::Sender<u64>,
}

impl FrameLogger {
    pub fn new(flush_interval: Duration) -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            flush_interval,
            active: Mutex::new(None),
            count: Arc::new(AtomicU64::new(0)),
            progress,
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Rows written by the current (or last) run
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Message count updates, one per drain cycle that wrote rows
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> LogProgress {
        let active = self.active.lock();
        LogProgress {
            path: active.as_ref().map(|a| a.path.clone()),
            running: active.is_some(),
            messages: self.count(),
        }
    }

    /// Create `path`, write the header and start the consumer task
    ///
    /// Must be called within a tokio runtime.
    pub fn start(&self, path: impl AsRef<Path>) -> Result<(), LoggerError> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(LoggerError::AlreadyRunning);
        }

        let path = path.as_ref().to_path_buf();
        let mut writer = BufWriter::new(File::create(&path)?);
        writeln!(writer, "{}", LOG_HEADER)?;
        writer.flush()?;

        self.count.store(0, Ordering::SeqCst);
        self.progress.send_if_modified(|total| std::mem::replace(total, 0) != 0);

        let (queue, rx) = mpsc::unbounded_channel();
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(consume(
            writer,
            rx,
            stop_rx,
            self.flush_interval,
            self.count.clone(),
            self.progress.clone(),
        ));

        info!(path = %path.display(), "Logging started");
        *active = Some(Active {
            path,
            queue,
            stop,
            task,
        });
        Ok(())
    }

    /// Queue a frame; ignored when logging is not running
    pub fn enqueue(&self, frame: &Frame) -> bool {
        match self.active.lock().as_ref() {
            Some(active) => active.queue.send(frame.clone()).is_ok(),
            None => false,
        }
    }

    /// Drain the queue, close the file and return the total row count
    pub async fn stop(&self) -> Result<u64, LoggerError> {
        let active = self.active.lock().take().ok_or(LoggerError::NotRunning)?;
        let _ = active.stop.send(());
        drop(active.queue);

        let written = match active.task.await {
            Ok(result) => result?,
            Err(e) => return Err(LoggerError::Io(format!("logger task failed: {}", e))),
        };
        info!(path = %active.path.display(), messages = written, "Logging stopped");
        Ok(written)
    }

    /// Stop without waiting for the drain; used on forced shutdown
    pub fn abort(&self) {
        if let Some(active) = self.active.lock().take() {
            let _ = active.stop.send(());
            debug!(path = %active.path.display(), "Logging stop requested");
        }
    }
}

async fn consume(
    mut writer: BufWriter<File>,
    mut queue: mpsc::UnboundedReceiver<Frame>,
    mut stop: oneshot::Receiver<()>,
    flush_interval: Duration,
    count: Arc<AtomicU64>,
    progress: watch::Sender<u64>,
) -> Result<u64, LoggerError> {
    let mut ticker = tokio::time::interval(flush_interval);
    loop {
        let stopping = tokio::select! {
            _ = ticker.tick() => false,
            _ = &mut stop => true,
        };

        let (rows, written) = drain(&mut queue);
        if written > 0 {
            writer = match write_rows(writer, rows).await {
                Ok(writer) => writer,
                Err(e) => {
                    error!(error = %e, "Failed to write log rows");
                    return Err(e);
                }
            };
            let total = count.fetch_add(written, Ordering::SeqCst) + written;
            progress.send_replace(total);
        }
        if stopping {
            break;
        }
    }
    Ok(count.load(Ordering::SeqCst))
}

/// Format everything queued so far
fn drain(queue: &mut mpsc::UnboundedReceiver<Frame>) -> (String, u64) {
    let mut rows = String::new();
    let mut written = 0u64;
    while let Ok(frame) = queue.try_recv() {
        rows.push_str(&format_row(&frame));
        rows.push('\n');
        written += 1;
    }
    (rows, written)
}

async fn write_rows(
    mut writer: BufWriter<File>,
    rows: String,
) -> Result<BufWriter<File>, LoggerError> {
    tokio::task::spawn_blocking(move || {
        writer.write_all(rows.as_bytes())?;
        writer.flush()?;
        Ok::<_, LoggerError>(writer)
    })
    .await
    .map_err(|e| LoggerError::Io(format!("log writer failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::read_frames;

    #[test]
    fn test_row_format() {
        let frame = Frame::new(0x1A0, vec![0xDE, 0xAD]).with_timestamp(1.5);
        assert_eq!(format_row(&frame), "1.500000,1A0,2,DEAD,false,false,false");
    }

    #[tokio::test]
    async fn test_every_enqueued_frame_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let logger = FrameLogger::new(Duration::from_millis(50));
        logger.start(&path).unwrap();
        assert!(logger.is_running());

        for i in 0..250u32 {
            assert!(logger.enqueue(&Frame::new(0x100 + i, vec![i as u8])));
        }
        assert_eq!(logger.stop().await.unwrap(), 250);
        assert!(!logger.is_running());
        assert!(!logger.enqueue(&Frame::new(0x1, vec![0])));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 251);
        assert_eq!(lines[0], LOG_HEADER);
        assert!(lines[1].contains(",100,1,00,"));
        assert!(lines[250].contains(",1F9,1,F9,"));
    }

    #[tokio::test]
    async fn test_log_reads_back_as_trace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let logger = FrameLogger::new(Duration::from_millis(10));
        logger.start(&path).unwrap();
        logger.enqueue(&Frame::new(0x18FF50E5, vec![1, 2, 3]));
        logger.enqueue(&Frame::new(0x7FF, Vec::new()).remote());
        logger.stop().await.unwrap();

        let (records, malformed) = read_frames(&path).unwrap();
        assert_eq!(malformed, 0);
        assert_eq!(records.len(), 2);
        assert!(records[0].frame.is_extended);
        assert_eq!(records[0].frame.data.as_ref(), &[1, 2, 3]);
        assert!(records[1].frame.is_remote);
    }

    #[tokio::test]
    async fn test_progress_updates() {
        let dir = tempfile::tempdir().unwrap();
        let logger = FrameLogger::new(Duration::from_millis(10));
        let mut updates = logger.subscribe();
        logger.start(dir.path().join("log.csv")).unwrap();
        logger.enqueue(&Frame::new(0x10, vec![0]));

        tokio::time::timeout(Duration::from_secs(1), updates.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*updates.borrow(), 1);
        assert_eq!(logger.progress().messages, 1);
        assert!(logger.progress().running);
        logger.stop().await.unwrap();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_rows_flushed_each_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let logger = FrameLogger::new(Duration::from_millis(10));
        let mut updates = logger.subscribe();
        logger.start(&path).unwrap();

        for batch in 1..=3u64 {
            for _ in 0..100 {
                logger.enqueue(&Frame::new(0x200, vec![batch as u8]));
            }
            tokio::time::timeout(Duration::from_secs(1), updates.changed())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(*updates.borrow(), batch * 100);
            // The cycle flushed: everything counted so far is on disk
            let lines = std::fs::read_to_string(&path).unwrap().lines().count() as u64;
            assert_eq!(lines, batch * 100 + 1);
        }
        assert_eq!(logger.stop().await.unwrap(), 300);
    }

    #[tokio::test]
    async fn test_start_twice_and_stop_idle() {
        let dir = tempfile::tempdir().unwrap();
        let logger = FrameLogger::new(Duration::from_millis(10));
        assert_eq!(logger.stop().await, Err(LoggerError::NotRunning));
        logger.start(dir.path().join("a.csv")).unwrap();
        assert_eq!(
            logger.start(dir.path().join("b.csv")),
            Err(LoggerError::AlreadyRunning)
        );
        logger.stop().await.unwrap();
    }
}
