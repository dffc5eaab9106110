//! Monitor command - live signal view of a configured network

use anyhow::{Context, Result};
use candiag_core::{DefaultFrameSourceFactory, NetworkEvent, NetworkSession};
use candiag_signals::format_frame_id;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use crate::config::Config;
use crate::output::{OutputContext, StreamRow};

pub struct MonitorOptions {
    /// CSV log file
    pub log: Option<PathBuf>,
    /// Run time; until Ctrl+C when unset
    pub duration: Option<Duration>,
    pub frames: bool,
}

/// Parse a `--duration` argument given in (fractional) seconds
pub fn parse_seconds(value: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", value))?;
    if secs < 0.0 {
        return Err(format!("duration must not be negative, got {}", value));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration '{}': {}", value, e))
}

/// Connect, print events until the deadline or Ctrl+C, then disconnect
pub async fn monitor(
    config: &Config,
    network: &str,
    options: MonitorOptions,
    ctx: &OutputContext,
) -> Result<()> {
    let MonitorOptions {
        log,
        duration,
        frames,
    } = options;
    let network_config = config.network(network)?;
    let session = NetworkSession::from_config(
        network_config,
        Arc::new(DefaultFrameSourceFactory::new()),
    )
    .with_context(|| format!("Failed to prepare network '{}'", network))?;
    if session.signal_database().is_none() {
        ctx.warn("No signal database configured; only frames can be shown");
    }

    let mut events = session.subscribe();
    session
        .connect_configured()
        .await
        .with_context(|| format!("Failed to connect network '{}'", network))?;
    ctx.success(&format!(
        "Connected to {} on {}",
        network,
        session.config().channel.interface()
    ));

    if let Some(path) = log {
        let path = session
            .start_logging(Some(path))
            .context("Failed to start logging")?;
        ctx.info(&format!("Logging frames to {}", path.display()));
    }
    ctx.info("Press Ctrl+C to stop");

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = &mut interrupt => {
                ctx.info("\nInterrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(NetworkEvent::Signal { message, signal }) => {
                    let value = signal.value.to_string();
                    let unit = signal.unit.clone().unwrap_or_default();
                    let line = format!(
                        "{:>12.6}  {:<20} {:<24} {} {}",
                        signal.timestamp, message, signal.name, value, unit
                    );
                    ctx.print_stream(
                        &line,
                        &StreamRow {
                            time: format!("{:.6}", signal.timestamp),
                            message,
                            signal: signal.name,
                            value,
                            unit,
                        },
                    );
                }
                Ok(NetworkEvent::Frame { frame }) if frames => {
                    let line = format!(
                        "{:>12.6}  {:>8}  [{}] {}",
                        frame.timestamp,
                        format_frame_id(frame.id),
                        frame.dlc(),
                        frame.data_hex()
                    );
                    ctx.print_stream(&line, &frame);
                }
                Ok(NetworkEvent::Frame { .. }) => {}
                Ok(NetworkEvent::ConnectionClosed { fault }) => {
                    if let Some(fault) = fault {
                        ctx.error(&format!("Connection lost: {}", fault));
                    }
                    break;
                }
                Err(RecvError::Lagged(skipped)) => {
                    ctx.warn(&format!("Display lagging, skipped {} events", skipped));
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    if session.logging().running {
        let written = session.stop_logging().await.context("Failed to stop logging")?;
        ctx.success(&format!("Logged {} frames", written));
    }

    let stats = session.stats();
    session.disconnect().await?;
    ctx.print_kv(&[
        ("Frames received", stats.frames_received.to_string()),
        ("Frames decoded", stats.frames_decoded.to_string()),
        ("Unknown IDs", stats.unknown_ids.to_string()),
        ("Decode errors", stats.decode_errors.to_string()),
    ]);
    Ok(())
}
