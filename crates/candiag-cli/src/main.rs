//! candiag - CAN network observation and UDS diagnostics from the terminal
//!
//! Inspects signal and diagnostic databases, decodes trace files, monitors a
//! configured network and runs single diagnostic requests.

mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;
use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "candiag")]
#[command(author, version, about = "CAN network observation and UDS diagnostics")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CANDIAG_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured networks
    Networks,

    /// Show the messages and signals of a signal database
    Signals {
        /// DBC, YAML or JSON database file
        db: PathBuf,

        /// Only show this message (name or frame id)
        #[arg(long)]
        message: Option<String>,
    },

    /// Show the ECU layers and services of a diagnostic database
    Layers {
        /// YAML/JSON description or .dpk bundle
        db: PathBuf,

        /// Only show services of this ECU
        #[arg(long)]
        ecu: Option<String>,
    },

    /// Load a trace file and summarize it
    Trace {
        /// Trace CSV file
        file: PathBuf,

        /// Signal database used to decode the rows
        #[arg(long)]
        db: Option<PathBuf>,

        /// Print every accepted row
        #[arg(long)]
        rows: bool,
    },

    /// Connect to a configured network and print decoded signals
    Monitor {
        /// Network name from the configuration file
        network: String,

        /// Write received frames to this CSV file
        #[arg(long)]
        log: Option<PathBuf>,

        /// Stop after this many seconds
        #[arg(long, value_parser = commands::parse_seconds)]
        duration: Option<Duration>,

        /// Print raw frames as well as signals
        #[arg(long)]
        frames: bool,
    },

    /// Run one diagnostic request against a configured network
    Diag {
        /// Network name from the configuration file
        network: String,

        /// Request type: read_did, read_dtc, clear_dtc, ecu_reset, security_access, write_did
        kind: String,

        /// Request arguments, decimal or 0x hex
        args: Vec<String>,

        /// ECU layer to address (overrides the configured ECU)
        #[arg(long)]
        ecu: Option<String>,

        /// Answer from a simulated ECU on virtual channels
        #[arg(long)]
        simulate: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("candiag_cli=debug,candiag_core=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("candiag_cli=info,candiag_core=info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }

    let ctx = OutputContext::new(cli.output, cli.no_color, cli.quiet);

    match &cli.command {
        Commands::Networks => {
            let config = Config::resolve(cli.config.as_deref())?;
            commands::networks(&config, &ctx);
        }

        Commands::Signals { db, message } => {
            commands::signals(db, message.as_deref(), &ctx)?;
        }

        Commands::Layers { db, ecu } => {
            commands::layers(db, ecu.as_deref(), &ctx)?;
        }

        Commands::Trace { file, db, rows } => {
            commands::trace(file, db.as_deref(), *rows, &ctx)?;
        }

        Commands::Monitor {
            network,
            log,
            duration,
            frames,
        } => {
            let config = Config::resolve(cli.config.as_deref())?;
            let options = commands::MonitorOptions {
                log: log.clone(),
                duration: *duration,
                frames: *frames,
            };
            commands::monitor(&config, network, options, &ctx).await?;
        }

        Commands::Diag {
            network,
            kind,
            args,
            ecu,
            simulate,
        } => {
            let config = Config::resolve(cli.config.as_deref())?;
            commands::diag(&config, network, kind, args, ecu.as_deref(), *simulate, &ctx).await?;
        }
    }

    Ok(())
}
