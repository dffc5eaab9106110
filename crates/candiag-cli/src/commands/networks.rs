//! Networks command - show configured networks

use crate::config::Config;
use crate::output::{NetworkRow, OutputContext};

fn path_or_dash(path: Option<&std::path::PathBuf>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// List the networks of the configuration file
pub fn networks(config: &Config, ctx: &OutputContext) {
    match &config.path {
        Some(path) => ctx.info(&format!("Configuration: {}", path.display())),
        None => ctx.warn("No configuration file found"),
    }

    let rows: Vec<NetworkRow> = config
        .app
        .networks
        .iter()
        .map(|n| NetworkRow {
            name: n.name.clone(),
            driver: n.channel.driver.to_string(),
            channel: n.channel.interface(),
            bitrate: match n.fd_bitrate {
                Some(fd) => format!("{}/{}", n.bitrate, fd),
                None => n.bitrate.to_string(),
            },
            signal_database: path_or_dash(n.signal_database.as_ref()),
            diagnostic_database: path_or_dash(n.diagnostic_database.as_ref()),
            ecu: n.ecu.clone().unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    ctx.print(&rows);
}
