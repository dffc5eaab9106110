//! Diag command - run one UDS request

use anyhow::{anyhow, bail, Context, Result};
use candiag_core::{
    DefaultFrameSourceFactory, DiagnosticRequest, Driver, NetworkSession, Outcome, SimulatedEcu,
};
use std::sync::Arc;

use crate::config::Config;
use crate::output::OutputContext;

/// Connect to a network, run a request against its ECU and print the result
pub async fn diag(
    config: &Config,
    network: &str,
    kind: &str,
    args: &[String],
    ecu: Option<&str>,
    simulate: bool,
    ctx: &OutputContext,
) -> Result<()> {
    let request = DiagnosticRequest::from_args(kind, args)
        .with_context(|| format!("Invalid {} request", kind))?;

    let mut network_config = config.network(network)?;
    if let Some(ecu) = ecu {
        network_config.ecu = Some(ecu.to_string());
    }
    let channel = network_config.channel.clone();

    let factory = Arc::new(DefaultFrameSourceFactory::new());
    let session = NetworkSession::from_config(network_config, factory.clone())
        .with_context(|| format!("Failed to prepare network '{}'", network))?;

    let simulator = if simulate {
        if channel.driver != Driver::Virtual {
            bail!("--simulate needs a virtual channel, '{}' uses {}", network, channel.driver);
        }
        let name = session
            .selected_ecu()
            .ok_or_else(|| anyhow!("No ECU selected for network '{}'", network))?;
        let addressing = session
            .diagnostic_database()
            .and_then(|db| db.ecu(&name).and_then(|layer| layer.addressing))
            .ok_or_else(|| anyhow!("ECU '{}' has no addressing", name))?;
        let endpoint = factory.virtual_bus(&channel.app_name).endpoint();
        Some(SimulatedEcu::new(name, addressing.request_id, addressing.response_id).spawn(endpoint))
    } else {
        None
    };

    session
        .connect_configured()
        .await
        .with_context(|| format!("Failed to connect network '{}'", network))?;

    let result = session.diagnose(&request).await;
    session.disconnect().await?;
    if let Some(simulator) = simulator {
        simulator.shutdown().await;
    }
    let result = result.context("Diagnostic request failed")?;

    match result.outcome {
        Outcome::Positive => ctx.success(&result.summary()),
        _ => ctx.error(&result.summary()),
    }

    let mut pairs: Vec<(&str, String)> = vec![
        ("ECU", result.ecu.clone()),
        ("Service", result.service.clone()),
        ("Request", hex::encode_upper(&result.request)),
        ("Response", hex::encode_upper(&result.response)),
    ];
    if let Some(text) = &result.nrc_text {
        pairs.push(("NRC", text.clone()));
    }
    let values: Vec<(String, String)> = result
        .values
        .iter()
        .map(|(k, v)| {
            let shown = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), shown)
        })
        .collect();
    pairs.extend(values.iter().map(|(k, v)| (k.as_str(), v.clone())));
    ctx.print_kv(&pairs);

    if result.outcome != Outcome::Positive {
        bail!("{}", result.summary());
    }
    Ok(())
}
