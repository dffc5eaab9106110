//! Layers command - inspect a diagnostic database

use anyhow::{Context, Result};
use candiag_layers::{DiagnosticDatabase, ParamDef};
use std::path::Path;

use crate::output::{EcuRow, OutputContext, ServiceRow};

fn describe_params(params: &[ParamDef]) -> String {
    params
        .iter()
        .map(|p| format!("{}:{}", p.name, format!("{:?}", p.param_type).to_lowercase()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Show the ECU layers of a database, or the services of one ECU
pub fn layers(path: &Path, ecu: Option<&str>, ctx: &OutputContext) -> Result<()> {
    let db = DiagnosticDatabase::load(path)
        .with_context(|| format!("Failed to load diagnostic database: {}", path.display()))?;

    let Some(ecu) = ecu else {
        ctx.info(&format!("{}: {} ECU layers", db.meta().name, db.len()));
        let rows: Vec<EcuRow> = db
            .ecus()
            .iter()
            .map(|layer| EcuRow {
                name: layer.name.clone(),
                request_id: layer
                    .addressing
                    .as_ref()
                    .map(|a| format!("0x{:X}", a.request_id))
                    .unwrap_or_else(|| "-".to_string()),
                response_id: layer
                    .addressing
                    .as_ref()
                    .map(|a| format!("0x{:X}", a.response_id))
                    .unwrap_or_else(|| "-".to_string()),
                services: layer.services.len(),
                description: layer.description.clone().unwrap_or_default(),
            })
            .collect();
        ctx.print(&rows);
        return Ok(());
    };

    let layer = db
        .ecu(ecu)
        .with_context(|| format!("No ECU '{}' in {}", ecu, path.display()))?;
    let rows: Vec<ServiceRow> = layer
        .services
        .iter()
        .map(|s| ServiceRow {
            name: s.name.clone(),
            service_id: format!("0x{:02X}", s.service_id),
            request: describe_params(&s.request),
            response: describe_params(&s.positive_response),
            nrcs: s
                .negative_response_codes
                .iter()
                .map(|c| format!("0x{:02X}", c))
                .collect::<Vec<_>>()
                .join(" "),
        })
        .collect();
    ctx.print(&rows);
    Ok(())
}
