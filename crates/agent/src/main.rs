//! NOC telemetry agent
//!
//! Polls network devices over SNMP, receives syslog and NetFlow exports, and
//! publishes normalized samples to in-process subscribers. Exposes health,
//! readiness, Prometheus metrics and device status over HTTP.

use anyhow::{Context, Result};
use noc_agent_lib::{CollectorMetrics, TelemetryService};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting noc-agent");

    let config = config::AgentConfig::load().context("Failed to load agent configuration")?;
    info!(
        node_name = %config.node_name,
        devices = config.devices.len(),
        "Agent configured"
    );

    let metrics = CollectorMetrics::new();
    let service = TelemetryService::start(
        config.service_config(),
        config.devices(),
        config.catalogue(),
        metrics,
    )
    .await
    .context("Failed to start telemetry collector")?;

    let app_state = Arc::new(api::AppState::new(
        service.health().clone(),
        service.status_handle(),
    ));
    let api_port = config.api_port;
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(api_port, app_state).await {
            error!(error = %e, "API server failed");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    service.shutdown("SIGINT received").await;
    api_handle.abort();
    info!("Shutting down");

    Ok(())
}
