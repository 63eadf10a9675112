//! Application setup and initialization
//!
//! Startup order: configuration validation, tracing, database, services, routes.

pub mod database;
pub mod routes;
pub mod server;
pub mod services;

use crate::state::AppState;
use anyhow::{Context, Result};
use keystone_core::Config;
use keystone_infra::{init_telemetry, LogFormat};
use keystone_worker::WorkerContext;
use std::sync::Arc;

pub const SERVICE_NAME: &str = "keystone-api";

/// Initialize the entire application. The returned worker context is spawned by the caller
/// once the transports are known.
pub async fn initialize_app(
    config: &Config,
) -> Result<(Arc<AppState>, axum::Router, WorkerContext)> {
    // Fail fast on misconfiguration
    config.validate().context("Configuration validation failed")?;

    init_telemetry(SERVICE_NAME, LogFormat::for_environment(config.environment()))
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    tracing::info!(
        environment = %config.environment(),
        "Configuration loaded and validated successfully"
    );

    let pool = database::setup_database(config).await?;

    let (state, worker) = services::initialize_services(config, pool)?;

    let router = routes::setup_routes(config, state.clone());

    Ok((state, router, worker))
}
