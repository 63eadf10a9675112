//! Postgres pool and schema migrations

use anyhow::{Context, Result};
use keystone_core::Config;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

const IDLE_TIMEOUT: Duration = Duration::from_secs(600);
const MAX_CONNECTION_LIFETIME: Duration = Duration::from_secs(1800);

/// Connect, then apply the embedded migrations before any request is served.
pub async fn setup_database(config: &Config) -> Result<PgPool> {
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections())
        .acquire_timeout(Duration::from_secs(config.db_timeout_seconds()))
        .idle_timeout(IDLE_TIMEOUT)
        .max_lifetime(MAX_CONNECTION_LIFETIME)
        .connect(config.database_url())
        .await
        .context("Failed to connect to database")?;

    tracing::info!(
        max_connections = config.db_max_connections(),
        "Database connected"
    );

    let migrator = &keystone_db::MIGRATOR;
    migrator
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!(
        known_migrations = migrator.iter().count(),
        "Database schema up to date"
    );

    Ok(pool)
}
