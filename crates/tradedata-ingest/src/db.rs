//! Database connection pool and migrations

use anyhow::Context;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::IngestConfig;

/// Seconds to wait for a pooled connection.
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;

pub async fn create_pool(config: &IngestConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .acquire_timeout(Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS))
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!(
        max_connections = config.database_max_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

/// Apply the embedded `records` and `ingestion_state` migrations
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");
    Ok(())
}
