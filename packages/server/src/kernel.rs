//! Shared process-wide state: configuration and connection pools.

use std::sync::Arc;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::Config;

/// Connection pools and configuration shared by every worker.
///
/// Initialized once at startup; everything else borrows through an
/// `Arc<ServerKernel>`.
pub struct ServerKernel {
    pub config: Config,
    pub db: PgPool,
    pub redis: ConnectionManager,
}

impl ServerKernel {
    /// Connect pools and run pending migrations.
    pub async fn connect(config: Config) -> Result<Arc<Self>> {
        let db = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("failed to connect to Postgres")?;

        sqlx::migrate!("./migrations")
            .run(&db)
            .await
            .context("failed to run migrations")?;

        let client = redis::Client::open(config.redis_url.as_str())
            .context("invalid REDIS_URL")?;
        let redis = ConnectionManager::new(client)
            .await
            .context("failed to connect to Redis")?;

        tracing::info!("kernel connected");
        Ok(Arc::new(Self { config, db, redis }))
    }
}
