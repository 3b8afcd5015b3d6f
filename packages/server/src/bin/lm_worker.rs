//! LM worker host: consumes the request stream and executes completions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;
use tracing::info;

use extraction::TemperatureSchedule;
use server_core::broker::{LmWorkerConfig, LmWorkerPool, StreamConfig};
use server_core::clients::LmHttpClient;
use server_core::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    if config.log_format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    info!(workers = config.lm_worker_count, "starting LM worker host");

    let client = redis::Client::open(config.redis_url.as_str()).context("invalid REDIS_URL")?;
    let redis = ConnectionManager::new(client)
        .await
        .context("failed to connect to Redis")?;

    let endpoint = Arc::new(LmHttpClient::new(
        &config.lm_endpoint_url,
        &config.lm_api_key,
        &config.lm_model,
        Duration::from_secs(config.lm_request_timeout_secs),
    )?);

    let stream = StreamConfig {
        max_queue_depth: config.lm_queue_max_depth,
        slow_queue_depth: config.lm_queue_slow_depth,
        ..StreamConfig::default()
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let mut pools = Vec::new();
    for _ in 0..config.lm_worker_count.max(1) {
        let pool = Arc::new(LmWorkerPool::new(
            redis.clone(),
            endpoint.clone(),
            stream.clone(),
            LmWorkerConfig {
                initial_concurrency: config.lm_concurrency_initial,
                min_concurrency: config.lm_concurrency_min,
                max_concurrency: config.lm_concurrency_max,
                max_retries: config.lm_max_retries,
                schedule: TemperatureSchedule {
                    base: config.lm_base_temperature,
                    increment: config.lm_temperature_increment,
                },
                ..LmWorkerConfig::default()
            },
        ));
        pools.push(tokio::spawn(pool.run(shutdown.clone())));
    }

    for pool in pools {
        let _ = pool.await;
    }
    info!("LM worker host stopped");
    Ok(())
}
