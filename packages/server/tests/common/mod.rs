//! Test harness with testcontainers for integration testing.
//!
//! Containers are started once and shared across the test binary. Each
//! harness gets its own freshly migrated database, so claim tests never
//! see another test's jobs; Redis is shared and tests isolate themselves
//! with per-test key prefixes.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;
use uuid::Uuid;

use server_core::jobs::job::{Job, JOB_COLUMNS};

// =============================================================================
// Shared Test Infrastructure
// =============================================================================

/// Shared containers that persist across all tests in the binary.
struct SharedTestInfra {
    /// Base Postgres URL without a database name.
    pg_base_url: String,
    redis_url: String,
    // Keep containers alive for the entire test run
    _postgres: ContainerAsync<GenericImage>,
    _redis: ContainerAsync<Redis>,
}

/// Global shared infrastructure - initialized once, reused by all tests.
static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Respect RUST_LOG; try_init avoids panicking when another test
        // already installed a subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        // pgvector image so the vector-collection migration applies.
        let postgres = GenericImage::new("pgvector/pgvector", "pg16")
            .with_wait_for(WaitFor::message_on_stderr(
                "database system is ready to accept connections",
            ))
            .with_exposed_port(ContainerPort::Tcp(5432))
            .with_env_var("POSTGRES_PASSWORD", "postgres")
            .with_env_var("POSTGRES_USER", "postgres")
            .with_env_var("POSTGRES_DB", "postgres")
            .start()
            .await
            .context("failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let pg_base_url = format!("postgresql://postgres:postgres@{pg_host}:{pg_port}");

        let redis = Redis::default()
            .start()
            .await
            .context("failed to start Redis container")?;

        let redis_host = redis.get_host().await?;
        let redis_port = redis.get_host_port_ipv4(6379).await?;
        let redis_url = format!("redis://{redis_host}:{redis_port}");

        Ok(Self {
            pg_base_url,
            redis_url,
            _postgres: postgres,
            _redis: redis,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("failed to initialize shared test infrastructure")
            })
            .await
    }
}

// =============================================================================
// Per-test harness
// =============================================================================

/// Per-test infrastructure: a fresh migrated database plus a Redis
/// connection against the shared containers.
pub struct TestHarness {
    pub db_pool: PgPool,
    pub redis: ConnectionManager,
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        // One database per harness keeps concurrent tests from claiming
        // each other's jobs.
        let db_name = format!("test_{}", Uuid::new_v4().simple());
        let admin = PgPool::connect(&format!("{}/postgres", infra.pg_base_url))
            .await
            .context("failed to connect for database creation")?;
        sqlx::query(&format!(r#"CREATE DATABASE "{db_name}""#))
            .execute(&admin)
            .await
            .context("failed to create test database")?;
        admin.close().await;

        let db_pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&format!("{}/{db_name}", infra.pg_base_url))
            .await
            .context("failed to connect to test database")?;

        sqlx::migrate!("./migrations")
            .run(&db_pool)
            .await
            .context("failed to run migrations")?;

        let client = redis::Client::open(infra.redis_url.as_str())?;
        let redis = ConnectionManager::new(client)
            .await
            .context("failed to connect to Redis")?;

        Ok(Self { db_pool, redis })
    }

    /// Read a job row directly for assertions.
    #[allow(dead_code)]
    pub async fn fetch_job(&self, job_id: Uuid) -> Job {
        sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_one(&self.db_pool)
            .await
            .expect("job must exist")
    }

    /// Push a running job's heartbeat into the past (simulated worker
    /// death).
    #[allow(dead_code)]
    pub async fn age_heartbeat(&self, job_id: Uuid) {
        sqlx::query(
            "UPDATE jobs SET last_heartbeat_at = NOW() - INTERVAL '1 hour' WHERE id = $1",
        )
        .bind(job_id)
        .execute(&self.db_pool)
        .await
        .expect("heartbeat backdate must succeed");
    }
}
