//! PostgreSQL-backed job store with atomic claim semantics.
//!
//! `claim_next` is the single point of contention between workers: one
//! transaction selects the best candidate with `FOR UPDATE SKIP LOCKED`
//! and mutates it, so a job is never handed to two workers at once.
//! Stale running jobs (dead worker, no heartbeat) are reclaimed through
//! the same path, with the previous claimant logged for audit.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use super::job::{Job, JobStatus, JobType, JOB_COLUMNS};

/// Narrow transactional interface over the jobs table.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Enqueue a job.
    async fn create(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        priority: i32,
    ) -> Result<Uuid>;

    /// Atomically claim the best queued job of `job_type`, or a running
    /// one whose heartbeat is older than `stale_threshold`.
    async fn claim_next(&self, job_type: JobType, stale_threshold: Duration)
        -> Result<Option<Job>>;

    /// Refresh the heartbeat; fails once the job is cancelled or
    /// terminal.
    async fn heartbeat(&self, job_id: Uuid) -> Result<()>;

    /// Request cooperative cancellation; idempotent.
    async fn request_cancel(&self, job_id: Uuid) -> Result<()>;

    /// Cheap cancellation probe for worker checkpoints.
    async fn is_cancel_requested(&self, job_id: Uuid) -> Result<bool>;

    /// Terminal: completed with a result.
    async fn complete(&self, job_id: Uuid, result: serde_json::Value) -> Result<()>;

    /// Terminal: failed with an error string.
    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()>;

    /// Terminal: cancelled, keeping whatever partial result exists.
    async fn mark_cancelled(&self, job_id: Uuid, partial_result: serde_json::Value)
        -> Result<()>;

    /// Return a claimed job to the queue (backpressure deferral). The
    /// next claim re-runs it; sinks are idempotent so the partial first
    /// attempt is harmless.
    async fn requeue(&self, job_id: Uuid) -> Result<()>;

    /// Hard delete; only legal from terminal states.
    async fn delete(&self, job_id: Uuid) -> Result<()>;
}

/// PostgreSQL implementation of [`JobStore`].
pub struct PostgresJobStore {
    pool: PgPool,
    /// Claimant id recorded on claimed rows.
    worker_id: String,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }

    pub fn with_worker_id(pool: PgPool, worker_id: impl Into<String>) -> Self {
        Self {
            pool,
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    async fn fetch(&self, job_id: Uuid) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        job.with_context(|| format!("job {job_id} not found"))
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        priority: i32,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, status, priority, payload, created_at, updated_at)
            VALUES ($1, $2, 'queued', $3, $4, NOW(), NOW())
            "#,
        )
        .bind(id)
        .bind(job_type)
        .bind(priority)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        info!(job_id = %id, job_type = %job_type, priority, "job enqueued");
        Ok(id)
    }

    async fn claim_next(
        &self,
        job_type: JobType,
        stale_threshold: Duration,
    ) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;
        let stale_before = Utc::now() - chrono::Duration::from_std(stale_threshold)?;

        // Highest priority first, oldest first on ties; stale running
        // jobs compete alongside queued ones.
        let candidate = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE job_type = $1
              AND (
                  status = 'queued'
                  OR (status = 'running' AND last_heartbeat_at < $2)
              )
            ORDER BY priority DESC, created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(job_type)
        .bind(stale_before)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(previous) = candidate else {
            tx.rollback().await?;
            return Ok(None);
        };

        if previous.status == JobStatus::Running {
            warn!(
                job_id = %previous.id,
                previous_claimant = previous.claimed_by.as_deref().unwrap_or("unknown"),
                previous_heartbeat = ?previous.last_heartbeat_at,
                new_claimant = %self.worker_id,
                "reclaiming stale running job"
            );
        }

        let claimed = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'running',
                started_at = COALESCE(started_at, NOW()),
                last_heartbeat_at = NOW(),
                claimed_by = $2,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(previous.id)
        .bind(&self.worker_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(claimed))
    }

    async fn heartbeat(&self, job_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET last_heartbeat_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status IN ('running', 'cancelling')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("heartbeat rejected: job {job_id} is not running");
        }
        Ok(())
    }

    async fn request_cancel(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET cancellation_requested = TRUE,
                status = CASE WHEN status = 'running' THEN 'cancelling'::job_status
                              ELSE status END,
                updated_at = NOW()
            WHERE id = $1
              AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_cancel_requested(&self, job_id: Uuid) -> Result<bool> {
        let requested: Option<(bool,)> =
            sqlx::query_as("SELECT cancellation_requested FROM jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(requested.map(|(r,)| r).unwrap_or(false))
    }

    async fn complete(&self, job_id: Uuid, result: serde_json::Value) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                result = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('running', 'cancelling')
            "#,
        )
        .bind(job_id)
        .bind(result)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            let job = self.fetch(job_id).await?;
            bail!(
                "cannot complete job {job_id} from status {:?}",
                job.status
            );
        }
        info!(job_id = %job_id, "job completed");
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                error = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('running', 'cancelling')
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            let job = self.fetch(job_id).await?;
            bail!("cannot fail job {job_id} from status {:?}", job.status);
        }
        warn!(job_id = %job_id, error, "job failed");
        Ok(())
    }

    async fn mark_cancelled(
        &self,
        job_id: Uuid,
        partial_result: serde_json::Value,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                result = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('running', 'cancelling')
            "#,
        )
        .bind(job_id)
        .bind(partial_result)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            let job = self.fetch(job_id).await?;
            bail!(
                "cannot cancel job {job_id} from status {:?}",
                job.status
            );
        }
        info!(job_id = %job_id, "job cancelled");
        Ok(())
    }

    async fn requeue(&self, job_id: Uuid) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued',
                claimed_by = NULL,
                last_heartbeat_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('running', 'cancelling')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            bail!("cannot requeue job {job_id}: not running");
        }
        Ok(())
    }

    async fn delete(&self, job_id: Uuid) -> Result<()> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE id = $1 AND status IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if deleted.rows_affected() == 0 {
            bail!("job {job_id} is not in a terminal state; refusing to delete");
        }
        Ok(())
    }
}
