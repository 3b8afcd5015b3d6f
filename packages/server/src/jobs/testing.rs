//! In-memory job store for exercising scheduler and worker behavior
//! without Postgres. Mirrors the claim/transition semantics of the
//! Postgres implementation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::job::{Job, JobStatus, JobType};
use super::store::JobStore;

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.lock().expect("job store poisoned")
    }

    /// Read a job snapshot.
    pub fn get(&self, job_id: Uuid) -> Option<Job> {
        self.lock().get(&job_id).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.lock().len()
    }

    /// Push a running job's heartbeat into the past (simulated worker
    /// death).
    pub fn age_heartbeat(&self, job_id: Uuid, by: Duration) {
        if let Some(job) = self.lock().get_mut(&job_id) {
            if let Some(heartbeat) = job.last_heartbeat_at {
                job.last_heartbeat_at =
                    Some(heartbeat - chrono::Duration::from_std(by).expect("duration"));
            }
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        priority: i32,
    ) -> Result<Uuid> {
        let job = Job::builder()
            .job_type(job_type)
            .payload(payload)
            .priority(priority)
            .build();
        let id = job.id;
        self.lock().insert(id, job);
        Ok(id)
    }

    async fn claim_next(
        &self,
        job_type: JobType,
        stale_threshold: Duration,
    ) -> Result<Option<Job>> {
        let stale_before =
            Utc::now() - chrono::Duration::from_std(stale_threshold).expect("duration");
        let mut jobs = self.lock();

        let mut candidates: Vec<&Job> = jobs
            .values()
            .filter(|j| {
                j.job_type == job_type
                    && (j.status == JobStatus::Queued
                        || (j.status == JobStatus::Running
                            && j.last_heartbeat_at
                                .map(|h| h < stale_before)
                                .unwrap_or(false)))
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        let Some(id) = candidates.first().map(|j| j.id) else {
            return Ok(None);
        };

        let job = jobs.get_mut(&id).expect("candidate must exist");
        job.status = JobStatus::Running;
        job.started_at = job.started_at.or_else(|| Some(Utc::now()));
        job.last_heartbeat_at = Some(Utc::now());
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn heartbeat(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.lock();
        match jobs.get_mut(&job_id) {
            Some(job)
                if matches!(job.status, JobStatus::Running | JobStatus::Cancelling) =>
            {
                job.last_heartbeat_at = Some(Utc::now());
                Ok(())
            }
            _ => bail!("heartbeat rejected: job {job_id} is not running"),
        }
    }

    async fn request_cancel(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.lock();
        if let Some(job) = jobs.get_mut(&job_id) {
            if !job.status.is_terminal() {
                job.cancellation_requested = true;
                if job.status == JobStatus::Running {
                    job.status = JobStatus::Cancelling;
                }
            }
        }
        Ok(())
    }

    async fn is_cancel_requested(&self, job_id: Uuid) -> Result<bool> {
        Ok(self
            .lock()
            .get(&job_id)
            .map(|j| j.cancellation_requested)
            .unwrap_or(false))
    }

    async fn complete(&self, job_id: Uuid, result: serde_json::Value) -> Result<()> {
        self.finish(job_id, JobStatus::Completed, Some(result), None)
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()> {
        self.finish(job_id, JobStatus::Failed, None, Some(error.to_string()))
    }

    async fn mark_cancelled(
        &self,
        job_id: Uuid,
        partial_result: serde_json::Value,
    ) -> Result<()> {
        self.finish(job_id, JobStatus::Cancelled, Some(partial_result), None)
    }

    async fn requeue(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.lock();
        match jobs.get_mut(&job_id) {
            Some(job)
                if matches!(job.status, JobStatus::Running | JobStatus::Cancelling) =>
            {
                job.status = JobStatus::Queued;
                job.claimed_by = None;
                job.last_heartbeat_at = None;
                job.updated_at = Utc::now();
                Ok(())
            }
            _ => bail!("cannot requeue job {job_id}: not running"),
        }
    }

    async fn delete(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.lock();
        match jobs.get(&job_id) {
            Some(job) if job.status.is_terminal() => {
                jobs.remove(&job_id);
                Ok(())
            }
            Some(_) => bail!("job {job_id} is not in a terminal state; refusing to delete"),
            None => Ok(()),
        }
    }
}

impl MemoryJobStore {
    fn finish(
        &self,
        job_id: Uuid,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()> {
        let mut jobs = self.lock();
        match jobs.get_mut(&job_id) {
            Some(job)
                if matches!(job.status, JobStatus::Running | JobStatus::Cancelling) =>
            {
                job.status = status;
                if result.is_some() {
                    job.result = result;
                }
                if error.is_some() {
                    job.error = error;
                }
                job.completed_at = Some(Utc::now());
                job.updated_at = Utc::now();
                Ok(())
            }
            Some(job) => bail!(
                "cannot move job {job_id} to {status:?} from {:?}",
                job.status
            ),
            None => bail!("job {job_id} not found"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_delete_only_terminal() {
        let store = MemoryJobStore::new();
        let id = store.create(JobType::Report, json!({}), 0).await.unwrap();
        assert!(store.delete(id).await.is_err());

        store
            .claim_next(JobType::Report, Duration::from_secs(60))
            .await
            .unwrap();
        store.complete(id, json!({})).await.unwrap();
        assert!(store.delete(id).await.is_ok());
        assert_eq!(store.job_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_request_is_idempotent() {
        let store = MemoryJobStore::new();
        let id = store.create(JobType::Scrape, json!({}), 0).await.unwrap();
        store
            .claim_next(JobType::Scrape, Duration::from_secs(60))
            .await
            .unwrap();

        store.request_cancel(id).await.unwrap();
        store.request_cancel(id).await.unwrap();
        let job = store.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelling);
        assert!(job.cancellation_requested);
        assert!(store.is_cancel_requested(id).await.unwrap());
    }
}
