//! Per-type poll loops that claim, execute, heartbeat, and finish jobs.
//!
//! Each job type gets an independent loop and a concurrency semaphore;
//! there is no cross-type coordination. A claimed job runs with a
//! background heartbeat at half its stale threshold; if the heartbeat is
//! ever rejected the claim was lost to another worker and the local run
//! is cancelled. Handlers observe cancellation through [`JobContext`] at
//! their checkpoints.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::job::{Job, JobType};
use super::store::JobStore;

/// How a handler run ends, beyond plain success.
#[derive(Debug)]
pub enum JobError {
    /// A cancellation checkpoint fired; `partial` records progress.
    Cancelled { partial: serde_json::Value },
    /// Downstream backpressure; the job goes back to the queue.
    Requeue { reason: String },
    /// The run failed; the job ends `failed` with this error.
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for JobError {
    fn from(e: anyhow::Error) -> Self {
        JobError::Failed(e)
    }
}

/// Handle given to a running job for heartbeats and cancellation probes.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    store: Arc<dyn JobStore>,
    /// Cancelled on shutdown or when the claim is lost.
    local: CancellationToken,
}

impl JobContext {
    /// Whether the job should stop at the next checkpoint.
    pub async fn cancelled(&self) -> bool {
        if self.local.is_cancelled() {
            return true;
        }
        match self.store.is_cancel_requested(self.job_id).await {
            Ok(requested) => requested,
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "cancel probe failed");
                false
            }
        }
    }

    /// Token equivalent of the checkpoint, for code that takes a
    /// `CancellationToken`.
    pub fn token(&self) -> &CancellationToken {
        &self.local
    }
}

/// Build a context outside the scheduler, for driving handlers in tests.
pub fn test_context(job_id: Uuid, store: Arc<dyn JobStore>) -> JobContext {
    JobContext {
        job_id,
        store,
        local: CancellationToken::new(),
    }
}

/// One registered executor for a job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn run(&self, job: Job, ctx: JobContext) -> Result<serde_json::Value, JobError>;
}

/// Scheduler tuning; defaults follow the deployment profile.
#[derive(Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub stale_thresholds: HashMap<JobType, Duration>,
    pub concurrency: HashMap<JobType, usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let stale_thresholds = HashMap::from([
            (JobType::Scrape, Duration::from_secs(300)),
            (JobType::Crawl, Duration::from_secs(1_800)),
            (JobType::Extract, Duration::from_secs(900)),
            (JobType::Report, Duration::from_secs(600)),
            (JobType::Dedup, Duration::from_secs(600)),
        ]);
        let concurrency = HashMap::from([
            (JobType::Scrape, 1),
            (JobType::Crawl, 6),
            (JobType::Extract, 1),
            (JobType::Report, 1),
            (JobType::Dedup, 1),
        ]);
        Self {
            poll_interval: Duration::from_secs(5),
            stale_thresholds,
            concurrency,
        }
    }
}

impl SchedulerConfig {
    pub fn stale_threshold(&self, job_type: JobType) -> Duration {
        self.stale_thresholds
            .get(&job_type)
            .copied()
            .unwrap_or(Duration::from_secs(600))
    }

    fn concurrency_for(&self, job_type: JobType) -> usize {
        self.concurrency.get(&job_type).copied().unwrap_or(1).max(1)
    }
}

pub struct JobScheduler {
    store: Arc<dyn JobStore>,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn JobStore>, config: SchedulerConfig) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn register(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.job_type(), handler);
        self
    }

    /// Token the binaries cancel on SIGINT; every loop and running job
    /// observes it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run every registered poll loop until shutdown.
    pub async fn run(self) {
        let mut loops = Vec::new();
        for (job_type, handler) in &self.handlers {
            loops.push(tokio::spawn(poll_loop(
                *job_type,
                handler.clone(),
                self.store.clone(),
                self.config.clone(),
                self.shutdown.clone(),
            )));
        }
        info!(types = loops.len(), "job scheduler started");
        for join in loops {
            let _ = join.await;
        }
        info!("job scheduler stopped");
    }
}

async fn poll_loop(
    job_type: JobType,
    handler: Arc<dyn JobHandler>,
    store: Arc<dyn JobStore>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
) {
    let limiter = Arc::new(Semaphore::new(config.concurrency_for(job_type)));
    let stale = config.stale_threshold(job_type);

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        // Block on a permit first so claims never outrun execution.
        let permit = tokio::select! {
            permit = limiter.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.cancelled() => break,
        };

        match store.claim_next(job_type, stale).await {
            Ok(Some(job)) => {
                tokio::spawn(execute_job(
                    job,
                    handler.clone(),
                    store.clone(),
                    stale,
                    shutdown.clone(),
                    permit,
                ));
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
            Err(e) => {
                drop(permit);
                error!(job_type = %job_type, error = %e, "claim failed");
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }
    }
}

async fn execute_job(
    job: Job,
    handler: Arc<dyn JobHandler>,
    store: Arc<dyn JobStore>,
    stale: Duration,
    shutdown: CancellationToken,
    _permit: tokio::sync::OwnedSemaphorePermit,
) {
    let job_id = job.id;
    let local = shutdown.child_token();
    let ctx = JobContext {
        job_id,
        store: store.clone(),
        local: local.clone(),
    };

    // Heartbeat at half the stale threshold; a rejected heartbeat means
    // the claim moved to another worker and this run must stop writing.
    let heartbeat_store = store.clone();
    let heartbeat_token = local.clone();
    let heartbeat_every = (stale / 2).max(Duration::from_secs(1));
    let heartbeat = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(heartbeat_every) => {
                    if let Err(e) = heartbeat_store.heartbeat(job_id).await {
                        warn!(job_id = %job_id, error = %e, "heartbeat rejected; claim lost");
                        heartbeat_token.cancel();
                        break;
                    }
                }
                _ = heartbeat_token.cancelled() => break,
            }
        }
    });

    info!(job_id = %job_id, job_type = %job.job_type, "job started");
    let outcome = handler.run(job, ctx).await;
    local.cancel();
    let _ = heartbeat.await;

    // A rejected terminal write means another worker owns the job now;
    // log and stand down.
    let write = match outcome {
        Ok(result) => store.complete(job_id, result).await,
        Err(JobError::Cancelled { partial }) => store.mark_cancelled(job_id, partial).await,
        Err(JobError::Requeue { reason }) => {
            warn!(job_id = %job_id, reason = %reason, "requeueing job");
            store.requeue(job_id).await
        }
        Err(JobError::Failed(e)) => store.fail(job_id, &format!("{e:#}")).await,
    };
    if let Err(e) = write {
        warn!(job_id = %job_id, error = %e, "terminal write rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::MemoryJobStore;
    use crate::jobs::JobStatus;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        fn job_type(&self) -> JobType {
            JobType::Extract
        }

        async fn run(&self, _job: Job, _ctx: JobContext) -> Result<serde_json::Value, JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"ok": true}))
        }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_scheduler_runs_queued_job_to_completion() {
        let store = Arc::new(MemoryJobStore::new());
        let job_id = store
            .create(JobType::Extract, json!({"source_id": 1}), 0)
            .await
            .unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = JobScheduler::new(store.clone(), fast_config())
            .register(Arc::new(CountingHandler { runs: runs.clone() }));
        let shutdown = scheduler.shutdown_token();

        let handle = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        let _ = handle.await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let job = store.get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"ok": true})));
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_priority_order_within_type() {
        let store = Arc::new(MemoryJobStore::new());
        store
            .create(JobType::Extract, json!({"n": "low"}), 0)
            .await
            .unwrap();
        let high = store
            .create(JobType::Extract, json!({"n": "high"}), 10)
            .await
            .unwrap();

        let claimed = store
            .claim_next(JobType::Extract, Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, high);
    }

    #[tokio::test]
    async fn test_stale_job_reclaimed_and_completed_once() {
        // Worker A claimed and died; its heartbeat is old.
        let store = Arc::new(MemoryJobStore::new());
        let job_id = store
            .create(JobType::Extract, json!({}), 0)
            .await
            .unwrap();
        let claimed = store
            .claim_next(JobType::Extract, Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, job_id);
        store.age_heartbeat(job_id, Duration::from_secs(600));

        // A fresh claim (worker B) picks the stale job up again.
        let reclaimed = store
            .claim_next(JobType::Extract, Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.id, job_id);
        assert_eq!(reclaimed.status, JobStatus::Running);

        store.complete(job_id, json!({"done": true})).await.unwrap();
        assert_eq!(store.get(job_id).unwrap().status, JobStatus::Completed);

        // A's ghost write attempts are rejected post-completion.
        assert!(store.heartbeat(job_id).await.is_err());
        assert!(store.complete(job_id, json!({})).await.is_err());
    }

    struct CancellingHandler;

    #[async_trait]
    impl JobHandler for CancellingHandler {
        fn job_type(&self) -> JobType {
            JobType::Extract
        }

        async fn run(&self, _job: Job, ctx: JobContext) -> Result<serde_json::Value, JobError> {
            // Simulate three merged chunks, then observe cancellation.
            for _ in 0..50 {
                if ctx.cancelled().await {
                    return Err(JobError::Cancelled {
                        partial: json!({
                            "chunks_processed": 3,
                            "sources_processed": 0,
                            "extractions_created": 0
                        }),
                    });
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(json!({"never": true}))
        }
    }

    #[tokio::test]
    async fn test_cancellation_records_partial_result() {
        let store = Arc::new(MemoryJobStore::new());
        let job_id = store.create(JobType::Extract, json!({}), 0).await.unwrap();

        let scheduler = JobScheduler::new(store.clone(), fast_config())
            .register(Arc::new(CancellingHandler));
        let shutdown = scheduler.shutdown_token();
        let handle = tokio::spawn(scheduler.run());

        // Let it claim, then request cancellation.
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.request_cancel(job_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        let _ = handle.await;

        let job = store.get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(
            job.result,
            Some(json!({
                "chunks_processed": 3,
                "sources_processed": 0,
                "extractions_created": 0
            }))
        );
    }

    struct RequeueOnceHandler {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for RequeueOnceHandler {
        fn job_type(&self) -> JobType {
            JobType::Extract
        }

        async fn run(&self, _job: Job, _ctx: JobContext) -> Result<serde_json::Value, JobError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(JobError::Requeue {
                    reason: "queue full".into(),
                });
            }
            Ok(json!({"attempt": 2}))
        }
    }

    #[tokio::test]
    async fn test_backpressure_requeues_then_completes() {
        let store = Arc::new(MemoryJobStore::new());
        let job_id = store.create(JobType::Extract, json!({}), 0).await.unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let scheduler = JobScheduler::new(store.clone(), fast_config()).register(Arc::new(
            RequeueOnceHandler {
                attempts: attempts.clone(),
            },
        ));
        let shutdown = scheduler.shutdown_token();
        let handle = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
        let _ = handle.await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(store.get(job_id).unwrap().status, JobStatus::Completed);
    }
}
