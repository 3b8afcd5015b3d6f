//! Crawl worker: passive collector over a fetcher-driven crawl.
//!
//! The fetcher owns link discovery and depth; this worker polls its
//! status endpoint, persists newly seen pages as sources, and (when
//! auto-extract is on) enqueues one extract job per stored source.
//! Cancellation is observed between polls; broker backpressure stretches
//! the poll interval instead of dropping pages.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use extraction::{
    domain_of, BackpressureStatus, BoilerplateEngine, BoilerplateParams, BoilerplateRepo,
    CrawlRequest, CrawlState, Fetcher, LmBroker, Source, SourceRepo,
};

use crate::jobs::{Job, JobContext, JobError, JobHandler, JobStore, JobType};
use crate::workers::extract::ExtractCommand;

/// Payload of a `crawl` job.
#[derive(Debug, Serialize, Deserialize)]
pub struct CrawlCommand {
    pub project_id: Uuid,
    pub url: String,
    pub source_group: String,
    #[serde(default = "default_depth")]
    pub max_depth: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub auto_extract: bool,
}

fn default_depth() -> u32 {
    2
}

fn default_limit() -> u32 {
    100
}

pub struct CrawlHandler {
    fetcher: Arc<dyn Fetcher>,
    sources: Arc<dyn SourceRepo>,
    jobs: Arc<dyn JobStore>,
    broker: Arc<dyn LmBroker>,
    fingerprints: Arc<dyn BoilerplateRepo>,
    boilerplate: Option<BoilerplateEngine>,
    poll_interval: Duration,
}

impl CrawlHandler {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        sources: Arc<dyn SourceRepo>,
        jobs: Arc<dyn JobStore>,
        broker: Arc<dyn LmBroker>,
        fingerprints: Arc<dyn BoilerplateRepo>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            fetcher,
            sources,
            jobs,
            broker,
            fingerprints,
            boilerplate: Some(BoilerplateEngine::default()),
            poll_interval,
        }
    }

    /// Configure domain fingerprinting after a crawl; `None` disables it.
    pub fn with_boilerplate(mut self, params: Option<BoilerplateParams>) -> Self {
        self.boilerplate = params.map(BoilerplateEngine::new);
        self
    }

    /// Refresh the domain fingerprint from every stored page of the
    /// crawled domain. Extraction falls back to raw content for any
    /// source processed before the fingerprint lands.
    async fn refresh_fingerprint(&self, command: &CrawlCommand) -> anyhow::Result<()> {
        let Some(engine) = &self.boilerplate else {
            return Ok(());
        };
        let Some(domain) = domain_of(&command.url) else {
            return Ok(());
        };
        let pages = self
            .sources
            .list_sources_by_domain(command.project_id, &domain)
            .await?;
        let contents: Vec<&str> = pages.iter().map(|s| s.content.as_str()).collect();
        let fingerprint = engine.analyze(command.project_id, &domain, &contents);
        if fingerprint.stats.pages_analyzed < engine.params().min_pages {
            return Ok(());
        }
        self.fingerprints.upsert_fingerprint(&fingerprint).await?;
        Ok(())
    }

    async fn store_new_pages(
        &self,
        command: &CrawlCommand,
        pages: &[extraction::CrawlPage],
        seen: &mut HashSet<String>,
        stored: &mut Vec<Uuid>,
    ) -> anyhow::Result<usize> {
        let mut new_pages = 0usize;
        for page in pages {
            let Some(url) = page.url() else {
                tracing::warn!("crawl page without a url in metadata; skipping");
                continue;
            };
            if !seen.insert(url.to_string()) {
                continue;
            }
            if page.markdown.trim().is_empty() {
                tracing::debug!(url, "crawl page has no content; skipping");
                continue;
            }

            let mut source = Source::new(
                command.project_id,
                url,
                &command.source_group,
                page.markdown.clone(),
            );
            for (key, value) in &page.metadata {
                source
                    .metadata
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
            let row = self.sources.upsert_source(&source).await?;
            stored.push(row.id);
            new_pages += 1;
        }
        Ok(new_pages)
    }

    async fn enqueue_extracts(&self, command: &CrawlCommand, stored: &[Uuid]) -> anyhow::Result<usize> {
        let mut enqueued = 0usize;
        for source_id in stored {
            let payload = serde_json::to_value(ExtractCommand {
                project_id: command.project_id,
                source_id: Some(*source_id),
                source_ids: vec![],
            })?;
            self.jobs.create(JobType::Extract, payload, 0).await?;
            enqueued += 1;
        }
        Ok(enqueued)
    }
}

#[async_trait]
impl JobHandler for CrawlHandler {
    fn job_type(&self) -> JobType {
        JobType::Crawl
    }

    async fn run(&self, job: Job, ctx: JobContext) -> Result<serde_json::Value, JobError> {
        let command: CrawlCommand = job.payload_as()?;

        let request = CrawlRequest::new(&command.url)
            .with_limit(command.limit)
            .with_max_depth(command.max_depth);
        let crawl_id = self
            .fetcher
            .start_crawl(&request)
            .await
            .map_err(|e| JobError::Failed(e.into()))?;
        tracing::info!(crawl_id = %crawl_id, url = %command.url, "crawl started");

        let mut seen: HashSet<String> = HashSet::new();
        let mut stored: Vec<Uuid> = Vec::new();
        let mut extract_jobs = 0usize;

        loop {
            if ctx.cancelled().await {
                return Err(JobError::Cancelled {
                    partial: json!({
                        "crawl_id": crawl_id,
                        "pages_stored": stored.len(),
                        "extract_jobs": extract_jobs,
                    }),
                });
            }

            let status = self
                .fetcher
                .get_crawl_status(&crawl_id)
                .await
                .map_err(|e| JobError::Failed(e.into()))?;

            let first_new = stored.len();
            self.store_new_pages(&command, &status.pages, &mut seen, &mut stored)
                .await
                .map_err(JobError::Failed)?;
            if command.auto_extract {
                extract_jobs += self
                    .enqueue_extracts(&command, &stored[first_new..])
                    .await
                    .map_err(JobError::Failed)?;
            }

            match status.state {
                CrawlState::Completed => {
                    if stored.is_empty() {
                        // Observed in production; a success with a
                        // warning, not a retry.
                        tracing::warn!(
                            crawl_id = %crawl_id,
                            url = %command.url,
                            "crawl completed with zero pages"
                        );
                    }
                    if let Err(e) = self.refresh_fingerprint(&command).await {
                        tracing::warn!(
                            crawl_id = %crawl_id,
                            error = %e,
                            "fingerprint refresh failed"
                        );
                    }
                    tracing::info!(
                        crawl_id = %crawl_id,
                        pages = stored.len(),
                        extract_jobs,
                        "crawl completed"
                    );
                    return Ok(json!({
                        "crawl_id": crawl_id,
                        "pages_stored": stored.len(),
                        "total_reported": status.total,
                        "extract_jobs": extract_jobs,
                    }));
                }
                CrawlState::Failed => {
                    return Err(JobError::Failed(anyhow::anyhow!(
                        "crawl {crawl_id} failed: {}",
                        status.error.unwrap_or_else(|| "unknown".into())
                    )));
                }
                CrawlState::Scraping => {}
            }

            // Backpressure from the LM queue slows the poll cadence so
            // auto-extract does not pile jobs onto a full broker.
            let mut delay = self.poll_interval;
            if command.auto_extract {
                if let Ok(BackpressureStatus::Full | BackpressureStatus::Slow) =
                    self.broker.backpressure_status().await
                {
                    delay *= 2;
                }
            }
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::MemoryJobStore;
    use crate::jobs::JobStatus;
    use extraction::{CrawlPage, CrawlStatus, MemoryStores, MockFetcher, MockLm};
    use std::collections::HashMap;

    fn page(url: &str, body: &str) -> CrawlPage {
        CrawlPage {
            markdown: body.to_string(),
            metadata: HashMap::from([
                ("url".to_string(), serde_json::Value::String(url.into())),
            ]),
        }
    }

    fn command(auto_extract: bool) -> CrawlCommand {
        CrawlCommand {
            project_id: Uuid::new_v4(),
            url: "https://acme.com".into(),
            source_group: "acme".into(),
            max_depth: 2,
            limit: 10,
            auto_extract,
        }
    }

    fn handler(
        fetcher: MockFetcher,
        stores: Arc<MemoryStores>,
        jobs: Arc<MemoryJobStore>,
    ) -> CrawlHandler {
        CrawlHandler::new(
            Arc::new(fetcher),
            stores.clone(),
            jobs,
            Arc::new(MockLm::new()),
            stores,
            Duration::from_millis(5),
        )
    }

    async fn run_job(
        handler: &CrawlHandler,
        jobs: &Arc<MemoryJobStore>,
        command: &CrawlCommand,
    ) -> Result<serde_json::Value, JobError> {
        let job_id = jobs
            .create(JobType::Crawl, serde_json::to_value(command).unwrap(), 0)
            .await
            .unwrap();
        let job = jobs
            .claim_next(JobType::Crawl, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, job_id);
        let ctx = crate::jobs::scheduler::test_context(job_id, jobs.clone());
        handler.run(job, ctx).await
    }

    #[tokio::test]
    async fn test_crawl_accumulates_pages_across_polls() {
        let fetcher = MockFetcher::new().with_crawl(
            "https://acme.com",
            vec![
                CrawlStatus {
                    state: CrawlState::Scraping,
                    total: 2,
                    completed: 1,
                    pages: vec![page("https://acme.com/a", "## A\npage a")],
                    error: None,
                },
                CrawlStatus {
                    state: CrawlState::Completed,
                    total: 2,
                    completed: 2,
                    pages: vec![
                        page("https://acme.com/a", "## A\npage a"),
                        page("https://acme.com/b", "## B\npage b"),
                    ],
                    error: None,
                },
            ],
        );
        let stores = Arc::new(MemoryStores::new());
        let jobs = Arc::new(MemoryJobStore::new());
        let handler = handler(fetcher, stores.clone(), jobs.clone());

        let command = command(true);
        let result = run_job(&handler, &jobs, &command).await.unwrap();

        // Page a appears in both polls but is stored once.
        assert_eq!(result["pages_stored"], json!(2));
        assert_eq!(result["extract_jobs"], json!(2));
        // Crawl job + two extract jobs.
        assert_eq!(jobs.job_count(), 3);
    }

    #[tokio::test]
    async fn test_completed_with_zero_pages_is_success() {
        let fetcher = MockFetcher::new().with_crawl(
            "https://acme.com",
            vec![CrawlStatus {
                state: CrawlState::Completed,
                total: 0,
                completed: 0,
                pages: vec![],
                error: None,
            }],
        );
        let stores = Arc::new(MemoryStores::new());
        let jobs = Arc::new(MemoryJobStore::new());
        let handler = handler(fetcher, stores, jobs.clone());

        let result = run_job(&handler, &jobs, &command(false)).await.unwrap();
        assert_eq!(result["pages_stored"], json!(0));
    }

    #[tokio::test]
    async fn test_failed_crawl_fails_job() {
        let fetcher = MockFetcher::new().with_crawl(
            "https://acme.com",
            vec![CrawlStatus {
                state: CrawlState::Failed,
                total: 0,
                completed: 0,
                pages: vec![],
                error: Some("render farm on fire".into()),
            }],
        );
        let stores = Arc::new(MemoryStores::new());
        let jobs = Arc::new(MemoryJobStore::new());
        let handler = handler(fetcher, stores, jobs.clone());

        let result = run_job(&handler, &jobs, &command(false)).await;
        assert!(matches!(result, Err(JobError::Failed(_))));
    }

    #[tokio::test]
    async fn test_cancellation_between_polls_keeps_partial() {
        let fetcher = MockFetcher::new().with_crawl(
            "https://acme.com",
            vec![CrawlStatus {
                state: CrawlState::Scraping,
                total: 5,
                completed: 1,
                pages: vec![page("https://acme.com/a", "## A\npage a")],
                error: None,
            }],
        );
        let stores = Arc::new(MemoryStores::new());
        let jobs = Arc::new(MemoryJobStore::new());
        let handler = handler(fetcher, stores, jobs.clone());

        let command = command(false);
        let job_id = jobs
            .create(JobType::Crawl, serde_json::to_value(&command).unwrap(), 0)
            .await
            .unwrap();
        let job = jobs
            .claim_next(JobType::Crawl, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        let ctx = crate::jobs::scheduler::test_context(job_id, jobs.clone());

        let run = tokio::spawn({
            let jobs = jobs.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                jobs.request_cancel(job_id).await.unwrap();
            }
        });
        let result = handler.run(job, ctx).await;
        run.await.unwrap();

        match result {
            Err(JobError::Cancelled { partial }) => {
                assert_eq!(partial["pages_stored"], json!(1));
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        // The scheduler would mark it cancelled; the store still shows
        // cancelling from the request here.
        assert_eq!(jobs.get(job_id).unwrap().status, JobStatus::Cancelling);
    }
}
