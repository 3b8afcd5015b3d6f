//! Scrape worker: one URL through the fetcher into a source row.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use extraction::{domain_of, Fetcher, ScrapeOptions, Source, SourceRepo};

use crate::jobs::{Job, JobContext, JobError, JobHandler, JobType};
use crate::rate_limit::DomainRateLimiter;

/// Payload of a `scrape` job.
#[derive(Debug, Serialize, Deserialize)]
pub struct ScrapeCommand {
    pub project_id: Uuid,
    pub url: String,
    pub source_group: String,
}

pub struct ScrapeHandler {
    fetcher: Arc<dyn Fetcher>,
    sources: Arc<dyn SourceRepo>,
    rate_limiter: Arc<DomainRateLimiter>,
    fetch_timeout_secs: u64,
}

impl ScrapeHandler {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        sources: Arc<dyn SourceRepo>,
        rate_limiter: Arc<DomainRateLimiter>,
        fetch_timeout_secs: u64,
    ) -> Self {
        Self {
            fetcher,
            sources,
            rate_limiter,
            fetch_timeout_secs,
        }
    }
}

#[async_trait]
impl JobHandler for ScrapeHandler {
    fn job_type(&self) -> JobType {
        JobType::Scrape
    }

    async fn run(&self, job: Job, ctx: JobContext) -> Result<serde_json::Value, JobError> {
        let command: ScrapeCommand = job.payload_as()?;
        let domain = domain_of(&command.url).ok_or_else(|| {
            JobError::Failed(anyhow::anyhow!("invalid scrape url: {}", command.url))
        })?;

        // The permit spans the fetch so the per-domain concurrency cap
        // counts in-flight requests.
        let _permit = self
            .rate_limiter
            .acquire(&domain)
            .await
            .map_err(|e| JobError::Failed(e.into()))?;

        if ctx.cancelled().await {
            return Err(JobError::Cancelled {
                partial: json!({"sources_stored": 0}),
            });
        }

        let opts = ScrapeOptions {
            timeout_secs: Some(self.fetch_timeout_secs),
            only_main_content: true,
        };
        let page = self
            .fetcher
            .scrape(&command.url, &opts)
            .await
            .map_err(|e| JobError::Failed(e.into()))?;

        let mut source = Source::new(
            command.project_id,
            &command.url,
            &command.source_group,
            page.content,
        );
        for (key, value) in page.metadata {
            source.metadata.entry(key).or_insert(value);
        }
        let stored = self
            .sources
            .upsert_source(&source)
            .await
            .map_err(|e| JobError::Failed(e.into()))?;

        tracing::info!(
            source = %stored.id,
            url = %command.url,
            bytes = stored.content.len(),
            "scraped source stored"
        );
        Ok(json!({
            "sources_stored": 1,
            "source_id": stored.id,
            "url": command.url,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_deserializes_from_job_payload() {
        let job = Job::builder()
            .job_type(JobType::Scrape)
            .payload(json!({
                "project_id": Uuid::new_v4(),
                "url": "https://acme.com/pricing",
                "source_group": "acme"
            }))
            .build();
        let command: ScrapeCommand = job.payload_as().unwrap();
        assert_eq!(command.source_group, "acme");
    }
}
