//! Maintenance worker (`dedup` jobs): orphan recovery and the entity
//! retry sweep for a project.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use extraction::{EmbeddingPipeline, EntityExtractor, ExtractionRepo, SourceRepo};

use crate::jobs::{Job, JobContext, JobError, JobHandler, JobType};
use crate::workers::extract::ProjectProvider;

/// Payload of a `dedup` (maintenance) job.
#[derive(Debug, Serialize, Deserialize)]
pub struct MaintenanceCommand {
    pub project_id: Uuid,
    #[serde(default = "default_batch")]
    pub batch_size: usize,
}

fn default_batch() -> usize {
    50
}

pub struct MaintenanceHandler {
    projects: Arc<dyn ProjectProvider>,
    sources: Arc<dyn SourceRepo>,
    extractions: Arc<dyn ExtractionRepo>,
    embedding: Arc<EmbeddingPipeline>,
    entity_extractor: Arc<EntityExtractor>,
}

impl MaintenanceHandler {
    pub fn new(
        projects: Arc<dyn ProjectProvider>,
        sources: Arc<dyn SourceRepo>,
        extractions: Arc<dyn ExtractionRepo>,
        embedding: Arc<EmbeddingPipeline>,
        entity_extractor: Arc<EntityExtractor>,
    ) -> Self {
        Self {
            projects,
            sources,
            extractions,
            embedding,
            entity_extractor,
        }
    }
}

#[async_trait]
impl JobHandler for MaintenanceHandler {
    fn job_type(&self) -> JobType {
        JobType::Dedup
    }

    async fn run(&self, job: Job, ctx: JobContext) -> Result<serde_json::Value, JobError> {
        let command: MaintenanceCommand = job.payload_as()?;
        let mut orphans_recovered = 0usize;
        let mut entities_retried = 0usize;
        let mut entity_failures = 0usize;

        // Orphan recovery in batches until the project is clean.
        loop {
            if ctx.cancelled().await {
                return Err(JobError::Cancelled {
                    partial: json!({
                        "orphans_recovered": orphans_recovered,
                        "entities_retried": entities_retried,
                    }),
                });
            }
            let recovered = self
                .embedding
                .recover_orphans(
                    command.project_id,
                    self.sources.as_ref(),
                    command.batch_size,
                )
                .await
                .map_err(|e| JobError::Failed(e.into()))?;
            orphans_recovered += recovered;
            if recovered == 0 {
                break;
            }
        }

        // Retry extractions whose entity pass never finished.
        let project = self
            .projects
            .project(command.project_id)
            .await
            .map_err(JobError::Failed)?
            .ok_or_else(|| {
                JobError::Failed(anyhow::anyhow!(
                    "project {} not found",
                    command.project_id
                ))
            })?;

        let pending = self
            .extractions
            .list_pending_entities(command.project_id, command.batch_size)
            .await
            .map_err(|e| JobError::Failed(e.into()))?;
        for extraction in pending {
            if ctx.cancelled().await {
                return Err(JobError::Cancelled {
                    partial: json!({
                        "orphans_recovered": orphans_recovered,
                        "entities_retried": entities_retried,
                    }),
                });
            }
            let Some(source) = self
                .sources
                .get_source(extraction.source_id)
                .await
                .map_err(|e| JobError::Failed(e.into()))?
            else {
                tracing::warn!(
                    extraction = %extraction.id,
                    "pending entity pass references a missing source"
                );
                continue;
            };
            match self
                .entity_extractor
                .process(&project, &source.source_group, &extraction)
                .await
            {
                Ok(_) => entities_retried += 1,
                Err(e) => {
                    entity_failures += 1;
                    tracing::warn!(
                        extraction = %extraction.id,
                        error = %e,
                        "entity retry failed; left for the next sweep"
                    );
                }
            }
        }

        Ok(json!({
            "orphans_recovered": orphans_recovered,
            "entities_retried": entities_retried,
            "entity_failures": entity_failures,
        }))
    }
}
