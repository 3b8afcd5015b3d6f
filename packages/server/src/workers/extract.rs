//! Extract worker: runs the extraction pipeline over one source or a
//! batch of sources.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use extraction::{BrokerError, ExtractionError, ExtractionPipeline, PipelineOutcome, Project};

use crate::jobs::{Job, JobContext, JobError, JobHandler, JobType};

/// Payload of an `extract` job: a single source or a project batch.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExtractCommand {
    pub project_id: Uuid,
    #[serde(default)]
    pub source_id: Option<Uuid>,
    #[serde(default)]
    pub source_ids: Vec<Uuid>,
}

impl ExtractCommand {
    fn sources(&self) -> Vec<Uuid> {
        match self.source_id {
            Some(id) => std::iter::once(id)
                .chain(self.source_ids.iter().copied())
                .collect(),
            None => self.source_ids.clone(),
        }
    }
}

/// Loads project configuration for workers; Postgres in production,
/// a static map in tests.
#[async_trait]
pub trait ProjectProvider: Send + Sync {
    async fn project(&self, id: Uuid) -> anyhow::Result<Option<Project>>;
}

#[async_trait]
impl ProjectProvider for crate::repos::PgProjectRepo {
    async fn project(&self, id: Uuid) -> anyhow::Result<Option<Project>> {
        self.get(id).await
    }
}

/// Fixed set of projects for handler tests.
#[derive(Default)]
pub struct StaticProjects {
    projects: std::collections::HashMap<Uuid, Project>,
}

impl StaticProjects {
    pub fn with(mut self, project: Project) -> Self {
        self.projects.insert(project.id, project);
        self
    }
}

#[async_trait]
impl ProjectProvider for StaticProjects {
    async fn project(&self, id: Uuid) -> anyhow::Result<Option<Project>> {
        Ok(self.projects.get(&id).cloned())
    }
}

pub struct ExtractHandler {
    projects: Arc<dyn ProjectProvider>,
    pipeline: Arc<ExtractionPipeline>,
}

impl ExtractHandler {
    pub fn new(projects: Arc<dyn ProjectProvider>, pipeline: Arc<ExtractionPipeline>) -> Self {
        Self { projects, pipeline }
    }
}

#[async_trait]
impl JobHandler for ExtractHandler {
    fn job_type(&self) -> JobType {
        JobType::Extract
    }

    async fn run(&self, job: Job, ctx: JobContext) -> Result<serde_json::Value, JobError> {
        let command: ExtractCommand = job.payload_as()?;
        let source_ids = command.sources();
        if source_ids.is_empty() {
            return Err(JobError::Failed(anyhow::anyhow!(
                "extract job has no sources"
            )));
        }

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

        // Bridge the store-level cancel flag into the token the pipeline
        // checkpoints on.
        let cancel = ctx.token().child_token();
        let probe = {
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(2)) => {
                            if ctx.cancelled().await {
                                cancel.cancel();
                                break;
                            }
                        }
                    }
                }
            })
        };

        let mut totals = PipelineOutcome::default();
        let mut outcome = Ok(());
        for source_id in &source_ids {
            match self
                .pipeline
                .process_source(&project, *source_id, &cancel)
                .await
            {
                Ok(result) => {
                    totals.sources_processed += result.sources_processed;
                    totals.extractions_created += result.extractions_created;
                    totals.chunks_processed += result.chunks_processed;
                    totals.duplicates_skipped += result.duplicates_skipped;
                    totals.entities_linked += result.entities_linked;
                    totals.orphans += result.orphans;
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        cancel.cancel();
        let _ = probe.await;

        match outcome {
            Ok(()) => Ok(serde_json::to_value(&totals).unwrap_or_else(|_| json!({}))),
            Err(ExtractionError::Cancelled) => Err(JobError::Cancelled {
                partial: serde_json::to_value(&totals).unwrap_or_else(|_| json!({})),
            }),
            Err(ExtractionError::Broker(BrokerError::QueueFull { depth })) => {
                Err(JobError::Requeue {
                    reason: format!("LM queue full at depth {depth}"),
                })
            }
            Err(e) => Err(JobError::Failed(e.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_source_union() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let command = ExtractCommand {
            project_id: Uuid::new_v4(),
            source_id: Some(a),
            source_ids: vec![b],
        };
        assert_eq!(command.sources(), vec![a, b]);

        let batch_only = ExtractCommand {
            project_id: Uuid::new_v4(),
            source_id: None,
            source_ids: vec![b],
        };
        assert_eq!(batch_only.sources(), vec![b]);
    }
}
