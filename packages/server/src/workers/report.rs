//! Report worker: assembles a project's extracted facts into a JSON
//! result. Rendering and export live elsewhere.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use extraction::ExtractionRepo;

use crate::jobs::{Job, JobContext, JobError, JobHandler, JobType};
use crate::repos::PgReportRepo;

/// Payload of a `report` job.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReportCommand {
    pub project_id: Uuid,
    #[serde(default)]
    pub extraction_type: Option<String>,
    /// Only include records at or above this confidence.
    #[serde(default)]
    pub min_confidence: Option<f32>,
}

pub struct ReportHandler {
    extractions: Arc<dyn ExtractionRepo>,
    /// Absent in tests; the job result carries the report either way.
    reports: Option<Arc<PgReportRepo>>,
}

impl ReportHandler {
    pub fn new(extractions: Arc<dyn ExtractionRepo>, reports: Option<Arc<PgReportRepo>>) -> Self {
        Self {
            extractions,
            reports,
        }
    }
}

#[async_trait]
impl JobHandler for ReportHandler {
    fn job_type(&self) -> JobType {
        JobType::Report
    }

    async fn run(&self, job: Job, ctx: JobContext) -> Result<serde_json::Value, JobError> {
        let command: ReportCommand = job.payload_as()?;
        let min_confidence = command.min_confidence.unwrap_or(0.0);

        let rows = self
            .extractions
            .list_for_project(command.project_id, command.extraction_type.as_deref())
            .await
            .map_err(|e| JobError::Failed(e.into()))?;

        if ctx.cancelled().await {
            return Err(JobError::Cancelled {
                partial: json!({"extractions_considered": rows.len()}),
            });
        }

        // Group records per extraction type with simple aggregates.
        let mut groups: BTreeMap<String, Vec<&extraction::Extraction>> = BTreeMap::new();
        for row in &rows {
            if row.confidence < min_confidence {
                continue;
            }
            groups.entry(row.extraction_type.clone()).or_default().push(row);
        }

        let mut sections = serde_json::Map::new();
        for (extraction_type, records) in &groups {
            let avg_confidence =
                records.iter().map(|r| r.confidence).sum::<f32>() / records.len() as f32;
            sections.insert(
                extraction_type.clone(),
                json!({
                    "count": records.len(),
                    "avg_confidence": avg_confidence,
                    "indexed": records.iter().filter(|r| r.embedding_id.is_some()).count(),
                    "records": records
                        .iter()
                        .map(|r| json!({
                            "id": r.id,
                            "source_id": r.source_id,
                            "confidence": r.confidence,
                            "data": r.data,
                        }))
                        .collect::<Vec<_>>(),
                }),
            );
        }

        let result = json!({
            "project_id": command.project_id,
            "extractions_considered": rows.len(),
            "sections": sections,
        });

        if let Some(reports) = &self.reports {
            let report_id = reports
                .insert(
                    command.project_id,
                    "facts",
                    job.payload.clone(),
                    result.clone(),
                )
                .await
                .map_err(JobError::Failed)?;
            tracing::info!(report_id = %report_id, project_id = %command.project_id, "report stored");
        }
        Ok(result)
    }
}
