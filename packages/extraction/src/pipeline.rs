//! Top-level extraction pipeline for one source.
//!
//! Wires boilerplate stripping, the schema orchestrator, pre-write
//! dedup, batch persistence, embedding, and the entity pass, then
//! advances the source's lifecycle. One commit per source: nothing is
//! persisted until every selected group has merged, so cancellation
//! before the commit leaves no partial extractions.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::boilerplate::BoilerplateEngine;
use crate::config::PipelineConfig;
use crate::dedup::Deduplicator;
use crate::embedding::EmbeddingPipeline;
use crate::entities::EntityExtractor;
use crate::error::{ExtractionError, Result};
use crate::orchestrator::SchemaOrchestrator;
use crate::traits::repos::{BoilerplateRepo, ExtractionRepo, SourceRepo};
use crate::types::project::Project;
use crate::types::source::{Source, SourceStatus};

/// Per-stage counters for one pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PipelineOutcome {
    pub sources_processed: usize,
    pub extractions_created: usize,
    pub chunks_processed: usize,
    pub duplicates_skipped: usize,
    pub entities_linked: usize,
    pub orphans: usize,
}

pub struct ExtractionPipeline {
    sources: Arc<dyn SourceRepo>,
    extractions: Arc<dyn ExtractionRepo>,
    fingerprints: Arc<dyn BoilerplateRepo>,
    orchestrator: Arc<SchemaOrchestrator>,
    deduplicator: Arc<Deduplicator>,
    embedding: Arc<EmbeddingPipeline>,
    entity_extractor: Arc<EntityExtractor>,
    config: PipelineConfig,
}

impl ExtractionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sources: Arc<dyn SourceRepo>,
        extractions: Arc<dyn ExtractionRepo>,
        fingerprints: Arc<dyn BoilerplateRepo>,
        orchestrator: Arc<SchemaOrchestrator>,
        deduplicator: Arc<Deduplicator>,
        embedding: Arc<EmbeddingPipeline>,
        entity_extractor: Arc<EntityExtractor>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            sources,
            extractions,
            fingerprints,
            orchestrator,
            deduplicator,
            embedding,
            entity_extractor,
            config,
        }
    }

    /// Process one source end to end.
    pub async fn process_source(
        &self,
        project: &Project,
        source_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        let mut outcome = PipelineOutcome {
            sources_processed: 1,
            ..Default::default()
        };

        let Some(mut source) = self.sources.get_source(source_id).await? else {
            return Err(ExtractionError::SourceNotFound { id: source_id });
        };

        if source.content.trim().is_empty() {
            self.sources
                .set_source_status(
                    source.id,
                    SourceStatus::Failed,
                    &["source has no content".to_string()],
                )
                .await?;
            return Ok(outcome);
        }

        if self.config.domain_dedup_enabled {
            self.ensure_cleaned_content(project, &mut source).await?;
        }
        let content = source
            .extractable_content(self.config.domain_dedup_enabled)
            .to_string();

        let orchestrated = self
            .orchestrator
            .extract_source(project, &source, &content, cancel)
            .await?;
        outcome.chunks_processed = orchestrated.chunks_processed;

        if orchestrated.skipped {
            // Rule-based skip: extracted with zero extractions.
            self.sources
                .set_source_status(source.id, SourceStatus::Extracted, &[])
                .await?;
            return Ok(outcome);
        }

        // Empty group results are never persisted.
        let mut candidates: Vec<_> = orchestrated
            .extractions
            .into_iter()
            .filter(|e| !e.is_empty())
            .collect();

        if self.config.dedup.enabled {
            let mut kept = Vec::with_capacity(candidates.len());
            for extraction in candidates {
                let verdict = self
                    .deduplicator
                    .check(&extraction, &source.source_group)
                    .await?;
                if verdict.is_duplicate {
                    outcome.duplicates_skipped += 1;
                } else {
                    kept.push(extraction);
                }
            }
            candidates = kept;
        }

        // Checkpoint before the commit; a cancel here writes nothing.
        if cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled);
        }

        if candidates.is_empty() {
            if outcome.duplicates_skipped > 0 {
                // Every fact was already known; that is success, not
                // failure, and re-runs must not demote the source.
                self.sources
                    .set_source_status(source.id, SourceStatus::Extracted, &[])
                    .await?;
            } else {
                self.sources
                    .set_source_status(
                        source.id,
                        SourceStatus::Failed,
                        &["no extractions produced".to_string()],
                    )
                    .await?;
            }
            return Ok(outcome);
        }

        self.extractions.create_batch(&candidates).await?;
        outcome.extractions_created = candidates.len();

        // Indexing failures leave orphans; the recovery sweep picks
        // those up, so the source still advances.
        match self
            .embedding
            .index_batch(&candidates, &source.source_group)
            .await
        {
            Ok(indexed) => outcome.orphans = candidates.len() - indexed.indexed,
            Err(e) => {
                tracing::warn!(
                    source = %source.id,
                    error = %e,
                    "embedding failed; extractions left as orphans"
                );
                outcome.orphans = candidates.len();
            }
        }

        // Entity pass is best-effort per extraction; a failure leaves
        // that row flagged for the retry sweep.
        for extraction in &candidates {
            match self
                .entity_extractor
                .process(project, &source.source_group, extraction)
                .await
            {
                Ok(entity_outcome) => outcome.entities_linked += entity_outcome.links_created,
                Err(e) => {
                    tracing::warn!(
                        extraction = %extraction.id,
                        error = %e,
                        "entity pass failed; will be retried by sweep"
                    );
                }
            }
        }

        self.sources
            .set_source_status(source.id, SourceStatus::Extracted, &[])
            .await?;

        tracing::info!(
            source = %source.id,
            extractions = outcome.extractions_created,
            chunks = outcome.chunks_processed,
            duplicates_skipped = outcome.duplicates_skipped,
            "source extracted"
        );
        Ok(outcome)
    }

    /// Strip boilerplate into `cleaned_content` when the domain has a
    /// fingerprint and the source has not been stripped yet.
    async fn ensure_cleaned_content(
        &self,
        project: &Project,
        source: &mut Source,
    ) -> Result<()> {
        if source.cleaned_content.is_some() {
            return Ok(());
        }
        let Some(domain) = source.domain() else {
            return Ok(());
        };
        let Some(fingerprint) = self
            .fingerprints
            .get_fingerprint(project.id, &domain)
            .await?
        else {
            return Ok(());
        };
        if fingerprint.hashes.is_empty() {
            return Ok(());
        }

        let engine = BoilerplateEngine::new(fingerprint.params);
        let stripped = engine.strip(&source.content, &fingerprint);
        tracing::debug!(
            source = %source.id,
            domain,
            bytes_removed = stripped.bytes_removed,
            "stripped boilerplate"
        );
        self.sources
            .set_cleaned_content(source.id, &stripped.cleaned_content)
            .await?;
        source.cleaned_content = Some(stripped.cleaned_content);
        Ok(())
    }
}
