//! Embedding-similarity deduplication within a source group.
//!
//! Duplication is defined per `(project, source_group)`; the same fact
//! appearing under two groups is normal and never suppressed.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::DedupConfig;
use crate::error::Result;
use crate::traits::embedder::EmbeddingService;
use crate::traits::repos::{VectorFilter, VectorRepo};
use crate::types::extraction::Extraction;

/// Outcome of a duplicate check.
#[derive(Debug, Clone)]
pub struct DedupVerdict {
    pub is_duplicate: bool,
    /// Best-match similarity, when any prior point existed.
    pub score: Option<f32>,
    /// Id of the matched prior extraction.
    pub matched_id: Option<Uuid>,
}

pub struct Deduplicator {
    embedder: Arc<dyn EmbeddingService>,
    vectors: Arc<dyn VectorRepo>,
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(
        embedder: Arc<dyn EmbeddingService>,
        vectors: Arc<dyn VectorRepo>,
        config: DedupConfig,
    ) -> Self {
        Self {
            embedder,
            vectors,
            config,
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Check a candidate against prior extractions of the same project
    /// and source group. A score equal to the threshold is a duplicate.
    pub async fn check(&self, candidate: &Extraction, source_group: &str) -> Result<DedupVerdict> {
        if !self.config.enabled {
            return Ok(DedupVerdict {
                is_duplicate: false,
                score: None,
                matched_id: None,
            });
        }

        let embedding = self.embedder.embed(&candidate.canonical_text()).await?;
        let filter = VectorFilter::for_project(candidate.project_id)
            .with_source_group(source_group);
        let matches = self.vectors.search(&embedding, 1, &filter).await?;

        let Some(best) = matches.first() else {
            return Ok(DedupVerdict {
                is_duplicate: false,
                score: None,
                matched_id: None,
            });
        };

        let is_duplicate = best.score >= self.config.threshold;
        if is_duplicate {
            tracing::debug!(
                candidate = %candidate.id,
                matched = %best.id,
                score = best.score,
                "candidate is a near-duplicate of a prior extraction"
            );
        }
        Ok(DedupVerdict {
            is_duplicate,
            score: Some(best.score),
            matched_id: Some(best.id),
        })
    }
}
