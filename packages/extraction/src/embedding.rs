//! Batched embedding, vector upsert, and orphan recovery.
//!
//! Extractions are persisted before they are indexed; a crash between
//! the two leaves rows with `embedding_id = null` (orphans) that the
//! recovery sweep re-indexes later. Vector upsert is idempotent on id
//! and the id update only touches null rows, so the sweep is safe to run
//! repeatedly.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::Result;
use crate::traits::embedder::EmbeddingService;
use crate::traits::repos::{
    EmbeddingItem, ExtractionRepo, SourceRepo, VectorPayload, VectorRepo,
};
use crate::types::extraction::Extraction;

/// Counters from one indexing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexOutcome {
    pub indexed: usize,
    pub skipped: usize,
}

pub struct EmbeddingPipeline {
    embedder: Arc<dyn EmbeddingService>,
    vectors: Arc<dyn VectorRepo>,
    extractions: Arc<dyn ExtractionRepo>,
}

impl EmbeddingPipeline {
    pub fn new(
        embedder: Arc<dyn EmbeddingService>,
        vectors: Arc<dyn VectorRepo>,
        extractions: Arc<dyn ExtractionRepo>,
    ) -> Self {
        Self {
            embedder,
            vectors,
            extractions,
        }
    }

    /// Index a batch of persisted extractions: one embed call, one
    /// vector upsert, one id update. The point id is the extraction id.
    pub async fn index_batch(
        &self,
        extractions: &[Extraction],
        source_group: &str,
    ) -> Result<IndexOutcome> {
        let pending: Vec<&Extraction> = extractions
            .iter()
            .filter(|e| e.embedding_id.is_none())
            .collect();
        if pending.is_empty() {
            return Ok(IndexOutcome {
                indexed: 0,
                skipped: extractions.len(),
            });
        }

        let texts: Vec<String> = pending.iter().map(|e| e.canonical_text()).collect();
        let text_refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let vectors = self.embedder.embed_batch(&text_refs).await?;

        let items: Vec<EmbeddingItem> = pending
            .iter()
            .zip(vectors)
            .map(|(extraction, vector)| EmbeddingItem {
                id: extraction.id,
                vector,
                payload: VectorPayload {
                    project_id: extraction.project_id,
                    source_group: source_group.to_string(),
                    extraction_type: extraction.extraction_type.clone(),
                    confidence: extraction.confidence,
                    extra: Default::default(),
                },
            })
            .collect();

        // The upsert must land before ids are recorded; a failure here
        // leaves orphans for the recovery sweep.
        self.vectors.upsert_batch(&items).await?;

        let pairs: Vec<(Uuid, Uuid)> = items.iter().map(|item| (item.id, item.id)).collect();
        self.extractions.update_embedding_ids_batch(&pairs).await?;

        tracing::debug!(
            indexed = items.len(),
            skipped = extractions.len() - pending.len(),
            "indexed extraction batch"
        );
        Ok(IndexOutcome {
            indexed: items.len(),
            skipped: extractions.len() - pending.len(),
        })
    }

    /// One orphan-recovery sweep for a project.
    ///
    /// Finds up to `batch_size` rows with no embedding id and re-runs
    /// indexing for them. Returns the number recovered; zero means the
    /// project is clean.
    pub async fn recover_orphans(
        &self,
        project_id: Uuid,
        sources: &dyn SourceRepo,
        batch_size: usize,
    ) -> Result<usize> {
        let orphans = self.extractions.list_orphans(project_id, batch_size).await?;
        if orphans.is_empty() {
            return Ok(0);
        }
        tracing::info!(
            project_id = %project_id,
            orphans = orphans.len(),
            "recovering orphan extractions"
        );

        // Orphans may span source groups; index per group so payload
        // filters stay correct.
        let mut by_group: std::collections::HashMap<String, Vec<Extraction>> =
            std::collections::HashMap::new();
        for orphan in orphans {
            let source_group = match sources.get_source(orphan.source_id).await? {
                Some(source) => source.source_group,
                None => {
                    tracing::warn!(
                        extraction = %orphan.id,
                        source = %orphan.source_id,
                        "orphan references a missing source; skipping"
                    );
                    continue;
                }
            };
            by_group.entry(source_group).or_default().push(orphan);
        }

        let mut recovered = 0usize;
        for (source_group, group_orphans) in by_group {
            let outcome = self.index_batch(&group_orphans, &source_group).await?;
            recovered += outcome.indexed;
        }
        Ok(recovered)
    }
}
