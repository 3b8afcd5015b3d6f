//! Repository contracts over the relational and vector stores.
//!
//! The storage layer is split into focused traits, one per aggregate:
//! - `SourceRepo`: fetched pages and their lifecycle
//! - `ExtractionRepo`: merged field-group records
//! - `EntityRepo`: normalized entities and extraction links
//! - `BoilerplateRepo`: per-domain fingerprints
//! - `VectorRepo`: the vector collection behind search and dedup

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    boilerplate::DomainBoilerplate,
    entity::{Entity, ExtractionEntity},
    extraction::Extraction,
    source::{Source, SourceStatus},
};

/// Pages keyed by `(project_id, uri)`.
#[async_trait]
pub trait SourceRepo: Send + Sync {
    async fn get_source(&self, id: Uuid) -> Result<Option<Source>>;

    /// Insert, or update content/metadata when the `(project_id, uri)`
    /// key already exists. Returns the stored row either way.
    async fn upsert_source(&self, source: &Source) -> Result<Source>;

    /// All sources of a project sharing a domain (for fingerprinting).
    async fn list_sources_by_domain(&self, project_id: Uuid, domain: &str)
        -> Result<Vec<Source>>;

    /// Write the boilerplate-stripped content.
    async fn set_cleaned_content(&self, id: Uuid, cleaned: &str) -> Result<()>;

    /// Terminal lifecycle write for one source.
    async fn set_source_status(
        &self,
        id: Uuid,
        status: SourceStatus,
        errors: &[String],
    ) -> Result<()>;
}

/// Merged field-group records.
#[async_trait]
pub trait ExtractionRepo: Send + Sync {
    async fn get_extraction(&self, id: Uuid) -> Result<Option<Extraction>>;

    /// Persist a batch in one transaction.
    async fn create_batch(&self, extractions: &[Extraction]) -> Result<()>;

    async fn list_for_source(&self, source_id: Uuid) -> Result<Vec<Extraction>>;

    /// Extractions of a project, optionally narrowed to one group type.
    async fn list_for_project(
        &self,
        project_id: Uuid,
        extraction_type: Option<&str>,
    ) -> Result<Vec<Extraction>>;

    /// Rows with `embedding_id IS NULL`, oldest first: orphans awaiting
    /// indexing.
    async fn list_orphans(&self, project_id: Uuid, limit: usize) -> Result<Vec<Extraction>>;

    /// One statement: set embedding ids for the given pairs, only where
    /// `embedding_id IS NULL` (idempotent under re-runs).
    async fn update_embedding_ids_batch(&self, pairs: &[(Uuid, Uuid)]) -> Result<()>;

    /// Rows not yet run through the entity pass.
    async fn list_pending_entities(&self, project_id: Uuid, limit: usize)
        -> Result<Vec<Extraction>>;

    async fn set_entities_extracted(&self, id: Uuid, done: bool) -> Result<()>;
}

/// Normalized entities with idempotent creation and linking.
#[async_trait]
pub trait EntityRepo: Send + Sync {
    /// Unique-key upsert on (project_id, source_group, entity_type,
    /// normalized_value). An existing row is returned untouched.
    async fn get_or_create(&self, entity: &Entity) -> Result<Entity>;

    /// Idempotent link creation; returns `(link, created)` where
    /// `created` is false when the triple already existed.
    async fn get_or_create_link(
        &self,
        extraction_id: Uuid,
        entity_id: Uuid,
        role: &str,
    ) -> Result<(ExtractionEntity, bool)>;

    async fn list_for_extraction(&self, extraction_id: Uuid) -> Result<Vec<Entity>>;
}

/// Per-domain boilerplate fingerprints, upserted on (project_id, domain).
#[async_trait]
pub trait BoilerplateRepo: Send + Sync {
    async fn get_fingerprint(
        &self,
        project_id: Uuid,
        domain: &str,
    ) -> Result<Option<DomainBoilerplate>>;

    async fn upsert_fingerprint(&self, fingerprint: &DomainBoilerplate) -> Result<()>;
}

/// One point to upsert into the vector collection.
#[derive(Debug, Clone)]
pub struct EmbeddingItem {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: VectorPayload,
}

/// Payload stored alongside a vector point.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VectorPayload {
    pub project_id: Uuid,
    pub source_group: String,
    pub extraction_type: String,
    pub confidence: f32,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

/// Filter for vector searches; empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub project_id: Option<Uuid>,
    pub source_group: Option<String>,
    pub extraction_type: Option<String>,
}

impl VectorFilter {
    /// Scope to one project.
    pub fn for_project(project_id: Uuid) -> Self {
        Self {
            project_id: Some(project_id),
            ..Default::default()
        }
    }

    /// Additionally scope to one source group.
    pub fn with_source_group(mut self, source_group: impl Into<String>) -> Self {
        self.source_group = Some(source_group.into());
        self
    }
}

/// One search hit.
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub id: Uuid,
    pub score: f32,
    pub payload: VectorPayload,
}

/// The vector collection. Upsert is idempotent on id.
#[async_trait]
pub trait VectorRepo: Send + Sync {
    /// Create the collection if missing; verifies dimensionality.
    async fn init_collection(&self, dimension: usize) -> Result<()>;

    async fn upsert(&self, item: &EmbeddingItem) -> Result<()>;

    async fn upsert_batch(&self, items: &[EmbeddingItem]) -> Result<()>;

    /// Nearest points by cosine similarity, best first.
    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorMatch>>;

    async fn delete(&self, ids: &[Uuid]) -> Result<()>;
}
