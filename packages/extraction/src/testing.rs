//! Testing utilities including mock implementations.
//!
//! These are useful for testing code that drives the pipeline without
//! real LM, embedding, or storage backends. All mocks track their calls
//! for assertions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::broker::{BackpressureStatus, LmBroker, LmRequest, LmRequestType, LmResponse};
use crate::error::{BrokerResult, FetchError, FetchResult, Result};
use crate::traits::embedder::{cosine_similarity, EmbeddingService};
use crate::traits::fetcher::{
    CrawlRequest, CrawlStatus, Fetcher, ScrapeOptions, ScrapedPage,
};
use crate::traits::repos::{
    BoilerplateRepo, EmbeddingItem, EntityRepo, ExtractionRepo, SourceRepo, VectorFilter,
    VectorMatch, VectorRepo,
};
use crate::types::{
    boilerplate::DomainBoilerplate,
    entity::{Entity, ExtractionEntity},
    extraction::Extraction,
    source::{Source, SourceStatus},
};

// ============================================================================
// MockLm
// ============================================================================

/// A mock LM broker returning configured completions per request type.
#[derive(Default)]
pub struct MockLm {
    /// Response text per request type; returned for every matching call.
    responses: RwLock<HashMap<LmRequestType, String>>,

    /// Request types that should produce an error response.
    failures: RwLock<HashSet<LmRequestType>>,

    /// All requests submitted, for assertions.
    requests: RwLock<Vec<LmRequest>>,

    /// Simulated backpressure.
    backpressure: RwLock<BackpressureStatus>,
}

impl MockLm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the completion text for a request type.
    pub fn with_response(self, request_type: LmRequestType, text: impl Into<String>) -> Self {
        self.responses
            .write()
            .unwrap()
            .insert(request_type, text.into());
        self
    }

    /// Make a request type fail with an error response.
    pub fn with_failure(self, request_type: LmRequestType) -> Self {
        self.failures.write().unwrap().insert(request_type);
        self
    }

    /// Simulate queue backpressure.
    pub fn set_backpressure(&self, status: BackpressureStatus) {
        *self.backpressure.write().unwrap() = status;
    }

    /// Number of requests executed so far.
    pub fn request_count(&self) -> usize {
        self.requests.read().unwrap().len()
    }

    /// Requests of one type, for assertions on prompts.
    pub fn requests_of(&self, request_type: LmRequestType) -> Vec<LmRequest> {
        self.requests
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.request_type == request_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LmBroker for MockLm {
    async fn submit(&self, request: LmRequest) -> BrokerResult<Uuid> {
        let id = request.request_id;
        self.requests.write().unwrap().push(request);
        Ok(id)
    }

    async fn wait(&self, request_id: Uuid, _timeout: Duration) -> BrokerResult<LmResponse> {
        let request = self
            .requests
            .read()
            .unwrap()
            .iter()
            .find(|r| r.request_id == request_id)
            .cloned();
        let Some(request) = request else {
            return Ok(LmResponse::timeout(request_id));
        };

        if self.failures.read().unwrap().contains(&request.request_type) {
            return Ok(LmResponse::error(
                request_id,
                "mock failure",
                Duration::from_millis(1),
            ));
        }

        let text = self
            .responses
            .read()
            .unwrap()
            .get(&request.request_type)
            .cloned()
            .unwrap_or_else(|| "{}".to_string());
        Ok(LmResponse::success(request_id, text, Duration::from_millis(1)))
    }

    async fn backpressure_status(&self) -> BrokerResult<BackpressureStatus> {
        Ok(*self.backpressure.read().unwrap())
    }
}

// ============================================================================
// MockEmbedder
// ============================================================================

/// Deterministic embedder: identical text embeds identically.
pub struct MockEmbedder {
    dimension: usize,
    overrides: RwLock<HashMap<String, Vec<f32>>>,
    calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            overrides: RwLock::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Pin the embedding of a specific text.
    pub fn with_embedding(self, text: impl Into<String>, embedding: Vec<f32>) -> Self {
        self.overrides
            .write()
            .unwrap()
            .insert(text.into(), embedding);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn deterministic(&self, text: &str) -> Vec<f32> {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(text.as_bytes());
        (0..self.dimension)
            .map(|i| {
                let byte = hash[i % 32] as f32;
                (byte / 127.5) - 1.0
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingService for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(pinned) = self.overrides.read().unwrap().get(text) {
            return Ok(pinned.clone());
        }
        Ok(self.deterministic(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ============================================================================
// MockFetcher
// ============================================================================

/// A fetcher serving predefined pages and scripted crawl polls.
#[derive(Default)]
pub struct MockFetcher {
    pages: RwLock<HashMap<String, ScrapedPage>>,
    fail_urls: RwLock<HashSet<String>>,
    /// Scripted status sequence per started crawl; the last repeats.
    crawl_scripts: RwLock<HashMap<String, Vec<CrawlStatus>>>,
    crawl_cursors: RwLock<HashMap<String, usize>>,
    started_crawls: RwLock<Vec<CrawlRequest>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: impl Into<String>, content: impl Into<String>) -> Self {
        let url = url.into();
        self.pages.write().unwrap().insert(
            url.clone(),
            ScrapedPage {
                content: content.into(),
                status_code: 200,
                metadata: HashMap::from([(
                    "url".to_string(),
                    serde_json::Value::String(url),
                )]),
                discovered_urls: vec![],
            },
        );
        self
    }

    pub fn fail_url(self, url: impl Into<String>) -> Self {
        self.fail_urls.write().unwrap().insert(url.into());
        self
    }

    /// Script the poll sequence for crawls of `start_url`.
    pub fn with_crawl(self, start_url: impl Into<String>, statuses: Vec<CrawlStatus>) -> Self {
        self.crawl_scripts
            .write()
            .unwrap()
            .insert(start_url.into(), statuses);
        self
    }

    pub fn started_crawls(&self) -> Vec<CrawlRequest> {
        self.started_crawls.read().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn scrape(&self, url: &str, _opts: &ScrapeOptions) -> FetchResult<ScrapedPage> {
        if self.fail_urls.read().unwrap().contains(url) {
            return Err(FetchError::Http("mock connection refused".into()));
        }
        self.pages
            .read()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::InvalidUrl {
                url: url.to_string(),
            })
    }

    async fn start_crawl(&self, request: &CrawlRequest) -> FetchResult<String> {
        self.started_crawls.write().unwrap().push(request.clone());
        let crawl_id = format!("crawl-{}", Uuid::new_v4());
        let script = self
            .crawl_scripts
            .read()
            .unwrap()
            .get(&request.url)
            .cloned()
            .unwrap_or_default();
        self.crawl_scripts
            .write()
            .unwrap()
            .insert(crawl_id.clone(), script);
        self.crawl_cursors.write().unwrap().insert(crawl_id.clone(), 0);
        Ok(crawl_id)
    }

    async fn get_crawl_status(&self, crawl_id: &str) -> FetchResult<CrawlStatus> {
        let script = self
            .crawl_scripts
            .read()
            .unwrap()
            .get(crawl_id)
            .cloned()
            .unwrap_or_default();
        if script.is_empty() {
            return Err(FetchError::CrawlFailed {
                reason: format!("unknown crawl {crawl_id}"),
            });
        }
        let mut cursors = self.crawl_cursors.write().unwrap();
        let cursor = cursors.entry(crawl_id.to_string()).or_insert(0);
        let status = script[(*cursor).min(script.len() - 1)].clone();
        *cursor += 1;
        Ok(status)
    }
}

// ============================================================================
// MemoryStores
// ============================================================================

/// In-memory implementation of every repository trait plus the vector
/// store, for exercising the pipeline end to end without Postgres.
#[derive(Default)]
pub struct MemoryStores {
    sources: RwLock<HashMap<Uuid, Source>>,
    source_keys: RwLock<HashMap<(Uuid, String), Uuid>>,
    extractions: RwLock<HashMap<Uuid, Extraction>>,
    entities: RwLock<HashMap<Uuid, Entity>>,
    entity_keys: RwLock<HashMap<(Uuid, String, String, String), Uuid>>,
    links: RwLock<HashMap<(Uuid, Uuid, String), ExtractionEntity>>,
    fingerprints: RwLock<HashMap<(Uuid, String), DomainBoilerplate>>,
    vectors: RwLock<HashMap<Uuid, EmbeddingItem>>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a vector point exists for an id.
    pub fn vector_exists(&self, id: Uuid) -> bool {
        self.vectors.read().unwrap().contains_key(&id)
    }

    pub fn vector_count(&self) -> usize {
        self.vectors.read().unwrap().len()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.read().unwrap().len()
    }

    pub fn link_count(&self) -> usize {
        self.links.read().unwrap().len()
    }

    pub fn extraction_count(&self) -> usize {
        self.extractions.read().unwrap().len()
    }
}

#[async_trait]
impl SourceRepo for MemoryStores {
    async fn get_source(&self, id: Uuid) -> Result<Option<Source>> {
        Ok(self.sources.read().unwrap().get(&id).cloned())
    }

    async fn upsert_source(&self, source: &Source) -> Result<Source> {
        let key = (source.project_id, source.uri.clone());
        let existing_id = self.source_keys.read().unwrap().get(&key).copied();
        match existing_id {
            Some(id) => {
                let mut sources = self.sources.write().unwrap();
                let row = sources.get_mut(&id).expect("keyed source must exist");
                row.content = source.content.clone();
                row.metadata = source.metadata.clone();
                row.source_group = source.source_group.clone();
                row.updated_at = chrono::Utc::now();
                Ok(row.clone())
            }
            None => {
                self.source_keys.write().unwrap().insert(key, source.id);
                self.sources
                    .write()
                    .unwrap()
                    .insert(source.id, source.clone());
                Ok(source.clone())
            }
        }
    }

    async fn list_sources_by_domain(
        &self,
        project_id: Uuid,
        domain: &str,
    ) -> Result<Vec<Source>> {
        Ok(self
            .sources
            .read()
            .unwrap()
            .values()
            .filter(|s| s.project_id == project_id && s.domain().as_deref() == Some(domain))
            .cloned()
            .collect())
    }

    async fn set_cleaned_content(&self, id: Uuid, cleaned: &str) -> Result<()> {
        if let Some(source) = self.sources.write().unwrap().get_mut(&id) {
            source.cleaned_content = Some(cleaned.to_string());
            source.updated_at = chrono::Utc::now();
        }
        Ok(())
    }

    async fn set_source_status(
        &self,
        id: Uuid,
        status: SourceStatus,
        errors: &[String],
    ) -> Result<()> {
        if let Some(source) = self.sources.write().unwrap().get_mut(&id) {
            source.status = status;
            source.errors = errors.to_vec();
            source.updated_at = chrono::Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl ExtractionRepo for MemoryStores {
    async fn get_extraction(&self, id: Uuid) -> Result<Option<Extraction>> {
        Ok(self.extractions.read().unwrap().get(&id).cloned())
    }

    async fn create_batch(&self, extractions: &[Extraction]) -> Result<()> {
        let mut store = self.extractions.write().unwrap();
        for extraction in extractions {
            store.insert(extraction.id, extraction.clone());
        }
        Ok(())
    }

    async fn list_for_source(&self, source_id: Uuid) -> Result<Vec<Extraction>> {
        Ok(self
            .extractions
            .read()
            .unwrap()
            .values()
            .filter(|e| e.source_id == source_id)
            .cloned()
            .collect())
    }

    async fn list_for_project(
        &self,
        project_id: Uuid,
        extraction_type: Option<&str>,
    ) -> Result<Vec<Extraction>> {
        Ok(self
            .extractions
            .read()
            .unwrap()
            .values()
            .filter(|e| {
                e.project_id == project_id
                    && extraction_type
                        .map(|t| e.extraction_type == t)
                        .unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn list_orphans(&self, project_id: Uuid, limit: usize) -> Result<Vec<Extraction>> {
        let mut orphans: Vec<Extraction> = self
            .extractions
            .read()
            .unwrap()
            .values()
            .filter(|e| e.project_id == project_id && e.embedding_id.is_none())
            .cloned()
            .collect();
        orphans.sort_by_key(|e| e.created_at);
        orphans.truncate(limit);
        Ok(orphans)
    }

    async fn update_embedding_ids_batch(&self, pairs: &[(Uuid, Uuid)]) -> Result<()> {
        let mut store = self.extractions.write().unwrap();
        for (id, point_id) in pairs {
            if let Some(extraction) = store.get_mut(id) {
                if extraction.embedding_id.is_none() {
                    extraction.embedding_id = Some(*point_id);
                }
            }
        }
        Ok(())
    }

    async fn list_pending_entities(
        &self,
        project_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Extraction>> {
        let mut pending: Vec<Extraction> = self
            .extractions
            .read()
            .unwrap()
            .values()
            .filter(|e| e.project_id == project_id && !e.entities_extracted)
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn set_entities_extracted(&self, id: Uuid, done: bool) -> Result<()> {
        if let Some(extraction) = self.extractions.write().unwrap().get_mut(&id) {
            extraction.entities_extracted = done;
        }
        Ok(())
    }
}

#[async_trait]
impl EntityRepo for MemoryStores {
    async fn get_or_create(&self, entity: &Entity) -> Result<Entity> {
        let key = (
            entity.project_id,
            entity.source_group.clone(),
            entity.entity_type.clone(),
            entity.normalized_value.clone(),
        );
        let existing = self.entity_keys.read().unwrap().get(&key).copied();
        if let Some(id) = existing {
            return Ok(self
                .entities
                .read()
                .unwrap()
                .get(&id)
                .cloned()
                .expect("keyed entity must exist"));
        }
        self.entity_keys.write().unwrap().insert(key, entity.id);
        self.entities
            .write()
            .unwrap()
            .insert(entity.id, entity.clone());
        Ok(entity.clone())
    }

    async fn get_or_create_link(
        &self,
        extraction_id: Uuid,
        entity_id: Uuid,
        role: &str,
    ) -> Result<(ExtractionEntity, bool)> {
        let key = (extraction_id, entity_id, role.to_string());
        let mut links = self.links.write().unwrap();
        if let Some(link) = links.get(&key) {
            return Ok((link.clone(), false));
        }
        let link = ExtractionEntity {
            extraction_id,
            entity_id,
            role: role.to_string(),
            created_at: chrono::Utc::now(),
        };
        links.insert(key, link.clone());
        Ok((link, true))
    }

    async fn list_for_extraction(&self, extraction_id: Uuid) -> Result<Vec<Entity>> {
        let entity_ids: Vec<Uuid> = self
            .links
            .read()
            .unwrap()
            .values()
            .filter(|l| l.extraction_id == extraction_id)
            .map(|l| l.entity_id)
            .collect();
        let entities = self.entities.read().unwrap();
        Ok(entity_ids
            .into_iter()
            .filter_map(|id| entities.get(&id).cloned())
            .collect())
    }
}

#[async_trait]
impl BoilerplateRepo for MemoryStores {
    async fn get_fingerprint(
        &self,
        project_id: Uuid,
        domain: &str,
    ) -> Result<Option<DomainBoilerplate>> {
        Ok(self
            .fingerprints
            .read()
            .unwrap()
            .get(&(project_id, domain.to_string()))
            .cloned())
    }

    async fn upsert_fingerprint(&self, fingerprint: &DomainBoilerplate) -> Result<()> {
        self.fingerprints.write().unwrap().insert(
            (fingerprint.project_id, fingerprint.domain.clone()),
            fingerprint.clone(),
        );
        Ok(())
    }
}

#[async_trait]
impl VectorRepo for MemoryStores {
    async fn init_collection(&self, _dimension: usize) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, item: &EmbeddingItem) -> Result<()> {
        self.vectors.write().unwrap().insert(item.id, item.clone());
        Ok(())
    }

    async fn upsert_batch(&self, items: &[EmbeddingItem]) -> Result<()> {
        let mut vectors = self.vectors.write().unwrap();
        for item in items {
            vectors.insert(item.id, item.clone());
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorMatch>> {
        let mut matches: Vec<VectorMatch> = self
            .vectors
            .read()
            .unwrap()
            .values()
            .filter(|item| {
                filter
                    .project_id
                    .map(|p| item.payload.project_id == p)
                    .unwrap_or(true)
                    && filter
                        .source_group
                        .as_deref()
                        .map(|g| item.payload.source_group == g)
                        .unwrap_or(true)
                    && filter
                        .extraction_type
                        .as_deref()
                        .map(|t| item.payload.extraction_type == t)
                        .unwrap_or(true)
            })
            .map(|item| VectorMatch {
                id: item.id,
                score: cosine_similarity(vector, &item.vector),
                payload: item.payload.clone(),
            })
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(limit);
        Ok(matches)
    }

    async fn delete(&self, ids: &[Uuid]) -> Result<()> {
        let mut vectors = self.vectors.write().unwrap();
        for id in ids {
            vectors.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_embedder_deterministic() {
        let embedder = MockEmbedder::new(128);
        let a = embedder.embed("hello").await.unwrap();
        let b = embedder.embed("hello").await.unwrap();
        let c = embedder.embed("world").await.unwrap();

        assert_eq!(a.len(), 128);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(embedder.call_count(), 3);
    }

    #[tokio::test]
    async fn test_memory_source_upsert_is_keyed() {
        let stores = MemoryStores::new();
        let project_id = Uuid::new_v4();
        let first = Source::new(project_id, "https://a.com/x", "acme", "v1");
        stores.upsert_source(&first).await.unwrap();

        let second = Source::new(project_id, "https://a.com/x", "acme", "v2");
        let stored = stores.upsert_source(&second).await.unwrap();
        // Same key: the original row is updated, not duplicated.
        assert_eq!(stored.id, first.id);
        assert_eq!(stored.content, "v2");
        assert_eq!(stores.sources.read().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_entity_unique_key() {
        let stores = MemoryStores::new();
        let project_id = Uuid::new_v4();
        let a = Entity::new(project_id, "acme", "plan", "Pro", Default::default());
        let b = Entity::new(project_id, "acme", "plan", " pro ", Default::default());

        let stored_a = stores.get_or_create(&a).await.unwrap();
        let stored_b = stores.get_or_create(&b).await.unwrap();
        assert_eq!(stored_a.id, stored_b.id);
        assert_eq!(stores.entity_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_link_idempotent() {
        let stores = MemoryStores::new();
        let (x, e) = (Uuid::new_v4(), Uuid::new_v4());
        let (_, created) = stores.get_or_create_link(x, e, "mention").await.unwrap();
        assert!(created);
        let (_, created) = stores.get_or_create_link(x, e, "mention").await.unwrap();
        assert!(!created);
        assert_eq!(stores.link_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_fetcher_crawl_script() {
        let fetcher = MockFetcher::new().with_crawl(
            "https://a.com",
            vec![
                CrawlStatus {
                    state: crate::traits::fetcher::CrawlState::Scraping,
                    total: 2,
                    completed: 1,
                    pages: vec![],
                    error: None,
                },
                CrawlStatus {
                    state: crate::traits::fetcher::CrawlState::Completed,
                    total: 2,
                    completed: 2,
                    pages: vec![],
                    error: None,
                },
            ],
        );
        let crawl_id = fetcher
            .start_crawl(&CrawlRequest::new("https://a.com"))
            .await
            .unwrap();

        let first = fetcher.get_crawl_status(&crawl_id).await.unwrap();
        assert_eq!(first.state, crate::traits::fetcher::CrawlState::Scraping);
        let second = fetcher.get_crawl_status(&crawl_id).await.unwrap();
        assert_eq!(second.state, crate::traits::fetcher::CrawlState::Completed);
        // The final status repeats on further polls.
        let third = fetcher.get_crawl_status(&crawl_id).await.unwrap();
        assert_eq!(third.state, crate::traits::fetcher::CrawlState::Completed);
    }
}
