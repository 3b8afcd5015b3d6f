//! # Extraction Core
//!
//! Schema-driven knowledge extraction: turns fetched pages into
//! validated, deduplicated, schema-conforming records and searchable
//! embeddings.
//!
//! ## Architecture
//!
//! ```text
//! FETCH → CLEAN → CLASSIFY → CHUNK → EXTRACT → MERGE → DEDUP → INDEX → LINK
//!
//! 1. Scrape/crawl workers store pages as Sources
//! 2. BoilerplateEngine fingerprints a domain and strips shared blocks
//! 3. Classifier routes a page to its relevant field groups
//! 4. Chunker splits content into budget-bounded, header-aware chunks
//! 5. SchemaOrchestrator fans one LM request per (group, chunk) through
//!    the broker and merges results under typed rules
//! 6. Deduplicator suppresses near-duplicates within a source group
//! 7. EmbeddingPipeline indexes records; orphan recovery retries later
//! 8. EntityExtractor emits normalized entities with idempotent links
//! ```
//!
//! ## Design
//!
//! | Principle | Description |
//! |-----------|-------------|
//! | **Schema-driven** | Operators define field groups; prompts and validation derive from them |
//! | **Broker-decoupled** | Extraction never talks to the LM directly; requests flow through a queue contract |
//! | **Idempotent sinks** | Upserts and keyed links make at-least-once execution safe |
//! | **Trait seams** | Fetcher, LM endpoint, embeddings, and stores are all swappable contracts |
//!
//! ## Modules
//!
//! - [`types`] - Domain records (Project, Source, Extraction, Entity)
//! - [`traits`] - Contracts to external collaborators
//! - [`broker`] - LM request/response types and the broker client contract
//! - [`chunker`], [`cleanup`], [`boilerplate`] - Content preparation
//! - [`classifier`], [`orchestrator`], [`merge`] - The extraction plan
//! - [`dedup`], [`embedding`], [`entities`] - Post-processing
//! - [`pipeline`] - Per-source glue
//! - [`testing`] - Mocks and in-memory stores

pub mod boilerplate;
pub mod broker;
pub mod chunker;
pub mod classifier;
pub mod cleanup;
pub mod config;
pub mod dedup;
pub mod embedding;
pub mod entities;
pub mod error;
pub mod json_repair;
pub mod merge;
pub mod orchestrator;
pub mod pipeline;
pub mod prompts;
pub mod testing;
pub mod traits;
pub mod types;

// Re-export core types at crate root
pub use error::{BrokerError, ExtractionError, FetchError};
pub use traits::{
    embedder::{cosine_similarity, EmbeddingService},
    fetcher::{
        CrawlPage, CrawlRequest, CrawlState, CrawlStatus, Fetcher, ScrapeOptions, ScrapedPage,
    },
    lm::{ChatMessage, Completion, CompletionOptions, LmEndpoint},
    repos::{
        BoilerplateRepo, EmbeddingItem, EntityRepo, ExtractionRepo, SourceRepo, VectorFilter,
        VectorMatch, VectorPayload, VectorRepo,
    },
};
pub use types::{
    boilerplate::{BoilerplateParams, BoilerplateStats, DomainBoilerplate},
    entity::{normalize_value, Entity, ExtractionEntity},
    extraction::Extraction,
    project::{EntityTypeDef, ExtractionContext, NormalizationRule, Project},
    schema::{ExtractionSchema, Field, FieldGroup, FieldType},
    source::{domain_of, Source, SourceStatus},
};

// Re-export pipeline components
pub use boilerplate::{block_hash, BoilerplateEngine, StripResult};
pub use broker::{
    BackpressureStatus, DirectLmBroker, LmBroker, LmRequest, LmRequestType, LmResponse,
    LmResponseStatus, TemperatureSchedule,
};
pub use chunker::{chunk_markdown, DocumentChunk};
pub use classifier::{Classification, Classifier};
pub use cleanup::{layer1_clean, layer2_clean};
pub use config::{
    ChunkerConfig, ClassifierConfig, DedupConfig, OrchestratorConfig, PipelineConfig,
};
pub use dedup::{DedupVerdict, Deduplicator};
pub use embedding::{EmbeddingPipeline, IndexOutcome};
pub use entities::{EntityExtractor, EntityOutcome};
pub use json_repair::parse_or_repair;
pub use merge::{merge_group, recalibrate, ChunkResult, MergedGroup};
pub use orchestrator::{OrchestratorOutcome, SchemaOrchestrator};
pub use pipeline::{ExtractionPipeline, PipelineOutcome};

// Re-export testing utilities
pub use testing::{MemoryStores, MockEmbedder, MockFetcher, MockLm};
