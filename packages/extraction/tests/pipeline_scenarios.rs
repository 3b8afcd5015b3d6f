//! End-to-end pipeline scenarios over the in-memory stores and mocks.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use extraction::{
    BoilerplateEngine, BoilerplateParams, BoilerplateRepo, ChunkerConfig, Classifier,
    ClassifierConfig, DedupConfig, Deduplicator, EmbeddingItem, EmbeddingPipeline,
    EmbeddingService, EntityExtractor, EntityRepo, EntityTypeDef, ExtractionContext,
    ExtractionError, ExtractionPipeline, ExtractionRepo, ExtractionSchema, Field, FieldGroup,
    FieldType, LmRequestType, MemoryStores, MockEmbedder, MockLm, PipelineConfig, Project,
    SchemaOrchestrator, Source, SourceRepo, SourceStatus, VectorPayload, VectorRepo,
};

fn schema() -> ExtractionSchema {
    ExtractionSchema {
        groups: vec![
            FieldGroup {
                name: "company_overview".into(),
                description: "basic company facts".into(),
                is_entity_list: false,
                prompt_hint: None,
                fields: vec![
                    Field {
                        name: "summary".into(),
                        field_type: FieldType::Text,
                        enum_values: vec![],
                        default: None,
                        required: false,
                        description: "what the company does".into(),
                    },
                    Field {
                        name: "has_sso".into(),
                        field_type: FieldType::Boolean,
                        enum_values: vec![],
                        default: None,
                        required: false,
                        description: "supports single sign-on".into(),
                    },
                ],
            },
        ],
    }
}

fn project() -> Project {
    Project::new("vendors", schema())
        .with_context(ExtractionContext {
            source_type: "vendor website".into(),
            source_label: "Company".into(),
            entity_id_fields: vec!["name".into()],
        })
        .with_entity_types(vec![EntityTypeDef {
            name: "feature".into(),
            description: "a product feature".into(),
            value_hint: None,
            normalization: Default::default(),
        }])
}

struct Harness {
    stores: Arc<MemoryStores>,
    lm: Arc<MockLm>,
    pipeline: ExtractionPipeline,
}

fn harness(lm: MockLm, config: PipelineConfig) -> Harness {
    let stores = Arc::new(MemoryStores::new());
    let lm = Arc::new(lm);
    let embedder = Arc::new(MockEmbedder::new(64));

    let classifier = Arc::new(
        Classifier::new(config.classifier.clone(), embedder.clone()).unwrap(),
    );
    let orchestrator = Arc::new(SchemaOrchestrator::new(
        lm.clone(),
        classifier,
        config.chunker,
        config.orchestrator,
    ));
    let deduplicator = Arc::new(Deduplicator::new(
        embedder.clone(),
        stores.clone(),
        config.dedup,
    ));
    let embedding = Arc::new(EmbeddingPipeline::new(
        embedder,
        stores.clone(),
        stores.clone(),
    ));
    let entity_extractor = Arc::new(EntityExtractor::new(
        lm.clone(),
        stores.clone(),
        stores.clone(),
    ));

    let pipeline = ExtractionPipeline::new(
        stores.clone(),
        stores.clone(),
        stores.clone(),
        orchestrator,
        deduplicator,
        embedding,
        entity_extractor,
        config,
    );
    Harness {
        stores,
        lm,
        pipeline,
    }
}

fn default_config() -> PipelineConfig {
    PipelineConfig {
        classifier: ClassifierConfig::disabled(),
        ..Default::default()
    }
}

fn good_lm() -> MockLm {
    MockLm::new()
        .with_response(
            LmRequestType::ExtractFieldGroup,
            json!({
                "data": {"summary": "Acme sells anvils with enterprise auth", "has_sso": true},
                "confidence": 0.85
            })
            .to_string(),
        )
        .with_response(
            LmRequestType::ExtractEntities,
            json!({"entities": [{"entity_type": "feature", "value": "SSO"}]}).to_string(),
        )
}

async fn seed_source(stores: &MemoryStores, project: &Project, content: &str) -> Source {
    let source = Source::new(project.id, "https://acme.com/about", "acme", content);
    stores.upsert_source(&source).await.unwrap()
}

#[tokio::test]
async fn test_happy_path_extracts_indexes_and_links() {
    let h = harness(good_lm(), default_config());
    let project = project();
    let source = seed_source(&h.stores, &project, "## About\nAcme sells anvils.").await;

    let outcome = h
        .pipeline
        .process_source(&project, source.id, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.sources_processed, 1);
    assert_eq!(outcome.extractions_created, 1);
    assert_eq!(outcome.chunks_processed, 1);
    assert_eq!(outcome.entities_linked, 1);
    assert_eq!(outcome.orphans, 0);

    // Source advanced to extracted with at least one extraction.
    let stored = h.stores.get_source(source.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SourceStatus::Extracted);
    let extractions = h.stores.list_for_source(source.id).await.unwrap();
    assert_eq!(extractions.len(), 1);

    // Indexed: embedding id points at an existing vector.
    let extraction = &extractions[0];
    let embedding_id = extraction.embedding_id.expect("must be indexed");
    assert!(h.stores.vector_exists(embedding_id));

    // Entity linked.
    let entities = h.stores.list_for_extraction(extraction.id).await.unwrap();
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].normalized_value, "sso");
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let h = harness(good_lm(), default_config());
    let project = project();
    let source = seed_source(&h.stores, &project, "## About\nAcme sells anvils.").await;
    let token = CancellationToken::new();

    h.pipeline
        .process_source(&project, source.id, &token)
        .await
        .unwrap();
    let entities_before = h.stores.entity_count();
    let links_before = h.stores.link_count();
    let vectors_before = h.stores.vector_count();

    // Second run dedups against the first extraction's vector.
    let second = h
        .pipeline
        .process_source(&project, source.id, &token)
        .await
        .unwrap();
    assert_eq!(second.extractions_created, 0);
    assert_eq!(second.duplicates_skipped, 1);
    assert_eq!(h.stores.entity_count(), entities_before);
    assert_eq!(h.stores.link_count(), links_before);
    assert_eq!(h.stores.vector_count(), vectors_before);
}

#[tokio::test]
async fn test_empty_source_fails_without_lm_calls() {
    let h = harness(MockLm::new(), default_config());
    let project = project();
    let source = seed_source(&h.stores, &project, "   ").await;

    let outcome = h
        .pipeline
        .process_source(&project, source.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.extractions_created, 0);

    let stored = h.stores.get_source(source.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SourceStatus::Failed);
    assert_eq!(h.lm.request_count(), 0);
}

#[tokio::test]
async fn test_empty_lm_output_fails_source() {
    let lm = MockLm::new().with_response(
        LmRequestType::ExtractFieldGroup,
        json!({"data": {"summary": null, "has_sso": null}, "confidence": 0.9}).to_string(),
    );
    let h = harness(lm, default_config());
    let project = project();
    let source = seed_source(&h.stores, &project, "## About\nNothing useful.").await;

    let outcome = h
        .pipeline
        .process_source(&project, source.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.extractions_created, 0);

    let stored = h.stores.get_source(source.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SourceStatus::Failed);
    assert_eq!(stored.errors, vec!["no extractions produced".to_string()]);
    assert_eq!(h.stores.extraction_count(), 0);
}

#[tokio::test]
async fn test_cancellation_writes_nothing() {
    let h = harness(good_lm(), default_config());
    let project = project();
    let source = seed_source(&h.stores, &project, "## About\nAcme sells anvils.").await;

    let token = CancellationToken::new();
    token.cancel();
    let result = h.pipeline.process_source(&project, source.id, &token).await;
    assert!(matches!(result, Err(ExtractionError::Cancelled)));

    // Commit is post-merge: nothing was persisted.
    assert_eq!(h.stores.extraction_count(), 0);
    assert_eq!(h.stores.vector_count(), 0);
    let stored = h.stores.get_source(source.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SourceStatus::Pending);
}

#[tokio::test]
async fn test_skip_pattern_marks_extracted_with_zero_extractions() {
    let mut config = default_config();
    config.classifier = ClassifierConfig::disabled()
        .with_skip_patterns(vec!["/about".into()], vec![]);
    let h = harness(good_lm(), config);
    let project = project();
    let source = seed_source(&h.stores, &project, "## About\nAcme sells anvils.").await;

    let outcome = h
        .pipeline
        .process_source(&project, source.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.extractions_created, 0);
    assert_eq!(h.lm.request_count(), 0);

    let stored = h.stores.get_source(source.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SourceStatus::Extracted);
    assert!(h
        .stores
        .list_for_source(source.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_boilerplate_stripping_feeds_extraction() {
    let h = harness(good_lm(), default_config());
    let project = project();

    let banner = "We use cookies to improve your experience on this site. ".repeat(5);
    let content = format!("## About\nAcme sells anvils.\n\n{banner}");
    let source = seed_source(&h.stores, &project, &content).await;

    // Fingerprint the domain as if analyze ran over enough pages.
    let engine = BoilerplateEngine::new(BoilerplateParams::default());
    let pages: Vec<String> = (0..6)
        .map(|i| format!("## Page {i}\nUnique body text number {i} for fingerprint purposes.\n\n{banner}"))
        .collect();
    let refs: Vec<&str> = pages.iter().map(String::as_str).collect();
    let fingerprint = engine.analyze(project.id, "acme.com", &refs);
    assert!(!fingerprint.hashes.is_empty());
    h.stores.upsert_fingerprint(&fingerprint).await.unwrap();

    h.pipeline
        .process_source(&project, source.id, &CancellationToken::new())
        .await
        .unwrap();

    // The pipeline wrote cleaned content and it no longer carries the
    // banner but keeps the real body.
    let stored = h.stores.get_source(source.id).await.unwrap().unwrap();
    let cleaned = stored.cleaned_content.expect("cleaned content written");
    assert!(!cleaned.contains("We use cookies"));
    assert!(cleaned.contains("Acme sells anvils."));

    // The chunk the LM saw came from the cleaned text.
    let requests = h.lm.requests_of(LmRequestType::ExtractFieldGroup);
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].messages[1].content.contains("We use cookies"));
}

#[tokio::test]
async fn test_duplicate_across_sources_is_suppressed() {
    let h = harness(good_lm(), default_config());
    let project = project();

    // A prior extraction from another page of the same company already
    // indexed the same canonical text.
    let embedder = MockEmbedder::new(64);
    let vector = embedder
        .embed("Acme sells anvils with enterprise auth")
        .await
        .unwrap();
    h.stores
        .upsert(&EmbeddingItem {
            id: Uuid::new_v4(),
            vector,
            payload: VectorPayload {
                project_id: project.id,
                source_group: "acme".into(),
                extraction_type: "company_overview".into(),
                confidence: 0.8,
                extra: Default::default(),
            },
        })
        .await
        .unwrap();

    let source = seed_source(&h.stores, &project, "## About\nAcme sells anvils.").await;
    let outcome = h
        .pipeline
        .process_source(&project, source.id, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.duplicates_skipped, 1);
    assert_eq!(outcome.extractions_created, 0);
}
