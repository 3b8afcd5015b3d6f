//! Schema-driven extraction over one source.
//!
//! Plans one LM request per (field group, chunk), fans them out through
//! the broker under a concurrency bound, merges chunk results under the
//! typed rules, and recalibrates confidence. Cancellation is checked
//! before every LM submit and after every group merge.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::broker::{LmBroker, LmRequest, LmRequestType, LmResponseStatus};
use crate::chunker::{chunk_markdown, DocumentChunk};
use crate::classifier::{Classification, Classifier};
use crate::cleanup::{layer1_clean, layer2_clean};
use crate::config::{ChunkerConfig, OrchestratorConfig};
use crate::error::{BrokerError, ExtractionError, Result};
use crate::json_repair::parse_or_repair;
use crate::merge::{merge_group, ChunkResult};
use crate::prompts::field_group_messages;
use crate::types::extraction::Extraction;
use crate::types::project::Project;
use crate::types::schema::FieldGroup;
use crate::types::source::Source;

/// Result of orchestrating one source.
#[derive(Debug, Default)]
pub struct OrchestratorOutcome {
    /// One extraction per selected group, empty ones included; the
    /// pipeline decides what to persist.
    pub extractions: Vec<Extraction>,
    pub chunks_processed: usize,
    /// A rule-based skip pattern matched; nothing was extracted.
    pub skipped: bool,
}

pub struct SchemaOrchestrator {
    broker: Arc<dyn LmBroker>,
    classifier: Arc<Classifier>,
    chunker: ChunkerConfig,
    config: OrchestratorConfig,
}

impl SchemaOrchestrator {
    pub fn new(
        broker: Arc<dyn LmBroker>,
        classifier: Arc<Classifier>,
        chunker: ChunkerConfig,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            broker,
            classifier,
            chunker,
            config,
        }
    }

    /// Run the full plan for one source over `content` (the pipeline
    /// passes boilerplate-stripped content when available).
    pub async fn extract_source(
        &self,
        project: &Project,
        source: &Source,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<OrchestratorOutcome> {
        // Extraction reads structural-cleaned text; classification reads
        // the tighter semantic cleanup. The asymmetry is deliberate:
        // noise hurts the similarity signal, recall needs every token.
        let working_content = layer1_clean(content);
        let classify_content = layer2_clean(content);

        let selected = match self
            .classifier
            .classify(&source.uri, &classify_content, &project.schema.groups)
            .await?
        {
            Classification::Skip => {
                return Ok(OrchestratorOutcome {
                    skipped: true,
                    ..Default::default()
                })
            }
            Classification::Groups(names) => names,
        };

        let groups: Vec<&FieldGroup> = selected
            .iter()
            .filter_map(|name| project.schema.group(name))
            .collect();
        if groups.is_empty() {
            tracing::warn!(uri = %source.uri, "no field groups selected for source");
            return Ok(OrchestratorOutcome::default());
        }

        let chunks = chunk_markdown(&working_content, &self.chunker);
        tracing::debug!(
            uri = %source.uri,
            groups = groups.len(),
            chunks = chunks.len(),
            "planned extraction requests"
        );

        let limiter = Arc::new(Semaphore::new(self.config.max_concurrent_chunks.max(1)));
        let mut extractions = Vec::with_capacity(groups.len());
        let mut chunks_processed = 0usize;

        for group in groups {
            let results = self
                .run_group(project, source, group, &chunks, &limiter, cancel)
                .await?;
            chunks_processed += results.len();

            let merged = merge_group(group, &project.context, &results);
            if cancel.is_cancelled() {
                return Err(ExtractionError::Cancelled);
            }

            if merged.is_empty {
                tracing::debug!(
                    uri = %source.uri,
                    group = %group.name,
                    "group merge produced an empty record"
                );
            }
            extractions.push(Extraction::new(
                project.id,
                source.id,
                group.name.clone(),
                merged.data,
                merged.confidence,
            ));
        }

        Ok(OrchestratorOutcome {
            extractions,
            chunks_processed,
            skipped: false,
        })
    }

    /// All chunks of one group, concurrently under the shared limiter.
    async fn run_group(
        &self,
        project: &Project,
        source: &Source,
        group: &FieldGroup,
        chunks: &[DocumentChunk],
        limiter: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChunkResult>> {
        let futures = chunks.iter().map(|chunk| {
            let limiter = limiter.clone();
            async move {
                let _permit = limiter
                    .acquire()
                    .await
                    .map_err(|_| ExtractionError::Cancelled)?;
                if cancel.is_cancelled() {
                    return Err(ExtractionError::Cancelled);
                }
                self.run_chunk(project, source, group, chunk).await
            }
        });

        let mut results = Vec::with_capacity(chunks.len());
        for outcome in join_all(futures).await {
            results.push(outcome?);
        }
        Ok(results)
    }

    /// One `(group, chunk)` request through the broker.
    ///
    /// Endpoint errors and unparseable output degrade to an empty chunk
    /// result so the remaining chunks still merge; only backpressure and
    /// cancellation propagate.
    async fn run_chunk(
        &self,
        project: &Project,
        source: &Source,
        group: &FieldGroup,
        chunk: &DocumentChunk,
    ) -> Result<ChunkResult> {
        let messages = field_group_messages(
            group,
            &project.context,
            &source.source_group,
            chunk,
            self.config.content_limit,
        );
        let timeout = std::time::Duration::from_secs(self.config.request_timeout_secs);
        let request = LmRequest::new(LmRequestType::ExtractFieldGroup, messages, timeout)
            .with_payload(serde_json::json!({
                "group": group.name,
                "chunk_index": chunk.chunk_index,
                "source_id": source.id,
            }));

        let response = match self.broker.execute(request, timeout).await {
            Ok(response) => response,
            Err(BrokerError::QueueFull { depth }) => {
                return Err(BrokerError::QueueFull { depth }.into());
            }
            Err(e) => {
                tracing::warn!(
                    group = %group.name,
                    chunk = chunk.chunk_index,
                    error = %e,
                    "broker request failed; treating chunk as empty"
                );
                return Ok(ChunkResult::empty(group));
            }
        };

        match response.status {
            LmResponseStatus::Success => {
                let text = response.result.unwrap_or_default();
                match parse_or_repair(&text) {
                    Some(value) => Ok(ChunkResult::from_raw(group, &value)),
                    None => {
                        tracing::warn!(
                            group = %group.name,
                            chunk = chunk.chunk_index,
                            preview = %text.chars().take(120).collect::<String>(),
                            "unrecoverable JSON from LM; empty result"
                        );
                        Ok(ChunkResult::empty(group))
                    }
                }
            }
            LmResponseStatus::Error | LmResponseStatus::Timeout => {
                tracing::warn!(
                    group = %group.name,
                    chunk = chunk.chunk_index,
                    status = ?response.status,
                    error = response.error.as_deref().unwrap_or(""),
                    "LM request did not succeed; empty result"
                );
                Ok(ChunkResult::empty(group))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassifierConfig;
    use crate::testing::{MockEmbedder, MockLm};
    use crate::types::project::ExtractionContext;
    use crate::types::schema::{ExtractionSchema, Field, FieldType};
    use serde_json::json;
    use uuid::Uuid;

    fn project() -> Project {
        let schema = ExtractionSchema {
            groups: vec![FieldGroup {
                name: "overview".into(),
                description: "company overview".into(),
                is_entity_list: false,
                prompt_hint: None,
                fields: vec![
                    Field {
                        name: "has_sso".into(),
                        field_type: FieldType::Boolean,
                        enum_values: vec![],
                        default: None,
                        required: false,
                        description: String::new(),
                    },
                    Field {
                        name: "employee_count".into(),
                        field_type: FieldType::Integer,
                        enum_values: vec![],
                        default: None,
                        required: false,
                        description: String::new(),
                    },
                ],
            }],
        };
        Project::new("test", schema).with_context(ExtractionContext::default())
    }

    fn orchestrator(lm: Arc<MockLm>) -> SchemaOrchestrator {
        let classifier = Arc::new(
            Classifier::new(ClassifierConfig::disabled(), Arc::new(MockEmbedder::new(8)))
                .unwrap(),
        );
        SchemaOrchestrator::new(
            lm,
            classifier,
            ChunkerConfig::default(),
            OrchestratorConfig::default(),
        )
    }

    fn source(project: &Project) -> Source {
        Source::new(project.id, "https://acme.com/about", "acme", "## About\nAcme text")
    }

    #[tokio::test]
    async fn test_single_chunk_extraction() {
        let lm = Arc::new(MockLm::new().with_response(
            LmRequestType::ExtractFieldGroup,
            json!({"data": {"has_sso": true, "employee_count": 120}, "confidence": 0.8})
                .to_string(),
        ));
        let project = project();
        let source = source(&project);
        let outcome = orchestrator(lm)
            .extract_source(&project, &source, &source.content, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.extractions.len(), 1);
        assert_eq!(outcome.chunks_processed, 1);
        let extraction = &outcome.extractions[0];
        assert_eq!(extraction.extraction_type, "overview");
        assert_eq!(extraction.data["has_sso"], json!(true));
        assert!((extraction.confidence - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_garbage_output_degrades_to_empty() {
        let lm = Arc::new(
            MockLm::new().with_response(LmRequestType::ExtractFieldGroup, "utter nonsense"),
        );
        let project = project();
        let source = source(&project);
        let outcome = orchestrator(lm)
            .extract_source(&project, &source, &source.content, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.extractions.len(), 1);
        let extraction = &outcome.extractions[0];
        assert!(extraction.is_empty());
        assert_eq!(extraction.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_cancellation_before_submit() {
        let lm = Arc::new(MockLm::new());
        let project = project();
        let source = source(&project);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = orchestrator(lm.clone())
            .extract_source(&project, &source, &source.content, &cancel)
            .await;
        assert!(matches!(result, Err(ExtractionError::Cancelled)));
        assert_eq!(lm.request_count(), 0);
    }
}
