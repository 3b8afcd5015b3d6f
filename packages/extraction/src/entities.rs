//! LM-driven entity emission with typed normalization and idempotent
//! linkage.
//!
//! Runs after extractions are persisted. Failure leaves the extraction's
//! `entities_extracted` flag false so a later sweep retries; success over
//! the same extraction twice creates nothing new.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::broker::{LmBroker, LmRequest, LmRequestType, LmResponseStatus};
use crate::error::{ExtractionError, Result};
use crate::json_repair::parse_or_repair;
use crate::prompts::entity_messages;
use crate::traits::repos::{EntityRepo, ExtractionRepo};
use crate::types::entity::Entity;
use crate::types::extraction::Extraction;
use crate::types::project::Project;

/// Counters from one entity pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityOutcome {
    pub entities_seen: usize,
    pub entities_created: usize,
    pub links_created: usize,
}

/// One entity record as the LM emits it.
#[derive(Debug, Deserialize)]
struct RawEntity {
    entity_type: String,
    value: String,
    #[serde(default)]
    attributes: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawEntityList {
    #[serde(default)]
    entities: Vec<RawEntity>,
}

pub struct EntityExtractor {
    broker: Arc<dyn LmBroker>,
    entities: Arc<dyn EntityRepo>,
    extractions: Arc<dyn ExtractionRepo>,
    request_timeout: std::time::Duration,
}

impl EntityExtractor {
    pub fn new(
        broker: Arc<dyn LmBroker>,
        entities: Arc<dyn EntityRepo>,
        extractions: Arc<dyn ExtractionRepo>,
    ) -> Self {
        Self {
            broker,
            entities,
            extractions,
            request_timeout: std::time::Duration::from_secs(300),
        }
    }

    pub fn with_request_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Run the entity pass over one persisted extraction.
    ///
    /// A no-op when the flag is already set or the project defines no
    /// entity types.
    pub async fn process(
        &self,
        project: &Project,
        source_group: &str,
        extraction: &Extraction,
    ) -> Result<EntityOutcome> {
        if extraction.entities_extracted {
            return Ok(EntityOutcome::default());
        }
        if project.entity_types.is_empty() {
            self.extractions
                .set_entities_extracted(extraction.id, true)
                .await?;
            return Ok(EntityOutcome::default());
        }

        let messages = entity_messages(
            &project.entity_types,
            &project.context,
            source_group,
            &extraction.data,
        );
        let request = LmRequest::new(
            LmRequestType::ExtractEntities,
            messages,
            self.request_timeout,
        )
        .with_payload(serde_json::json!({ "extraction_id": extraction.id }));

        let response = self.broker.execute(request, self.request_timeout).await?;
        if response.status != LmResponseStatus::Success {
            return Err(ExtractionError::Broker(crate::error::BrokerError::Endpoint(
                format!(
                    "entity request for {} ended {:?}: {}",
                    extraction.id,
                    response.status,
                    response.error.unwrap_or_default()
                )
                .into(),
            )));
        }

        let text = response.result.unwrap_or_default();
        let raw: RawEntityList = match parse_or_repair(&text) {
            Some(value) => serde_json::from_value(value)?,
            None => {
                tracing::warn!(
                    extraction = %extraction.id,
                    "unrecoverable entity JSON; leaving flag unset for retry"
                );
                return Err(ExtractionError::JsonParse(
                    <serde_json::Error as serde::de::Error>::custom(
                        "unrecoverable entity output",
                    ),
                ));
            }
        };

        let mut outcome = EntityOutcome::default();
        for record in raw.entities {
            let Some(type_def) = project.entity_type(&record.entity_type) else {
                tracing::warn!(
                    entity_type = %record.entity_type,
                    "LM emitted an unknown entity type; skipping"
                );
                continue;
            };
            if record.value.trim().is_empty() {
                continue;
            }
            outcome.entities_seen += 1;

            let mut entity = Entity::new(
                extraction.project_id,
                source_group,
                &type_def.name,
                record.value,
                type_def.normalization,
            );
            entity.attributes = record.attributes.into_iter().collect();

            let stored = self.entities.get_or_create(&entity).await?;
            if stored.id == entity.id {
                outcome.entities_created += 1;
            }

            // A duplicate link is a successful no-op, not an error.
            let (_, created) = self
                .entities
                .get_or_create_link(extraction.id, stored.id, "mention")
                .await?;
            if created {
                outcome.links_created += 1;
            }
        }

        self.extractions
            .set_entities_extracted(extraction.id, true)
            .await?;

        tracing::debug!(
            extraction = %extraction.id,
            entities = outcome.entities_seen,
            created = outcome.entities_created,
            links = outcome.links_created,
            "entity pass complete"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LmRequestType;
    use crate::testing::{MemoryStores, MockLm};
    use crate::types::project::{EntityTypeDef, NormalizationRule};
    use crate::types::schema::ExtractionSchema;
    use serde_json::json;
    use uuid::Uuid;

    fn project() -> Project {
        Project::new("p", ExtractionSchema { groups: vec![] }).with_entity_types(vec![
            EntityTypeDef {
                name: "plan".into(),
                description: "a pricing plan".into(),
                value_hint: None,
                normalization: NormalizationRule::LowercaseStrip,
            },
            EntityTypeDef {
                name: "limit".into(),
                description: "a usage limit".into(),
                value_hint: None,
                normalization: NormalizationRule::NumberPerUnit,
            },
        ])
    }

    fn extraction(project: &Project) -> Extraction {
        Extraction::new(
            project.id,
            Uuid::new_v4(),
            "plans",
            json!({"records": [{"name": "Pro"}]})
                .as_object()
                .unwrap()
                .clone(),
            0.8,
        )
    }

    fn lm_with_entities() -> Arc<MockLm> {
        Arc::new(MockLm::new().with_response(
            LmRequestType::ExtractEntities,
            json!({"entities": [
                {"entity_type": "plan", "value": "Pro"},
                {"entity_type": "plan", "value": "pro "},
                {"entity_type": "limit", "value": "100 requests / month"},
                {"entity_type": "unknown_kind", "value": "x"}
            ]})
            .to_string(),
        ))
    }

    #[tokio::test]
    async fn test_duplicate_entity_collapses_and_second_pass_is_noop() {
        let stores = Arc::new(MemoryStores::new());
        let project = project();
        let extraction = extraction(&project);
        stores.create_batch(&[extraction.clone()]).await.unwrap();

        let extractor =
            EntityExtractor::new(lm_with_entities(), stores.clone(), stores.clone());

        let outcome = extractor
            .process(&project, "acme", &extraction)
            .await
            .unwrap();
        // "Pro" and "pro " normalize identically: one entity, one link.
        assert_eq!(outcome.entities_seen, 3);
        assert_eq!(outcome.entities_created, 2);
        assert_eq!(outcome.links_created, 2);

        let linked = stores.list_for_extraction(extraction.id).await.unwrap();
        assert_eq!(linked.len(), 2);

        // The flag is now set; a second pass does nothing.
        let updated = stores
            .get_extraction(extraction.id)
            .await
            .unwrap()
            .unwrap();
        assert!(updated.entities_extracted);
        let second = extractor
            .process(&project, "acme", &updated)
            .await
            .unwrap();
        assert_eq!(second, EntityOutcome::default());
    }

    #[tokio::test]
    async fn test_rerun_without_flag_creates_nothing_new() {
        let stores = Arc::new(MemoryStores::new());
        let project = project();
        let extraction = extraction(&project);
        stores.create_batch(&[extraction.clone()]).await.unwrap();

        let extractor =
            EntityExtractor::new(lm_with_entities(), stores.clone(), stores.clone());
        extractor
            .process(&project, "acme", &extraction)
            .await
            .unwrap();

        // Simulate a retry that somehow re-reads the stale row.
        let outcome = extractor
            .process(&project, "acme", &extraction)
            .await
            .unwrap();
        assert_eq!(outcome.entities_created, 0);
        assert_eq!(outcome.links_created, 0);
    }

    #[tokio::test]
    async fn test_failure_leaves_flag_unset() {
        let stores = Arc::new(MemoryStores::new());
        let project = project();
        let extraction = extraction(&project);
        stores.create_batch(&[extraction.clone()]).await.unwrap();

        let lm = Arc::new(
            MockLm::new().with_response(LmRequestType::ExtractEntities, "not json at all"),
        );
        let extractor = EntityExtractor::new(lm, stores.clone(), stores.clone());
        assert!(extractor
            .process(&project, "acme", &extraction)
            .await
            .is_err());

        let row = stores
            .get_extraction(extraction.id)
            .await
            .unwrap()
            .unwrap();
        assert!(!row.entities_extracted);
    }

    #[tokio::test]
    async fn test_no_entity_types_sets_flag_without_lm_call() {
        let stores = Arc::new(MemoryStores::new());
        let project = Project::new("p", ExtractionSchema { groups: vec![] });
        let extraction = extraction(&project);
        stores.create_batch(&[extraction.clone()]).await.unwrap();

        let lm = Arc::new(MockLm::new());
        let extractor = EntityExtractor::new(lm.clone(), stores.clone(), stores.clone());
        extractor
            .process(&project, "acme", &extraction)
            .await
            .unwrap();
        assert_eq!(lm.request_count(), 0);
        assert!(stores
            .get_extraction(extraction.id)
            .await
            .unwrap()
            .unwrap()
            .entities_extracted);
    }
}
