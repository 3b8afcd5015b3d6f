//! Project configuration: schema, entity types, and extraction context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::schema::ExtractionSchema;

/// How entity values of one type are normalized for uniqueness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationRule {
    /// Lowercase and strip surrounding whitespace.
    #[default]
    LowercaseStrip,
    /// `<number>_per_<unit>`, e.g. "100_per_month".
    NumberPerUnit,
    /// `<cents>_per_<period>`, e.g. "4900_per_month".
    CentsPerPeriod,
}

/// One entity type the project extracts, with its prompt description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityTypeDef {
    pub name: String,
    pub description: String,

    /// Hint shown to the LM about the expected value shape.
    #[serde(default)]
    pub value_hint: Option<String>,

    #[serde(default)]
    pub normalization: NormalizationRule,
}

/// Template-level wording and entity-list dedup configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionContext {
    /// What kind of source this project reads, e.g. "vendor website".
    pub source_type: String,

    /// Label introducing the source in prompts, e.g. "Company".
    pub source_label: String,

    /// Field names, in preference order, used to key entity-list records
    /// when merging chunk results.
    #[serde(default)]
    pub entity_id_fields: Vec<String>,
}

impl Default for ExtractionContext {
    fn default() -> Self {
        Self {
            source_type: "website".into(),
            source_label: "Source".into(),
            entity_id_fields: vec!["name".into()],
        }
    }
}

/// An operator-defined extraction project.
///
/// Soft-deleted rather than removed while extractions reference it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub schema: ExtractionSchema,
    pub entity_types: Vec<EntityTypeDef>,
    pub context: ExtractionContext,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Create a new project with the given schema.
    pub fn new(name: impl Into<String>, schema: ExtractionSchema) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            schema,
            entity_types: vec![],
            context: ExtractionContext::default(),
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the entity types.
    pub fn with_entity_types(mut self, types: Vec<EntityTypeDef>) -> Self {
        self.entity_types = types;
        self
    }

    /// Set the extraction context.
    pub fn with_context(mut self, context: ExtractionContext) -> Self {
        self.context = context;
        self
    }

    /// Look up an entity type by name.
    pub fn entity_type(&self, name: &str) -> Option<&EntityTypeDef> {
        self.entity_types.iter().find(|t| t.name == name)
    }
}
