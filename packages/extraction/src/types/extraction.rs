//! Extraction: one merged field-group result for a source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A schema-conforming record extracted from one source for one field
/// group. Immutable once written except `embedding_id` and
/// `entities_extracted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    pub id: Uuid,
    pub project_id: Uuid,
    pub source_id: Uuid,

    /// Name of the field group this record conforms to.
    pub extraction_type: String,

    /// Field name → typed value, per the group's schema.
    pub data: Map<String, Value>,

    pub confidence: f32,

    /// Vector store point id; None until indexed (an orphan).
    pub embedding_id: Option<Uuid>,

    /// Whether the entity pass has run over this record.
    pub entities_extracted: bool,

    pub created_at: DateTime<Utc>,
}

impl Extraction {
    /// Create a new, not-yet-indexed extraction.
    pub fn new(
        project_id: Uuid,
        source_id: Uuid,
        extraction_type: impl Into<String>,
        data: Map<String, Value>,
        confidence: f32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            source_id,
            extraction_type: extraction_type.into(),
            data,
            confidence: confidence.clamp(0.0, 1.0),
            embedding_id: None,
            entities_extracted: false,
            created_at: Utc::now(),
        }
    }

    /// Whether every field is null or empty.
    pub fn is_empty(&self) -> bool {
        self.data.values().all(value_is_empty)
    }

    /// The text embedded for similarity search and deduplication: the
    /// longest non-empty text field, falling back to the compact JSON of
    /// the whole record.
    pub fn canonical_text(&self) -> String {
        self.data
            .values()
            .filter_map(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .max_by_key(|s| s.len())
            .map(str::to_string)
            .unwrap_or_else(|| {
                serde_json::to_string(&self.data).unwrap_or_default()
            })
    }
}

/// Null, empty string, empty array, or empty object.
pub fn value_is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extraction_with(data: Value) -> Extraction {
        Extraction::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "company_overview",
            data.as_object().unwrap().clone(),
            0.8,
        )
    }

    #[test]
    fn test_is_empty() {
        assert!(extraction_with(json!({"a": null, "b": "", "c": []})).is_empty());
        assert!(!extraction_with(json!({"a": null, "b": false})).is_empty());
        assert!(!extraction_with(json!({"a": "x"})).is_empty());
    }

    #[test]
    fn test_canonical_text_prefers_longest_string() {
        let e = extraction_with(json!({"short": "hi", "long": "a longer description"}));
        assert_eq!(e.canonical_text(), "a longer description");
    }

    #[test]
    fn test_canonical_text_falls_back_to_json() {
        let e = extraction_with(json!({"count": 5}));
        assert!(e.canonical_text().contains("\"count\""));
    }

    #[test]
    fn test_confidence_clamped() {
        let e = extraction_with(json!({"a": 1}));
        assert!(e.confidence <= 1.0);
        let e2 = Extraction::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "g",
            Map::new(),
            1.7,
        );
        assert_eq!(e2.confidence, 1.0);
    }
}
