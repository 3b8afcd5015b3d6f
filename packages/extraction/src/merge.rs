//! Typed merge of per-chunk LM results into one record per field group.
//!
//! Chunk processing is unordered, so every rule here is commutative:
//! booleans OR, numerics take the maximum, text takes the longest value,
//! lists concatenate with order-preserving dedup, enums take the first
//! non-null and log disagreement. Entity-list groups merge record lists
//! keyed by the context's id fields.

use indexmap::IndexSet;
use serde_json::{Map, Value};

use crate::types::extraction::value_is_empty;
use crate::types::project::ExtractionContext;
use crate::types::schema::{ExtractionSchema, FieldGroup, FieldType};

/// One chunk's parsed-and-validated result for a group.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    /// For plain groups: the validated field map. For entity-list
    /// groups: unused (see `records`).
    pub data: Map<String, Value>,

    /// For entity-list groups: the validated records.
    pub records: Vec<Map<String, Value>>,

    /// Model-reported confidence for this chunk, when present.
    pub confidence: Option<f32>,
}

impl ChunkResult {
    /// An empty result (unparseable output); carries zero confidence.
    pub fn empty(group: &FieldGroup) -> Self {
        let mut data = Map::new();
        for field in &group.fields {
            data.insert(field.name.clone(), field.default_value());
        }
        Self {
            data,
            records: vec![],
            confidence: Some(0.0),
        }
    }

    /// Parse one raw LM JSON value into a validated chunk result.
    pub fn from_raw(group: &FieldGroup, raw: &Value) -> Self {
        let confidence = raw
            .get("confidence")
            .and_then(Value::as_f64)
            .map(|c| (c as f32).clamp(0.0, 1.0));

        if group.is_entity_list {
            let records = raw
                .get("records")
                .and_then(Value::as_array)
                .map(|records| {
                    records
                        .iter()
                        .map(|r| ExtractionSchema::validate_record(group, r))
                        .collect()
                })
                .unwrap_or_default();
            Self {
                data: Map::new(),
                records,
                confidence,
            }
        } else {
            // Tolerate both {"data": {...}} and a bare field object.
            let record = raw.get("data").unwrap_or(raw);
            Self {
                data: ExtractionSchema::validate_record(group, record),
                records: vec![],
                confidence,
            }
        }
    }
}

/// The merged output of one group across all chunks.
#[derive(Debug, Clone)]
pub struct MergedGroup {
    pub data: Map<String, Value>,
    /// Final confidence after recalibration.
    pub confidence: f32,
    pub is_empty: bool,
}

/// Merge chunk results for one group and recalibrate confidence.
pub fn merge_group(
    group: &FieldGroup,
    context: &ExtractionContext,
    chunks: &[ChunkResult],
) -> MergedGroup {
    let data = if group.is_entity_list {
        let mut map = Map::new();
        map.insert(
            "records".to_string(),
            Value::Array(
                merge_entity_records(context, chunks)
                    .into_iter()
                    .map(Value::Object)
                    .collect(),
            ),
        );
        map
    } else {
        let mut map = Map::new();
        for field in &group.fields {
            let values: Vec<&Value> = chunks
                .iter()
                .filter_map(|c| c.data.get(&field.name))
                .collect();
            map.insert(
                field.name.clone(),
                merge_field(field.field_type, &field.name, &group.name, &values),
            );
        }
        map
    };

    let raw = chunks
        .iter()
        .filter_map(|c| c.confidence)
        .fold(0.0f32, f32::max);
    let is_empty = data.values().all(value_is_empty);
    let confidence = recalibrate(raw, is_empty);

    MergedGroup {
        data,
        confidence,
        is_empty,
    }
}

/// Empty results are capped at 0.1 as a hallucination guard; anything
/// else passes the raw confidence through unchanged.
pub fn recalibrate(raw: f32, is_empty: bool) -> f32 {
    if is_empty {
        raw.min(0.1)
    } else {
        raw
    }
}

/// Merge one field's values across chunks under its type rule.
fn merge_field(field_type: FieldType, field: &str, group: &str, values: &[&Value]) -> Value {
    match field_type {
        FieldType::Boolean => {
            let mut saw_false = false;
            for v in values {
                match v {
                    Value::Bool(true) => return Value::Bool(true),
                    Value::Bool(false) => saw_false = true,
                    _ => {}
                }
            }
            if saw_false {
                Value::Bool(false)
            } else {
                Value::Null
            }
        }
        FieldType::Integer => values
            .iter()
            .filter_map(|v| v.as_i64())
            .max()
            .map(Value::from)
            .unwrap_or(Value::Null),
        FieldType::Float => values
            .iter()
            .filter_map(|v| v.as_f64())
            .fold(None::<f64>, |acc, v| {
                Some(acc.map_or(v, |a| a.max(v)))
            })
            .map(Value::from)
            .unwrap_or(Value::Null),
        FieldType::Text => values
            .iter()
            .filter_map(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .max_by_key(|s| s.len())
            .map(|s| Value::String(s.to_string()))
            .unwrap_or(Value::Null),
        FieldType::List => {
            let mut seen: IndexSet<String> = IndexSet::new();
            let mut out: Vec<Value> = Vec::new();
            for v in values {
                if let Value::Array(items) = v {
                    for item in items {
                        let key = item.to_string();
                        if seen.insert(key) {
                            out.push(item.clone());
                        }
                    }
                }
            }
            if out.is_empty() {
                Value::Null
            } else {
                Value::Array(out)
            }
        }
        FieldType::Enum => {
            let non_null: Vec<&str> = values.iter().filter_map(|v| v.as_str()).collect();
            if let Some(first) = non_null.first() {
                if non_null.iter().any(|v| v != first) {
                    tracing::warn!(
                        field,
                        group,
                        values = ?non_null,
                        "chunks disagree on enum field; keeping first"
                    );
                }
                Value::String(first.to_string())
            } else {
                Value::Null
            }
        }
    }
}

/// Merge entity-list records, deduplicating by the first populated id
/// field; records with no populated id field are kept as-is.
fn merge_entity_records(
    context: &ExtractionContext,
    chunks: &[ChunkResult],
) -> Vec<Map<String, Value>> {
    let mut seen: IndexSet<String> = IndexSet::new();
    let mut out: Vec<Map<String, Value>> = Vec::new();

    for chunk in chunks {
        for record in &chunk.records {
            match record_key(context, record) {
                Some(key) => {
                    if seen.insert(key) {
                        out.push(record.clone());
                    }
                }
                None => out.push(record.clone()),
            }
        }
    }
    out
}

/// Identity of a record: the first id field with a non-empty value.
fn record_key(context: &ExtractionContext, record: &Map<String, Value>) -> Option<String> {
    for id_field in &context.entity_id_fields {
        if let Some(value) = record.get(id_field) {
            if !value_is_empty(value) {
                let text = match value {
                    Value::String(s) => s.trim().to_lowercase(),
                    other => other.to_string(),
                };
                return Some(format!("{}={}", id_field, text));
            }
        }
    }
    None
}
