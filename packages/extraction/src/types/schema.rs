//! Extraction schema: field groups compiled from their JSON-at-rest form.
//!
//! A project's schema is stored as JSON and compiled into typed
//! [`FieldGroup`]s at load time. Validation of LM output against the
//! compiled schema is structure-strict but scalar-tolerant: strings that
//! unambiguously encode numbers or booleans are coerced, anything else is
//! dropped back to the field's default.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ExtractionError, Result};

/// The typed kind of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Integer,
    Float,
    Boolean,
    Enum,
    List,
}

impl FieldType {
    /// Human-readable name used in prompts.
    pub fn prompt_name(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Float => "number",
            FieldType::Boolean => "boolean",
            FieldType::Enum => "one of the allowed values",
            FieldType::List => "list of strings",
        }
    }
}

/// A single extractable field within a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub name: String,

    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Allowed values; required when `field_type` is `Enum`.
    #[serde(default)]
    pub enum_values: Vec<String>,

    /// Value used when the LM reports nothing for this field.
    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub description: String,
}

impl Field {
    /// The value persisted when no chunk produced anything for this field.
    pub fn default_value(&self) -> Value {
        self.default.clone().unwrap_or(Value::Null)
    }

    /// Coerce a raw LM value into this field's type.
    ///
    /// Returns `None` when the value cannot be represented without
    /// guessing; the caller drops the field to its default.
    pub fn coerce(&self, raw: &Value) -> Option<Value> {
        if raw.is_null() {
            return Some(Value::Null);
        }
        match self.field_type {
            FieldType::Text => match raw {
                Value::String(s) => Some(Value::String(s.clone())),
                Value::Number(n) => Some(Value::String(n.to_string())),
                _ => None,
            },
            FieldType::Integer => match raw {
                Value::Number(n) if n.is_i64() || n.is_u64() => Some(raw.clone()),
                // Tolerate floats that are exactly integral
                Value::Number(n) => n.as_f64().and_then(|f| {
                    if f.fract() == 0.0 {
                        Some(Value::from(f as i64))
                    } else {
                        None
                    }
                }),
                Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
                _ => None,
            },
            FieldType::Float => match raw {
                Value::Number(_) => Some(raw.clone()),
                Value::String(s) => s.trim().parse::<f64>().ok().map(Value::from),
                _ => None,
            },
            FieldType::Boolean => match raw {
                Value::Bool(_) => Some(raw.clone()),
                Value::String(s) => match s.trim().to_lowercase().as_str() {
                    "true" => Some(Value::Bool(true)),
                    "false" => Some(Value::Bool(false)),
                    _ => None,
                },
                _ => None,
            },
            FieldType::Enum => match raw {
                Value::String(s) if self.enum_values.iter().any(|v| v == s) => {
                    Some(Value::String(s.clone()))
                }
                _ => None,
            },
            FieldType::List => match raw {
                Value::Array(_) => Some(raw.clone()),
                // A bare scalar becomes a single-element list
                Value::String(s) => Some(Value::Array(vec![Value::String(s.clone())])),
                _ => None,
            },
        }
    }
}

/// A named group of related fields extracted in one LM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldGroup {
    pub name: String,
    pub description: String,

    /// When true the group's result is a list of records rather than a
    /// single record; merge deduplicates by the context's id fields.
    #[serde(default)]
    pub is_entity_list: bool,

    #[serde(default)]
    pub prompt_hint: Option<String>,

    pub fields: Vec<Field>,
}

impl FieldGroup {
    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Text the classifier embeds to route pages to this group.
    pub fn classification_text(&self) -> String {
        match &self.prompt_hint {
            Some(hint) => format!("{} {}", self.description, hint),
            None => self.description.clone(),
        }
    }
}

/// An ordered list of field groups; a project's whole extraction surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSchema {
    pub groups: Vec<FieldGroup>,
}

impl ExtractionSchema {
    /// Compile a schema from its JSON-at-rest form, validating structure.
    pub fn compile(raw: &Value) -> Result<Self> {
        let schema: ExtractionSchema =
            serde_json::from_value(raw.clone()).map_err(|e| ExtractionError::InvalidSchema {
                reason: e.to_string(),
            })?;
        schema.validate()?;
        Ok(schema)
    }

    /// Structural validation: unique non-empty names, enum values present.
    pub fn validate(&self) -> Result<()> {
        let mut group_names = std::collections::HashSet::new();
        for group in &self.groups {
            if group.name.trim().is_empty() {
                return Err(ExtractionError::InvalidSchema {
                    reason: "field group with empty name".into(),
                });
            }
            if !group_names.insert(group.name.as_str()) {
                return Err(ExtractionError::InvalidSchema {
                    reason: format!("duplicate field group name: {}", group.name),
                });
            }
            let mut field_names = std::collections::HashSet::new();
            for field in &group.fields {
                if field.name.trim().is_empty() {
                    return Err(ExtractionError::InvalidSchema {
                        reason: format!("empty field name in group {}", group.name),
                    });
                }
                if !field_names.insert(field.name.as_str()) {
                    return Err(ExtractionError::InvalidSchema {
                        reason: format!("duplicate field {} in group {}", field.name, group.name),
                    });
                }
                if field.field_type == FieldType::Enum && field.enum_values.is_empty() {
                    return Err(ExtractionError::InvalidSchema {
                        reason: format!(
                            "enum field {}.{} has no enum_values",
                            group.name, field.name
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Look up a group by name.
    pub fn group(&self, name: &str) -> Option<&FieldGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Validate and coerce one record of LM output against a group.
    ///
    /// Unknown keys are dropped. Values that fail coercion fall back to
    /// the field default; the whole record is never rejected.
    pub fn validate_record(group: &FieldGroup, raw: &Value) -> serde_json::Map<String, Value> {
        let mut out = serde_json::Map::new();
        let raw_map = raw.as_object();
        for field in &group.fields {
            let value = raw_map
                .and_then(|m| m.get(&field.name))
                .and_then(|v| field.coerce(v));
            match value {
                Some(v) => {
                    out.insert(field.name.clone(), v);
                }
                None => {
                    if raw_map.map(|m| m.contains_key(&field.name)).unwrap_or(false) {
                        tracing::warn!(
                            field = %field.name,
                            group = %group.name,
                            "dropping field value that failed type coercion"
                        );
                    }
                    out.insert(field.name.clone(), field.default_value());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_group() -> FieldGroup {
        FieldGroup {
            name: "company_overview".into(),
            description: "Basic facts about the company".into(),
            is_entity_list: false,
            prompt_hint: None,
            fields: vec![
                Field {
                    name: "employee_count".into(),
                    field_type: FieldType::Integer,
                    enum_values: vec![],
                    default: None,
                    required: false,
                    description: "Headcount".into(),
                },
                Field {
                    name: "has_sso".into(),
                    field_type: FieldType::Boolean,
                    enum_values: vec![],
                    default: None,
                    required: false,
                    description: "Supports single sign-on".into(),
                },
                Field {
                    name: "tier".into(),
                    field_type: FieldType::Enum,
                    enum_values: vec!["free".into(), "pro".into()],
                    default: None,
                    required: false,
                    description: "Plan tier".into(),
                },
            ],
        }
    }

    #[test]
    fn test_compile_rejects_duplicate_groups() {
        let raw = json!({
            "groups": [
                {"name": "a", "description": "", "fields": []},
                {"name": "a", "description": "", "fields": []}
            ]
        });
        assert!(ExtractionSchema::compile(&raw).is_err());
    }

    #[test]
    fn test_compile_rejects_enum_without_values() {
        let raw = json!({
            "groups": [{
                "name": "g", "description": "",
                "fields": [{"name": "f", "type": "enum"}]
            }]
        });
        assert!(ExtractionSchema::compile(&raw).is_err());
    }

    #[test]
    fn test_coerce_string_to_number() {
        let group = sample_group();
        let record =
            ExtractionSchema::validate_record(&group, &json!({"employee_count": "250"}));
        assert_eq!(record["employee_count"], json!(250));
    }

    #[test]
    fn test_coerce_string_to_bool() {
        let group = sample_group();
        let record = ExtractionSchema::validate_record(&group, &json!({"has_sso": "true"}));
        assert_eq!(record["has_sso"], json!(true));
    }

    #[test]
    fn test_invalid_enum_dropped_to_null() {
        let group = sample_group();
        let record = ExtractionSchema::validate_record(&group, &json!({"tier": "platinum"}));
        assert_eq!(record["tier"], Value::Null);
    }

    #[test]
    fn test_unknown_keys_dropped() {
        let group = sample_group();
        let record = ExtractionSchema::validate_record(&group, &json!({"bogus": 1}));
        assert!(!record.contains_key("bogus"));
        assert_eq!(record["employee_count"], Value::Null);
    }

    #[test]
    fn test_fractional_float_not_coerced_to_integer() {
        let group = sample_group();
        let record =
            ExtractionSchema::validate_record(&group, &json!({"employee_count": 12.5}));
        assert_eq!(record["employee_count"], Value::Null);
    }
}
