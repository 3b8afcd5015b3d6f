//! Entities and their links to extractions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::project::NormalizationRule;

/// A normalized entity within a project's source group.
///
/// Unique on (project_id, source_group, entity_type, normalized_value).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub project_id: Uuid,
    pub source_group: String,
    pub entity_type: String,

    /// Uniqueness key, computed by the type's normalization rule.
    pub normalized_value: String,

    /// Display value as the LM emitted it.
    pub value: String,

    pub attributes: HashMap<String, Value>,

    pub created_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(
        project_id: Uuid,
        source_group: impl Into<String>,
        entity_type: impl Into<String>,
        value: impl Into<String>,
        rule: NormalizationRule,
    ) -> Self {
        let value = value.into();
        Self {
            id: Uuid::new_v4(),
            project_id,
            source_group: source_group.into(),
            entity_type: entity_type.into(),
            normalized_value: normalize_value(&value, rule),
            value,
            attributes: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// Many-to-many link between an extraction and an entity.
///
/// Unique on (extraction_id, entity_id, role); creation is idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionEntity {
    pub extraction_id: Uuid,
    pub entity_id: Uuid,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

/// Apply a normalization rule to a raw entity value.
pub fn normalize_value(value: &str, rule: NormalizationRule) -> String {
    match rule {
        NormalizationRule::LowercaseStrip => value.trim().to_lowercase(),
        NormalizationRule::NumberPerUnit => normalize_number_per_unit(value),
        NormalizationRule::CentsPerPeriod => normalize_cents_per_period(value),
    }
}

/// "100 requests / month" → "100_per_month"; falls back to
/// lowercase+strip when no number is present.
fn normalize_number_per_unit(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    let number: String = lowered
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .filter(|c| *c != ',')
        .collect();
    if number.is_empty() {
        return lowered;
    }
    let unit = last_word(&lowered);
    match unit {
        Some(unit) => format!("{}_per_{}", number, unit),
        None => number,
    }
}

/// "$49/month" → "4900_per_month"; non-monetary input falls back to
/// lowercase+strip.
fn normalize_cents_per_period(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    let amount: String = lowered
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .filter(|c| *c != ',')
        .collect();
    let Ok(dollars) = amount.parse::<f64>() else {
        return lowered;
    };
    let cents = (dollars * 100.0).round() as i64;
    let period = last_word(&lowered).unwrap_or_else(|| "month".to_string());
    format!("{}_per_{}", cents, period)
}

/// Final alphabetic word, e.g. the unit or billing period.
fn last_word(text: &str) -> Option<String> {
    text.split(|c: char| !c.is_ascii_alphabetic())
        .filter(|w| !w.is_empty())
        .next_back()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowercase_strip() {
        assert_eq!(
            normalize_value("  Single Sign-On  ", NormalizationRule::LowercaseStrip),
            "single sign-on"
        );
    }

    #[test]
    fn test_number_per_unit() {
        assert_eq!(
            normalize_value("100 requests / month", NormalizationRule::NumberPerUnit),
            "100_per_month"
        );
        assert_eq!(
            normalize_value("1,000 seats", NormalizationRule::NumberPerUnit),
            "1000_per_seats"
        );
        // No number: falls back to lowercase+strip
        assert_eq!(
            normalize_value("Unlimited", NormalizationRule::NumberPerUnit),
            "unlimited"
        );
    }

    #[test]
    fn test_cents_per_period() {
        assert_eq!(
            normalize_value("$49/month", NormalizationRule::CentsPerPeriod),
            "4900_per_month"
        );
        assert_eq!(
            normalize_value("$49.50 per year", NormalizationRule::CentsPerPeriod),
            "4950_per_year"
        );
        assert_eq!(
            normalize_value("Contact us", NormalizationRule::CentsPerPeriod),
            "contact us"
        );
    }

    #[test]
    fn test_same_value_same_key() {
        let a = normalize_value("PRO Plan", NormalizationRule::LowercaseStrip);
        let b = normalize_value("pro plan ", NormalizationRule::LowercaseStrip);
        assert_eq!(a, b);
    }
}
