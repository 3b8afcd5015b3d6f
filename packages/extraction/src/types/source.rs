//! Source: one fetched page belonging to a project.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle of a source through the extraction pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    #[default]
    Pending,
    Extracted,
    Failed,
}

/// A fetched page. Unique per `(project_id, uri)`.
///
/// Content is written by the scrape/crawl workers; `cleaned_content` and
/// `status` are written by the extraction pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub project_id: Uuid,
    pub uri: String,

    /// Human-meaningful grouping label, typically a company name.
    pub source_group: String,

    /// Page content as markdown.
    pub content: String,

    /// Boilerplate-stripped content; None until the domain has been
    /// fingerprinted.
    pub cleaned_content: Option<String>,

    /// Page metadata; always includes `domain`.
    pub metadata: HashMap<String, Value>,

    pub status: SourceStatus,

    /// Failure reasons accumulated by the pipeline.
    pub errors: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    /// Create a pending source.
    pub fn new(
        project_id: Uuid,
        uri: impl Into<String>,
        source_group: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let uri = uri.into();
        let now = Utc::now();
        let mut metadata = HashMap::new();
        if let Some(domain) = domain_of(&uri) {
            metadata.insert("domain".to_string(), Value::String(domain));
        }
        Self {
            id: Uuid::new_v4(),
            project_id,
            uri,
            source_group: source_group.into(),
            content: content.into(),
            cleaned_content: None,
            metadata,
            status: SourceStatus::Pending,
            errors: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The source's registrable domain, from metadata or its URI.
    pub fn domain(&self) -> Option<String> {
        self.metadata
            .get("domain")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| domain_of(&self.uri))
    }

    /// The content extraction should read: cleaned when available and
    /// non-empty, the original otherwise (an empty strip result must not
    /// produce a vacuous extraction).
    pub fn extractable_content(&self, use_cleaned: bool) -> &str {
        if use_cleaned {
            if let Some(cleaned) = &self.cleaned_content {
                if !cleaned.trim().is_empty() {
                    return cleaned;
                }
            }
        }
        &self.content
    }
}

/// Host portion of a URI, lowercased, without a leading "www.".
pub fn domain_of(uri: &str) -> Option<String> {
    let parsed = url::Url::parse(uri).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_extraction() {
        assert_eq!(
            domain_of("https://www.Example.com/pricing"),
            Some("example.com".to_string())
        );
        assert_eq!(domain_of("not a url"), None);
    }

    #[test]
    fn test_extractable_content_falls_back_on_empty_clean() {
        let mut source = Source::new(Uuid::new_v4(), "https://a.com/x", "acme", "original");
        source.cleaned_content = Some("   ".to_string());
        assert_eq!(source.extractable_content(true), "original");

        source.cleaned_content = Some("cleaned".to_string());
        assert_eq!(source.extractable_content(true), "cleaned");
        assert_eq!(source.extractable_content(false), "original");
    }
}
