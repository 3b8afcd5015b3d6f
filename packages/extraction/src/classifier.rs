//! Embedding-similarity routing of a page to relevant field groups.
//!
//! Each field group's `description || prompt_hint` is embedded once and
//! cached; a page is embedded from the head of its cleaned content and
//! scored against every group. Selection widens as the best score drops:
//! a confident match keeps only its near neighbors, a weak page falls
//! back to the closest couple of groups rather than none.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use tokio::sync::RwLock;

use crate::config::ClassifierConfig;
use crate::error::{ExtractionError, Result};
use crate::traits::embedder::{cosine_similarity, EmbeddingService};
use crate::types::schema::FieldGroup;

/// Routing outcome for one page.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// A rule-based skip pattern matched; mark extracted with zero
    /// extractions.
    Skip,
    /// Selected group names, best first.
    Groups(Vec<String>),
}

/// One group's similarity to the page.
#[derive(Debug, Clone)]
struct GroupScore {
    name: String,
    score: f32,
}

pub struct Classifier {
    config: ClassifierConfig,
    embedder: Arc<dyn EmbeddingService>,
    /// Group-name → embedding of its classification text.
    cache: RwLock<HashMap<String, Vec<f32>>>,
    url_skips: Vec<Regex>,
    content_skips: Vec<Regex>,
}

impl Classifier {
    pub fn new(config: ClassifierConfig, embedder: Arc<dyn EmbeddingService>) -> Result<Self> {
        let url_skips = compile_patterns(&config.url_skip_patterns)?;
        let content_skips = compile_patterns(&config.content_skip_patterns)?;
        Ok(Self {
            config,
            embedder,
            cache: RwLock::new(HashMap::new()),
            url_skips,
            content_skips,
        })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Route one page. `content` should be Layer-2 cleaned; the
    /// classifier reads tighter text than the extractor by design.
    pub async fn classify(
        &self,
        uri: &str,
        content: &str,
        groups: &[FieldGroup],
    ) -> Result<Classification> {
        if self.config.skip_patterns_enabled && self.matches_skip(uri, content) {
            tracing::info!(uri, "skip pattern matched; bypassing extraction");
            return Ok(Classification::Skip);
        }
        if groups.is_empty() {
            return Ok(Classification::Groups(vec![]));
        }
        if !self.config.enabled {
            return Ok(Classification::Groups(
                groups.iter().map(|g| g.name.clone()).collect(),
            ));
        }

        let head = head_chars(content, self.config.embed_chars);
        let page_embedding = self.embedder.embed(head).await?;

        let mut scores = Vec::with_capacity(groups.len());
        for group in groups {
            let group_embedding = self.group_embedding(group).await?;
            scores.push(GroupScore {
                name: group.name.clone(),
                score: cosine_similarity(&page_embedding, &group_embedding),
            });
        }
        scores.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let selected = self.select(&scores);
        tracing::debug!(
            uri,
            max_score = scores.first().map(|s| s.score).unwrap_or(0.0),
            selected = ?selected,
            "classified page"
        );
        Ok(Classification::Groups(selected))
    }

    /// Bucketed selection over sorted scores.
    fn select(&self, scores: &[GroupScore]) -> Vec<String> {
        let Some(best) = scores.first() else {
            return vec![];
        };
        let max = best.score;

        if max > self.config.high_threshold {
            // Confident: keep everything within the margin of the max.
            scores
                .iter()
                .filter(|s| s.score >= max - self.config.high_margin)
                .map(|s| s.name.clone())
                .collect()
        } else if max >= self.config.low_threshold {
            scores
                .iter()
                .take(self.config.medium_top_n)
                .map(|s| s.name.clone())
                .collect()
        } else {
            let cutoff = max * self.config.low_ratio;
            let above: Vec<String> = scores
                .iter()
                .filter(|s| s.score > cutoff)
                .map(|s| s.name.clone())
                .collect();
            if above.len() >= self.config.low_floor {
                above
            } else {
                scores
                    .iter()
                    .take(self.config.low_floor)
                    .map(|s| s.name.clone())
                    .collect()
            }
        }
    }

    fn matches_skip(&self, uri: &str, content: &str) -> bool {
        self.url_skips.iter().any(|re| re.is_match(uri))
            || self.content_skips.iter().any(|re| re.is_match(content))
    }

    async fn group_embedding(&self, group: &FieldGroup) -> Result<Vec<f32>> {
        if let Some(cached) = self.cache.read().await.get(&group.name) {
            return Ok(cached.clone());
        }
        let embedding = self.embedder.embed(&group.classification_text()).await?;
        self.cache
            .write()
            .await
            .insert(group.name.clone(), embedding.clone());
        Ok(embedding)
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| ExtractionError::Config {
                reason: format!("invalid skip pattern {p:?}: {e}"),
            })
        })
        .collect()
}

/// First `limit` chars on a char boundary.
fn head_chars(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
