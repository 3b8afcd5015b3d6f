//! Tunables for the pipeline stages.
//!
//! Plain structs with defaults and `with_*` setters; the server crate
//! populates these from environment configuration.

use serde::{Deserialize, Serialize};

/// Chunking parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Token budget per chunk; tokens are approximated as 4 chars each.
    pub max_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self { max_tokens: 8_000 }
    }
}

impl ChunkerConfig {
    /// Budget in characters.
    pub fn max_chars(&self) -> usize {
        self.max_tokens * 4
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Classifier routing thresholds and skip patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub enabled: bool,

    /// Above this max score, select groups within `high_margin` of max.
    pub high_threshold: f32,
    pub high_margin: f32,

    /// Between `low_threshold` and `high_threshold`, take the top
    /// `medium_top_n` groups.
    pub low_threshold: f32,
    pub medium_top_n: usize,

    /// Below `low_threshold`, take groups above `low_ratio * max`, with a
    /// floor of `low_floor` groups.
    pub low_ratio: f32,
    pub low_floor: usize,

    /// Characters of cleaned content embedded for routing.
    pub embed_chars: usize,

    /// Rule-based skips; matching forces skip_extraction.
    pub skip_patterns_enabled: bool,
    #[serde(default)]
    pub url_skip_patterns: Vec<String>,
    #[serde(default)]
    pub content_skip_patterns: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            high_threshold: 0.75,
            high_margin: 0.10,
            low_threshold: 0.40,
            medium_top_n: 3,
            low_ratio: 0.80,
            low_floor: 2,
            embed_chars: 6_000,
            skip_patterns_enabled: false,
            url_skip_patterns: vec![],
            content_skip_patterns: vec![],
        }
    }
}

impl ClassifierConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn with_skip_patterns(
        mut self,
        url_patterns: Vec<String>,
        content_patterns: Vec<String>,
    ) -> Self {
        self.skip_patterns_enabled = true;
        self.url_skip_patterns = url_patterns;
        self.content_skip_patterns = content_patterns;
        self
    }
}

/// Schema orchestrator limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Concurrent in-flight chunk requests.
    pub max_concurrent_chunks: usize,

    /// Chunk text is truncated to this many chars in the user prompt.
    pub content_limit: usize,

    /// Per-request LM deadline in seconds.
    pub request_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: 80,
            content_limit: 20_000,
            request_timeout_secs: 300,
        }
    }
}

/// Similarity-dedup parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DedupConfig {
    pub enabled: bool,
    /// Score at or above which a candidate is a duplicate.
    pub threshold: f32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.90,
        }
    }
}

/// Top-level pipeline switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Prefer `cleaned_content` when the domain has a fingerprint.
    pub domain_dedup_enabled: bool,

    pub chunker: ChunkerConfig,
    pub classifier: ClassifierConfig,
    pub orchestrator: OrchestratorConfig,
    pub dedup: DedupConfig,

    /// Orphan recovery batch size.
    pub orphan_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            domain_dedup_enabled: true,
            chunker: ChunkerConfig::default(),
            classifier: ClassifierConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            dedup: DedupConfig::default(),
            orphan_batch_size: 50,
        }
    }
}
