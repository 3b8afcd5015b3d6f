//! Persisted per-domain boilerplate fingerprint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fingerprint parameters; defaults match the engine's.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoilerplateParams {
    /// A block is boilerplate when it appears on at least this share of
    /// the domain's pages.
    pub threshold_pct: f32,
    /// Minimum pages before a fingerprint is computed at all.
    pub min_pages: usize,
    /// Blocks shorter than this are never considered.
    pub min_block_chars: usize,
}

impl Default for BoilerplateParams {
    fn default() -> Self {
        Self {
            threshold_pct: 0.7,
            min_pages: 5,
            min_block_chars: 50,
        }
    }
}

/// Counters recorded with each fingerprint run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BoilerplateStats {
    pub pages_analyzed: usize,
    pub blocks_total: usize,
    pub blocks_boilerplate: usize,
    pub bytes_removed_avg: usize,
}

/// The stored fingerprint for one `(project_id, domain)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainBoilerplate {
    pub project_id: Uuid,
    pub domain: String,

    /// Truncated SHA-256 hashes of blocks judged boilerplate.
    pub hashes: Vec<String>,

    pub params: BoilerplateParams,
    pub stats: BoilerplateStats,
    pub updated_at: DateTime<Utc>,
}

impl DomainBoilerplate {
    pub fn new(project_id: Uuid, domain: impl Into<String>) -> Self {
        Self {
            project_id,
            domain: domain.into(),
            hashes: vec![],
            params: BoilerplateParams::default(),
            stats: BoilerplateStats::default(),
            updated_at: Utc::now(),
        }
    }
}
