//! Application configuration loaded from environment variables.
//!
//! `Config::from_env()` reads everything once at startup; `validate()`
//! refuses to start on fatal misconfiguration. Anything tunable at
//! runtime stays on the library-level config structs this module
//! populates.

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use extraction::{
    ChunkerConfig, ClassifierConfig, DedupConfig, OrchestratorConfig, PipelineConfig,
};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,

    // LM endpoint
    pub lm_endpoint_url: String,
    pub lm_model: String,
    pub lm_api_key: String,
    pub lm_max_retries: u32,
    pub lm_request_timeout_secs: u64,
    pub lm_base_temperature: f32,
    pub lm_temperature_increment: f32,

    // LM queue (broker mode vs direct)
    pub lm_queue_enabled: bool,
    pub lm_queue_max_depth: usize,
    pub lm_queue_slow_depth: usize,
    pub lm_worker_count: usize,
    pub lm_concurrency_initial: usize,
    pub lm_concurrency_min: usize,
    pub lm_concurrency_max: usize,

    // Embeddings
    pub embedding_endpoint_url: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,

    // Fetcher
    pub fetcher_url: String,
    pub fetch_timeout_secs: u64,

    // Extraction
    pub extraction_content_limit: usize,
    pub extraction_max_concurrent_chunks: usize,
    pub classification_enabled: bool,
    pub skip_patterns_enabled: bool,
    pub classifier_high_threshold: f32,
    pub classifier_low_threshold: f32,

    // Boilerplate
    pub boilerplate_enabled: bool,
    pub boilerplate_threshold_pct: f32,
    pub boilerplate_min_pages: usize,
    pub boilerplate_min_block_chars: usize,

    // Deduplication
    pub dedup_threshold: f32,

    // Scheduler
    pub scheduler_poll_interval_secs: u64,
    pub stale_scrape_secs: u64,
    pub stale_crawl_secs: u64,
    pub stale_extract_secs: u64,
    pub stale_report_secs: u64,

    // Scrape pacing
    pub scrape_delay_min_ms: u64,
    pub scrape_delay_max_ms: u64,
    pub scrape_max_concurrent_per_domain: usize,
    pub scrape_daily_limit: u64,
    pub crawl_max_concurrent: usize,

    // Security
    pub api_key: String,

    // Logging
    pub log_level: String,
    pub log_format: String,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{name} must be a valid value, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let config = Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: var_or("REDIS_URL", "redis://localhost:6379"),

            lm_endpoint_url: env::var("LM_ENDPOINT_URL")
                .context("LM_ENDPOINT_URL must be set")?,
            lm_model: var_or("LM_MODEL", "gpt-4o-mini"),
            lm_api_key: env::var("LM_API_KEY").context("LM_API_KEY must be set")?,
            lm_max_retries: parse_var("LM_MAX_RETRIES", 3)?,
            lm_request_timeout_secs: parse_var("LM_REQUEST_TIMEOUT_SECS", 300)?,
            lm_base_temperature: parse_var("LM_BASE_TEMPERATURE", 0.1)?,
            lm_temperature_increment: parse_var("LM_TEMPERATURE_INCREMENT", 0.2)?,

            lm_queue_enabled: parse_var("LM_QUEUE_ENABLED", true)?,
            lm_queue_max_depth: parse_var("LM_QUEUE_MAX_DEPTH", 1_000)?,
            lm_queue_slow_depth: parse_var("LM_QUEUE_SLOW_DEPTH", 500)?,
            lm_worker_count: parse_var("LM_WORKER_COUNT", 1)?,
            lm_concurrency_initial: parse_var("LM_CONCURRENCY_INITIAL", 10)?,
            lm_concurrency_min: parse_var("LM_CONCURRENCY_MIN", 5)?,
            lm_concurrency_max: parse_var("LM_CONCURRENCY_MAX", 50)?,

            embedding_endpoint_url: env::var("EMBEDDING_ENDPOINT_URL")
                .context("EMBEDDING_ENDPOINT_URL must be set")?,
            embedding_model: var_or("EMBEDDING_MODEL", "text-embedding-3-small"),
            embedding_dimension: parse_var("EMBEDDING_DIMENSION", 1536)?,

            fetcher_url: env::var("FETCHER_URL").context("FETCHER_URL must be set")?,
            fetch_timeout_secs: parse_var("FETCH_TIMEOUT_SECS", 180)?,

            extraction_content_limit: parse_var("EXTRACTION_CONTENT_LIMIT", 20_000)?,
            extraction_max_concurrent_chunks: parse_var("EXTRACTION_MAX_CONCURRENT_CHUNKS", 80)?,
            classification_enabled: parse_var("CLASSIFICATION_ENABLED", true)?,
            skip_patterns_enabled: parse_var("SKIP_PATTERNS_ENABLED", false)?,
            classifier_high_threshold: parse_var("CLASSIFIER_HIGH_THRESHOLD", 0.75)?,
            classifier_low_threshold: parse_var("CLASSIFIER_LOW_THRESHOLD", 0.40)?,

            boilerplate_enabled: parse_var("BOILERPLATE_ENABLED", true)?,
            boilerplate_threshold_pct: parse_var("BOILERPLATE_THRESHOLD_PCT", 0.7)?,
            boilerplate_min_pages: parse_var("BOILERPLATE_MIN_PAGES", 5)?,
            boilerplate_min_block_chars: parse_var("BOILERPLATE_MIN_BLOCK_CHARS", 50)?,

            dedup_threshold: parse_var("DEDUP_THRESHOLD", 0.90)?,

            scheduler_poll_interval_secs: parse_var("SCHEDULER_POLL_INTERVAL_SECS", 5)?,
            stale_scrape_secs: parse_var("STALE_SCRAPE_SECS", 300)?,
            stale_crawl_secs: parse_var("STALE_CRAWL_SECS", 1_800)?,
            stale_extract_secs: parse_var("STALE_EXTRACT_SECS", 900)?,
            stale_report_secs: parse_var("STALE_REPORT_SECS", 600)?,

            scrape_delay_min_ms: parse_var("SCRAPE_DELAY_MIN_MS", 1_000)?,
            scrape_delay_max_ms: parse_var("SCRAPE_DELAY_MAX_MS", 3_000)?,
            scrape_max_concurrent_per_domain: parse_var("SCRAPE_MAX_CONCURRENT_PER_DOMAIN", 2)?,
            scrape_daily_limit: parse_var("SCRAPE_DAILY_LIMIT", 5_000)?,
            crawl_max_concurrent: parse_var("CRAWL_MAX_CONCURRENT", 6)?,

            api_key: env::var("API_KEY").context("API_KEY must be set")?,

            log_level: var_or("LOG_LEVEL", "info"),
            log_format: var_or("LOG_FORMAT", "text"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Fatal-config checks; the process refuses to start on failure.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().len() < 16 {
            bail!("API_KEY must be at least 16 characters");
        }
        if self.lm_concurrency_min == 0
            || self.lm_concurrency_min > self.lm_concurrency_max
            || self.lm_concurrency_initial < self.lm_concurrency_min
            || self.lm_concurrency_initial > self.lm_concurrency_max
        {
            bail!(
                "LM concurrency bounds are inconsistent: initial {}, min {}, max {}",
                self.lm_concurrency_initial,
                self.lm_concurrency_min,
                self.lm_concurrency_max
            );
        }
        if self.lm_worker_count == 0 {
            bail!("LM_WORKER_COUNT must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.dedup_threshold) {
            bail!("DEDUP_THRESHOLD must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.boilerplate_threshold_pct) {
            bail!("BOILERPLATE_THRESHOLD_PCT must be within [0, 1]");
        }
        if self.scrape_delay_min_ms > self.scrape_delay_max_ms {
            bail!("SCRAPE_DELAY_MIN_MS must not exceed SCRAPE_DELAY_MAX_MS");
        }
        if self.embedding_dimension == 0 {
            bail!("EMBEDDING_DIMENSION must be positive");
        }
        match self.log_format.as_str() {
            "text" | "json" => {}
            other => bail!("LOG_FORMAT must be text or json, got {other:?}"),
        }
        Ok(())
    }

    /// Pipeline tunables derived from the environment.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            domain_dedup_enabled: self.boilerplate_enabled,
            chunker: ChunkerConfig::default(),
            classifier: ClassifierConfig {
                enabled: self.classification_enabled,
                high_threshold: self.classifier_high_threshold,
                low_threshold: self.classifier_low_threshold,
                skip_patterns_enabled: self.skip_patterns_enabled,
                ..ClassifierConfig::default()
            },
            orchestrator: OrchestratorConfig {
                max_concurrent_chunks: self.extraction_max_concurrent_chunks,
                content_limit: self.extraction_content_limit,
                request_timeout_secs: self.lm_request_timeout_secs,
            },
            dedup: DedupConfig {
                enabled: true,
                threshold: self.dedup_threshold,
            },
            orphan_batch_size: 50,
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn scheduler_poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            database_url: "postgres://localhost/kx".into(),
            redis_url: "redis://localhost:6379".into(),
            lm_endpoint_url: "http://localhost:8000/v1".into(),
            lm_model: "test".into(),
            lm_api_key: "k".into(),
            lm_max_retries: 3,
            lm_request_timeout_secs: 300,
            lm_base_temperature: 0.1,
            lm_temperature_increment: 0.2,
            lm_queue_enabled: true,
            lm_queue_max_depth: 1000,
            lm_queue_slow_depth: 500,
            lm_worker_count: 1,
            lm_concurrency_initial: 10,
            lm_concurrency_min: 5,
            lm_concurrency_max: 50,
            embedding_endpoint_url: "http://localhost:8001".into(),
            embedding_model: "test".into(),
            embedding_dimension: 1536,
            fetcher_url: "http://localhost:8002".into(),
            fetch_timeout_secs: 180,
            extraction_content_limit: 20_000,
            extraction_max_concurrent_chunks: 80,
            classification_enabled: true,
            skip_patterns_enabled: false,
            classifier_high_threshold: 0.75,
            classifier_low_threshold: 0.40,
            boilerplate_enabled: true,
            boilerplate_threshold_pct: 0.7,
            boilerplate_min_pages: 5,
            boilerplate_min_block_chars: 50,
            dedup_threshold: 0.90,
            scheduler_poll_interval_secs: 5,
            stale_scrape_secs: 300,
            stale_crawl_secs: 1800,
            stale_extract_secs: 900,
            stale_report_secs: 600,
            scrape_delay_min_ms: 1000,
            scrape_delay_max_ms: 3000,
            scrape_max_concurrent_per_domain: 2,
            scrape_daily_limit: 5000,
            crawl_max_concurrent: 6,
            api_key: "0123456789abcdef".into(),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }

    #[test]
    fn test_validate_accepts_sample() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_short_api_key_rejected() {
        let mut config = sample();
        config.api_key = "short".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inconsistent_concurrency_rejected() {
        let mut config = sample();
        config.lm_concurrency_min = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let mut config = sample();
        config.dedup_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_log_format_rejected() {
        let mut config = sample();
        config.log_format = "xml".into();
        assert!(config.validate().is_err());
    }
}
