//! Fetcher contract: the opaque scraping/rendering service.
//!
//! The core never talks to a browser or HTTP fetcher directly; it hands a
//! URL to a [`Fetcher`] and gets back markdown. Crawls are driven by the
//! fetcher side (it owns link discovery and depth); the core polls status
//! and collects pages.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FetchResult;

/// Options for a single-page scrape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapeOptions {
    /// Overall deadline in seconds; the fetcher's default applies when None.
    pub timeout_secs: Option<u64>,
    /// Ask the fetcher to return only the main content region.
    pub only_main_content: bool,
}

/// Result of scraping one URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedPage {
    pub content: String,
    pub status_code: u16,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Links the fetcher found on the page, when it reports them.
    #[serde(default)]
    pub discovered_urls: Vec<String>,
}

/// Parameters for starting a fetcher-driven crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlRequest {
    pub url: String,
    pub max_depth: u32,
    pub limit: u32,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// Follow links pointing at the start page from elsewhere on the site.
    #[serde(default)]
    pub backward_links: bool,
}

impl CrawlRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_depth: 2,
            limit: 100,
            include_patterns: vec![],
            exclude_patterns: vec![],
            backward_links: false,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }
}

/// Fetcher-side state of a crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlState {
    Scraping,
    Completed,
    Failed,
}

/// One page returned by a crawl status poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlPage {
    pub markdown: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl CrawlPage {
    /// The page URL from metadata, when the fetcher reported one.
    pub fn url(&self) -> Option<&str> {
        self.metadata.get("url").and_then(|v| v.as_str())
    }

    pub fn title(&self) -> Option<&str> {
        self.metadata.get("title").and_then(|v| v.as_str())
    }
}

/// Snapshot of a crawl, accumulated across polls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlStatus {
    pub state: CrawlState,
    pub total: u32,
    pub completed: u32,
    pub pages: Vec<CrawlPage>,
    #[serde(default)]
    pub error: Option<String>,
}

/// The external scraping service, behind a typed contract.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch one URL and return its markdown content.
    async fn scrape(&self, url: &str, opts: &ScrapeOptions) -> FetchResult<ScrapedPage>;

    /// Start a crawl; returns the fetcher's crawl id.
    async fn start_crawl(&self, request: &CrawlRequest) -> FetchResult<String>;

    /// Poll the state of a crawl, including pages collected so far.
    async fn get_crawl_status(&self, crawl_id: &str) -> FetchResult<CrawlStatus>;
}
