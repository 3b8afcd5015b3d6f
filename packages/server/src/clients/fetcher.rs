//! HTTP client for the external scraping service.
//!
//! The service owns rendering, link discovery, and crawl depth; this
//! client only maps its API onto the core [`Fetcher`] contract.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use extraction::{
    CrawlPage, CrawlRequest, CrawlState, CrawlStatus, FetchError, Fetcher, ScrapeOptions,
    ScrapedPage,
};

pub struct FetcherHttpClient {
    client: Client,
    base_url: String,
    default_timeout: Duration,
}

// Request/Response types for the fetcher API

#[derive(Serialize)]
struct ScrapeBody<'a> {
    url: &'a str,
    #[serde(rename = "onlyMainContent")]
    only_main_content: bool,
    #[serde(rename = "timeoutMs", skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
}

#[derive(Deserialize)]
struct ScrapeReply {
    content: Option<String>,
    status_code: Option<u16>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
    #[serde(default)]
    discovered_urls: Vec<String>,
    error: Option<String>,
}

#[derive(Serialize)]
struct CrawlBody<'a> {
    url: &'a str,
    #[serde(rename = "maxDepth")]
    max_depth: u32,
    limit: u32,
    #[serde(rename = "includePatterns")]
    include_patterns: &'a [String],
    #[serde(rename = "excludePatterns")]
    exclude_patterns: &'a [String],
    #[serde(rename = "backwardLinks")]
    backward_links: bool,
}

#[derive(Deserialize)]
struct CrawlStartReply {
    crawl_id: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct CrawlStatusReply {
    status: String,
    #[serde(default)]
    total: u32,
    #[serde(default)]
    completed: u32,
    #[serde(default)]
    pages: Vec<CrawlPageReply>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct CrawlPageReply {
    markdown: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

impl FetcherHttpClient {
    pub fn new(base_url: impl Into<String>, default_timeout: Duration) -> Result<Self, FetchError> {
        // The HTTP deadline sits above the fetch deadline so slow pages
        // surface as fetcher timeouts, not transport errors.
        let client = Client::builder()
            .timeout(default_timeout + Duration::from_secs(30))
            .build()
            .map_err(|e| FetchError::Http(Box::new(e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_timeout,
        })
    }

    async fn post<T: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        body: &T,
    ) -> Result<R, FetchError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| FetchError::Http(Box::new(e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(FetchError::Http(
                format!("fetcher error: {status} - {text}").into(),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| FetchError::Http(Box::new(e)))
    }

    async fn get<R: for<'de> Deserialize<'de>>(&self, endpoint: &str) -> Result<R, FetchError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::Http(Box::new(e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(FetchError::Http(
                format!("fetcher error: {status} - {text}").into(),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| FetchError::Http(Box::new(e)))
    }
}

#[async_trait]
impl Fetcher for FetcherHttpClient {
    async fn scrape(&self, url: &str, opts: &ScrapeOptions) -> Result<ScrapedPage, FetchError> {
        let timeout = opts
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let body = ScrapeBody {
            url,
            only_main_content: opts.only_main_content,
            timeout_ms: Some(timeout.as_millis() as u64),
        };

        let reply: ScrapeReply = self.post("/scrape", &body).await?;
        if let Some(error) = reply.error {
            if error.contains("timeout") {
                return Err(FetchError::Timeout {
                    url: url.to_string(),
                });
            }
            return Err(FetchError::Http(error.into()));
        }
        Ok(ScrapedPage {
            content: reply.content.unwrap_or_default(),
            status_code: reply.status_code.unwrap_or(200),
            metadata: reply.metadata,
            discovered_urls: reply.discovered_urls,
        })
    }

    async fn start_crawl(&self, request: &CrawlRequest) -> Result<String, FetchError> {
        let body = CrawlBody {
            url: &request.url,
            max_depth: request.max_depth,
            limit: request.limit,
            include_patterns: &request.include_patterns,
            exclude_patterns: &request.exclude_patterns,
            backward_links: request.backward_links,
        };
        let reply: CrawlStartReply = self.post("/crawl", &body).await?;
        match reply.crawl_id {
            Some(crawl_id) => Ok(crawl_id),
            None => Err(FetchError::CrawlFailed {
                reason: reply.error.unwrap_or_else(|| "no crawl id returned".into()),
            }),
        }
    }

    async fn get_crawl_status(&self, crawl_id: &str) -> Result<CrawlStatus, FetchError> {
        let reply: CrawlStatusReply = self.get(&format!("/crawl/{crawl_id}")).await?;
        let state = match reply.status.as_str() {
            "completed" => CrawlState::Completed,
            "failed" => CrawlState::Failed,
            _ => CrawlState::Scraping,
        };
        Ok(CrawlStatus {
            state,
            total: reply.total,
            completed: reply.completed,
            pages: reply
                .pages
                .into_iter()
                .map(|p| CrawlPage {
                    markdown: p.markdown.unwrap_or_default(),
                    metadata: p.metadata,
                })
                .collect(),
            error: reply.error,
        })
    }
}
