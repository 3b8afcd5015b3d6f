//! Typed errors for the extraction core.
//!
//! Uses `thiserror` for library errors (not `anyhow`) to provide
//! strongly-typed, composable error handling.

use thiserror::Error;

/// Errors that can occur during extraction operations.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Fetch operation failed
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// LM broker failed or the request was rejected
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Source not found in store
    #[error("source not found: {id}")]
    SourceNotFound { id: uuid::Uuid },

    /// The project's extraction schema failed to compile
    #[error("invalid schema: {reason}")]
    InvalidSchema { reason: String },

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Vector store operation failed
    #[error("vector store error: {0}")]
    VectorStore(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Embedding generation failed
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Operation was cancelled at a checkpoint
    #[error("operation cancelled")]
    Cancelled,

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Configuration error
    #[error("config error: {reason}")]
    Config { reason: String },
}

/// Errors that can occur when talking to the LM broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Request stream is at capacity; upstream must defer
    #[error("LM request queue is full (depth {depth})")]
    QueueFull { depth: usize },

    /// No response arrived before the deadline
    #[error("timed out waiting for LM response {request_id}")]
    WaitTimeout { request_id: uuid::Uuid },

    /// The remote completion service failed
    #[error("LM endpoint error: {0}")]
    Endpoint(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Broker transport (stream / response bucket) failed
    #[error("broker transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Errors that can occur while fetching page content.
#[derive(Debug, Error)]
pub enum FetchError {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Per-domain rate limit or daily cap exceeded
    #[error("rate limited: {domain}")]
    RateLimited { domain: String },

    /// Invalid URL format
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// Fetch exceeded its deadline
    #[error("timeout fetching: {url}")]
    Timeout { url: String },

    /// The crawl job on the fetcher side failed
    #[error("crawl failed: {reason}")]
    CrawlFailed { reason: String },
}

/// Result type alias for extraction operations.
pub type Result<T> = std::result::Result<T, ExtractionError>;

/// Result type alias for broker operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Result type alias for fetch operations.
pub type FetchResult<T> = std::result::Result<T, FetchError>;
