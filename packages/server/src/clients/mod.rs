//! HTTP clients for the external LM, embedding, and fetcher services.

pub mod embedder;
pub mod fetcher;
pub mod lm;

pub use embedder::EmbeddingHttpClient;
pub use fetcher::FetcherHttpClient;
pub use lm::LmHttpClient;
