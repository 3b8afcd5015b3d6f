//! OpenAI-compatible embeddings client using direct HTTP calls.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use extraction::{EmbeddingService, ExtractionError};

pub struct EmbeddingHttpClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl EmbeddingHttpClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimension: usize,
    ) -> Result<Self, ExtractionError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ExtractionError::Embedding(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            dimension,
        })
    }

    async fn request(&self, input: &[&str]) -> Result<Vec<Vec<f32>>, ExtractionError> {
        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&EmbeddingRequest {
                model: &self.model,
                input,
            })
            .send()
            .await
            .map_err(|e| ExtractionError::Embedding(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Embedding(format!(
                "embedding endpoint error: {status} - {text}"
            )));
        }

        let mut body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ExtractionError::Embedding(e.to_string()))?;

        // The API may reorder; indexes restore input order.
        body.data.sort_by_key(|d| d.index);
        if body.data.len() != input.len() {
            return Err(ExtractionError::Embedding(format!(
                "expected {} embeddings, got {}",
                input.len(),
                body.data.len()
            )));
        }
        for datum in &body.data {
            if datum.embedding.len() != self.dimension {
                return Err(ExtractionError::Embedding(format!(
                    "embedding dimension {} does not match configured {}",
                    datum.embedding.len(),
                    self.dimension
                )));
            }
        }
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingService for EmbeddingHttpClient {
    async fn embed(&self, text: &str) -> extraction::error::Result<Vec<f32>> {
        let mut vectors = self.request(&[text]).await?;
        Ok(vectors.remove(0))
    }

    async fn embed_batch(&self, texts: &[&str]) -> extraction::error::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        Ok(self.request(texts).await?)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
