//! LM endpoint contract: a remote completion service.
//!
//! The endpoint accepts chat messages and returns text that is expected
//! (but not guaranteed) to be JSON. Parsing and repair are the caller's
//! responsibility.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BrokerResult;

/// One chat message in a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Sampling and output controls for one completion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CompletionOptions {
    /// Ask the endpoint for strict-JSON output mode.
    pub json_mode: bool,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            json_mode: true,
            temperature: 0.1,
            max_tokens: 4096,
        }
    }
}

/// A finished completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// The remote completion service.
///
/// Implementations raise on network errors and 5xx responses; they never
/// attempt to parse the model's output.
#[async_trait]
pub trait LmEndpoint: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        opts: &CompletionOptions,
    ) -> BrokerResult<Completion>;
}
