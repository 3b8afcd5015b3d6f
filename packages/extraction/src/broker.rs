//! LM broker client contract and the queue-disabled direct client.
//!
//! The broker decouples extraction from inference: callers submit an
//! [`LmRequest`] and poll for the [`LmResponse`] by id. The Redis-backed
//! stream implementation lives in the server crate; [`DirectLmBroker`]
//! here executes against an [`LmEndpoint`] inline for deployments that
//! run without a queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{BrokerError, BrokerResult};
use crate::traits::lm::{ChatMessage, CompletionOptions, LmEndpoint};

/// What kind of work an LM request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LmRequestType {
    ExtractFacts,
    ExtractFieldGroup,
    ExtractEntities,
    Complete,
}

/// A stream-resident LM request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmRequest {
    pub request_id: Uuid,
    pub request_type: LmRequestType,
    pub messages: Vec<ChatMessage>,

    /// Request-type specific context carried through to the response
    /// consumer (e.g. group name, chunk index).
    #[serde(default)]
    pub payload: Value,

    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl LmRequest {
    /// Create a request with the given deadline from now.
    pub fn new(
        request_type: LmRequestType,
        messages: Vec<ChatMessage>,
        timeout: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id: Uuid::new_v4(),
            request_type,
            messages,
            payload: Value::Null,
            priority: 0,
            created_at: now,
            timeout_at: now
                + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(300)),
            retry_count: 0,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Whether the request's deadline has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.timeout_at
    }
}

/// Terminal state of an LM request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LmResponseStatus {
    Success,
    Error,
    Timeout,
}

/// A KV-resident LM response; TTL-bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmResponse {
    pub request_id: Uuid,
    pub status: LmResponseStatus,

    /// Raw completion text on success.
    #[serde(default)]
    pub result: Option<String>,

    #[serde(default)]
    pub error: Option<String>,

    pub processing_time_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl LmResponse {
    pub fn success(request_id: Uuid, result: String, elapsed: Duration) -> Self {
        Self {
            request_id,
            status: LmResponseStatus::Success,
            result: Some(result),
            error: None,
            processing_time_ms: elapsed.as_millis() as u64,
            completed_at: Utc::now(),
        }
    }

    pub fn error(request_id: Uuid, error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            request_id,
            status: LmResponseStatus::Error,
            result: None,
            error: Some(error.into()),
            processing_time_ms: elapsed.as_millis() as u64,
            completed_at: Utc::now(),
        }
    }

    pub fn timeout(request_id: Uuid) -> Self {
        Self {
            request_id,
            status: LmResponseStatus::Timeout,
            result: None,
            error: Some("request expired before execution".into()),
            processing_time_ms: 0,
            completed_at: Utc::now(),
        }
    }
}

/// Queue health as seen by producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressureStatus {
    #[default]
    Ok,
    Slow,
    Full,
}

/// Client contract to the request stream.
///
/// The client acts on the first response it reads for a request id and
/// ignores duplicates, giving at-most-once completion from its point of
/// view even though delivery underneath is at-least-once.
#[async_trait]
pub trait LmBroker: Send + Sync {
    /// Enqueue a request; fails with `QueueFull` above max depth.
    async fn submit(&self, request: LmRequest) -> BrokerResult<Uuid>;

    /// Poll for the response until `timeout`; a `Timeout`-status response
    /// is returned on expiry.
    async fn wait(&self, request_id: Uuid, timeout: Duration) -> BrokerResult<LmResponse>;

    /// Current queue health.
    async fn backpressure_status(&self) -> BrokerResult<BackpressureStatus>;

    /// Submit and wait in one call.
    async fn execute(&self, request: LmRequest, timeout: Duration) -> BrokerResult<LmResponse> {
        let request_id = self.submit(request).await?;
        self.wait(request_id, timeout).await
    }
}

/// Retry/sampling schedule shared by the direct client and the stream
/// workers: attempt k runs at `base + (k-1) * increment`.
#[derive(Debug, Clone, Copy)]
pub struct TemperatureSchedule {
    pub base: f32,
    pub increment: f32,
}

impl Default for TemperatureSchedule {
    fn default() -> Self {
        Self {
            base: 0.1,
            increment: 0.2,
        }
    }
}

impl TemperatureSchedule {
    /// Temperature for a 1-based attempt number.
    pub fn for_attempt(&self, attempt: u32) -> f32 {
        self.base + self.increment * attempt.saturating_sub(1) as f32
    }
}

/// Queue-disabled broker: executes completions inline against the
/// endpoint with bounded retries.
pub struct DirectLmBroker {
    endpoint: Arc<dyn LmEndpoint>,
    max_retries: u32,
    schedule: TemperatureSchedule,
    max_tokens: u32,
}

impl DirectLmBroker {
    pub fn new(endpoint: Arc<dyn LmEndpoint>) -> Self {
        Self {
            endpoint,
            max_retries: 3,
            schedule: TemperatureSchedule::default(),
            max_tokens: 4096,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_schedule(mut self, schedule: TemperatureSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    async fn run(&self, request: &LmRequest) -> LmResponse {
        let started = std::time::Instant::now();
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            let opts = CompletionOptions {
                json_mode: true,
                temperature: self.schedule.for_attempt(attempt),
                max_tokens: self.max_tokens,
            };
            match self.endpoint.complete(&request.messages, &opts).await {
                Ok(completion) => {
                    return LmResponse::success(
                        request.request_id,
                        completion.content,
                        started.elapsed(),
                    );
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        request_id = %request.request_id,
                        attempt,
                        error = %last_error,
                        "LM completion attempt failed"
                    );
                }
            }
        }

        LmResponse::error(request.request_id, last_error, started.elapsed())
    }
}

#[async_trait]
impl LmBroker for DirectLmBroker {
    async fn submit(&self, _request: LmRequest) -> BrokerResult<Uuid> {
        // Direct mode has no queue to park requests in; callers use
        // `execute` which runs the completion inline.
        Err(BrokerError::Transport(
            "direct broker does not support detached submit; use execute".into(),
        ))
    }

    async fn wait(&self, request_id: Uuid, _timeout: Duration) -> BrokerResult<LmResponse> {
        Err(BrokerError::WaitTimeout { request_id })
    }

    async fn backpressure_status(&self) -> BrokerResult<BackpressureStatus> {
        Ok(BackpressureStatus::Ok)
    }

    async fn execute(&self, request: LmRequest, _timeout: Duration) -> BrokerResult<LmResponse> {
        if request.is_expired(Utc::now()) {
            return Ok(LmResponse::timeout(request.request_id));
        }
        Ok(self.run(&request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::lm::Completion;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyEndpoint {
        fail_first: u32,
        calls: AtomicU32,
        temperatures: std::sync::Mutex<Vec<f32>>,
    }

    #[async_trait]
    impl LmEndpoint for FlakyEndpoint {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            opts: &CompletionOptions,
        ) -> BrokerResult<Completion> {
            self.temperatures.lock().unwrap().push(opts.temperature);
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(BrokerError::Endpoint("boom".into()));
            }
            Ok(Completion {
                content: "{\"ok\":true}".into(),
                prompt_tokens: 10,
                completion_tokens: 5,
            })
        }
    }

    fn request() -> LmRequest {
        LmRequest::new(
            LmRequestType::Complete,
            vec![ChatMessage::user("hi")],
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn test_direct_retries_with_rising_temperature() {
        let endpoint = Arc::new(FlakyEndpoint {
            fail_first: 2,
            calls: AtomicU32::new(0),
            temperatures: std::sync::Mutex::new(vec![]),
        });
        let broker = DirectLmBroker::new(endpoint.clone());

        let response = broker
            .execute(request(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.status, LmResponseStatus::Success);

        let temps = endpoint.temperatures.lock().unwrap().clone();
        assert_eq!(temps.len(), 3);
        assert!(temps[0] < temps[1] && temps[1] < temps[2]);
    }

    #[tokio::test]
    async fn test_direct_exhausts_retries() {
        let endpoint = Arc::new(FlakyEndpoint {
            fail_first: 99,
            calls: AtomicU32::new(0),
            temperatures: std::sync::Mutex::new(vec![]),
        });
        let broker = DirectLmBroker::new(endpoint);

        let response = broker
            .execute(request(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.status, LmResponseStatus::Error);
    }

    #[tokio::test]
    async fn test_expired_request_short_circuits() {
        let endpoint = Arc::new(FlakyEndpoint {
            fail_first: 0,
            calls: AtomicU32::new(0),
            temperatures: std::sync::Mutex::new(vec![]),
        });
        let broker = DirectLmBroker::new(endpoint.clone());

        let mut req = request();
        req.timeout_at = Utc::now() - chrono::Duration::seconds(1);
        let response = broker.execute(req, Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.status, LmResponseStatus::Timeout);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_temperature_schedule() {
        let s = TemperatureSchedule {
            base: 0.1,
            increment: 0.25,
        };
        assert!((s.for_attempt(1) - 0.1).abs() < f32::EPSILON);
        assert!((s.for_attempt(3) - 0.6).abs() < f32::EPSILON);
    }
}
