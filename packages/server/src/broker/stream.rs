//! Redis-stream LM broker: request stream, response bucket, backpressure.
//!
//! Requests land on the capped stream `llm:requests` and are consumed by
//! the worker pool through a consumer group. Responses come back through
//! per-request keys `llm:response:{uuid}` with a TTL; the client polls
//! until its deadline and acts on the first response it reads.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use extraction::{
    BackpressureStatus, BrokerError, LmBroker, LmRequest, LmResponse,
};

/// Stream and bucket layout plus depth thresholds.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub stream_key: String,
    pub group: String,
    pub dlq_key: String,
    /// Approximate stream cap (XADD MAXLEN ~).
    pub stream_maxlen: usize,
    /// `submit` rejects above this depth.
    pub max_queue_depth: usize,
    /// `backpressure_status` reports Slow above this depth.
    pub slow_queue_depth: usize,
    pub response_ttl_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream_key: "llm:requests".into(),
            group: "llm-workers".into(),
            dlq_key: "llm:dlq".into(),
            stream_maxlen: 2_000,
            max_queue_depth: 1_000,
            slow_queue_depth: 500,
            response_ttl_secs: 300,
            poll_interval_ms: 100,
        }
    }
}

impl StreamConfig {
    pub fn response_key(&self, request_id: Uuid) -> String {
        format!("llm:response:{request_id}")
    }
}

pub struct RedisLmBroker {
    redis: ConnectionManager,
    config: StreamConfig,
}

impl RedisLmBroker {
    pub fn new(redis: ConnectionManager, config: StreamConfig) -> Self {
        Self { redis, config }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    async fn depth(&self) -> Result<usize, BrokerError> {
        let mut con = self.redis.clone();
        con.xlen(&self.config.stream_key)
            .await
            .map_err(transport)
    }
}

fn transport(e: redis::RedisError) -> BrokerError {
    BrokerError::Transport(Box::new(e))
}

#[async_trait]
impl LmBroker for RedisLmBroker {
    async fn submit(&self, request: LmRequest) -> Result<Uuid, BrokerError> {
        let depth = self.depth().await?;
        if depth > self.config.max_queue_depth {
            return Err(BrokerError::QueueFull { depth });
        }

        let body = serde_json::to_string(&request)
            .map_err(|e| BrokerError::Transport(Box::new(e)))?;
        let mut con = self.redis.clone();
        let _: String = redis::cmd("XADD")
            .arg(&self.config.stream_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.stream_maxlen)
            .arg("*")
            .arg("body")
            .arg(body)
            .query_async(&mut con)
            .await
            .map_err(transport)?;

        tracing::debug!(request_id = %request.request_id, depth, "LM request submitted");
        Ok(request.request_id)
    }

    async fn wait(
        &self,
        request_id: Uuid,
        timeout: Duration,
    ) -> Result<LmResponse, BrokerError> {
        let key = self.config.response_key(request_id);
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let mut con = self.redis.clone();
            let raw: Option<String> = con.get(&key).await.map_err(transport)?;
            if let Some(raw) = raw {
                let response: LmResponse = serde_json::from_str(&raw)
                    .map_err(|e| BrokerError::Transport(Box::new(e)))?;
                return Ok(response);
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(request_id = %request_id, "wait deadline reached");
                return Ok(LmResponse::timeout(request_id));
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn backpressure_status(&self) -> Result<BackpressureStatus, BrokerError> {
        let depth = self.depth().await?;
        Ok(if depth > self.config.max_queue_depth {
            BackpressureStatus::Full
        } else if depth > self.config.slow_queue_depth {
            BackpressureStatus::Slow
        } else {
            BackpressureStatus::Ok
        })
    }
}
