//! LM worker pool: consumes the request stream, executes completions,
//! and adapts its concurrency to observed timeout rates.
//!
//! Each batch read claims up to the current concurrency; entries whose
//! deadline already passed get a timeout response without touching the
//! endpoint. Failed attempts are re-enqueued with a bumped retry count
//! (and a hotter temperature); after the retry budget the request goes
//! to the dead-letter list with its full context.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use extraction::{
    CompletionOptions, LmEndpoint, LmRequest, LmResponse, TemperatureSchedule,
};

use super::stream::StreamConfig;

/// Pool tuning; concurrency bounds per the adaptive controller.
#[derive(Debug, Clone)]
pub struct LmWorkerConfig {
    pub consumer: String,
    pub initial_concurrency: usize,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub schedule: TemperatureSchedule,
    pub max_tokens: u32,
    /// Pending entries idle longer than this are claimed from dead
    /// consumers.
    pub claim_min_idle: Duration,
    /// Stats window for concurrency adjustment.
    pub adjust_interval: Duration,
}

impl Default for LmWorkerConfig {
    fn default() -> Self {
        Self {
            consumer: format!("lm-worker-{}", uuid::Uuid::new_v4()),
            initial_concurrency: 10,
            min_concurrency: 5,
            max_concurrency: 50,
            max_retries: 3,
            schedule: TemperatureSchedule::default(),
            max_tokens: 4096,
            claim_min_idle: Duration::from_secs(60),
            adjust_interval: Duration::from_secs(10),
        }
    }
}

/// Interval counters feeding the adaptive controller.
#[derive(Default)]
struct IntervalStats {
    successes: AtomicU64,
    timeouts: AtomicU64,
}

impl IntervalStats {
    fn take(&self) -> (u64, u64) {
        (
            self.successes.swap(0, Ordering::SeqCst),
            self.timeouts.swap(0, Ordering::SeqCst),
        )
    }
}

pub struct LmWorkerPool {
    redis: ConnectionManager,
    endpoint: Arc<dyn LmEndpoint>,
    stream: StreamConfig,
    config: LmWorkerConfig,
    concurrency: AtomicUsize,
    stats: IntervalStats,
}

impl LmWorkerPool {
    pub fn new(
        redis: ConnectionManager,
        endpoint: Arc<dyn LmEndpoint>,
        stream: StreamConfig,
        config: LmWorkerConfig,
    ) -> Self {
        let concurrency = config
            .initial_concurrency
            .clamp(config.min_concurrency, config.max_concurrency);
        Self {
            redis,
            endpoint,
            stream,
            config,
            concurrency: AtomicUsize::new(concurrency),
            stats: IntervalStats::default(),
        }
    }

    pub fn current_concurrency(&self) -> usize {
        self.concurrency.load(Ordering::SeqCst)
    }

    /// Run until shutdown: read, execute, adjust.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if let Err(e) = self.ensure_group().await {
            warn!(error = %e, "consumer group setup failed");
        }

        let adjuster = {
            let pool = self.clone();
            let token = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(pool.config.adjust_interval) => pool.adjust_concurrency(),
                        _ = token.cancelled() => break,
                    }
                }
            })
        };

        info!(
            consumer = %self.config.consumer,
            concurrency = self.current_concurrency(),
            "LM worker started"
        );
        while !shutdown.is_cancelled() {
            match self.read_batch().await {
                Ok(entries) if entries.is_empty() => {
                    // Blocking read already waited; nothing pending.
                    if let Err(e) = self.claim_stalled().await {
                        debug!(error = %e, "pending-claim pass failed");
                    }
                }
                Ok(entries) => {
                    join_all(entries.into_iter().map(|(id, request)| {
                        let pool = self.clone();
                        async move { pool.handle_entry(id, request).await }
                    }))
                    .await;
                }
                Err(e) => {
                    warn!(error = %e, "stream read failed");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        let _ = adjuster.await;
        info!(consumer = %self.config.consumer, "LM worker stopped");
    }

    async fn ensure_group(&self) -> anyhow::Result<()> {
        let mut con = self.redis.clone();
        let created: redis::RedisResult<()> = con
            .xgroup_create_mkstream(&self.stream.stream_key, &self.stream.group, "$")
            .await;
        match created {
            Ok(()) => Ok(()),
            // BUSYGROUP: the group already exists, which is fine.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_batch(&self) -> anyhow::Result<Vec<(String, LmRequest)>> {
        let count = self.current_concurrency();
        let opts = StreamReadOptions::default()
            .group(&self.stream.group, &self.config.consumer)
            .count(count)
            .block(1_000);

        let mut con = self.redis.clone();
        let reply: StreamReadReply = con
            .xread_options(&[&self.stream.stream_key], &[">"], &opts)
            .await?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                match decode_entry(&id) {
                    Some(request) => entries.push((id.id.clone(), request)),
                    None => {
                        warn!(entry = %id.id, "undecodable stream entry; acking");
                        self.ack(&id.id).await;
                    }
                }
            }
        }
        Ok(entries)
    }

    /// Claim entries abandoned by dead consumers.
    async fn claim_stalled(&self) -> anyhow::Result<()> {
        let mut con = self.redis.clone();
        let pending: redis::streams::StreamPendingCountReply = con
            .xpending_count(
                &self.stream.stream_key,
                &self.stream.group,
                "-",
                "+",
                self.current_concurrency(),
            )
            .await?;

        let min_idle_ms = self.config.claim_min_idle.as_millis() as usize;
        let stalled: Vec<String> = pending
            .ids
            .iter()
            .filter(|p| p.last_delivered_ms >= min_idle_ms)
            .map(|p| p.id.clone())
            .collect();
        if stalled.is_empty() {
            return Ok(());
        }

        let claimed: redis::streams::StreamClaimReply = con
            .xclaim(
                &self.stream.stream_key,
                &self.stream.group,
                &self.config.consumer,
                self.config.claim_min_idle.as_millis() as usize,
                &stalled,
            )
            .await?;

        for id in claimed.ids {
            match decode_entry(&id) {
                Some(request) => self.handle_entry(id.id.clone(), request).await,
                None => self.ack(&id.id).await,
            }
        }
        Ok(())
    }

    async fn handle_entry(&self, entry_id: String, request: LmRequest) {
        let request_id = request.request_id;

        if request.is_expired(Utc::now()) {
            self.stats.timeouts.fetch_add(1, Ordering::SeqCst);
            self.write_response(&LmResponse::timeout(request_id)).await;
            self.ack(&entry_id).await;
            return;
        }

        let attempt = request.retry_count + 1;
        let opts = CompletionOptions {
            json_mode: true,
            temperature: self.config.schedule.for_attempt(attempt),
            max_tokens: self.config.max_tokens,
        };

        let started = std::time::Instant::now();
        let result = self.endpoint.complete(&request.messages, &opts).await;

        match result {
            Ok(completion) => {
                // The orchestrator owns JSON repair; the worker only
                // checks that the output is JSON at all so retries get a
                // hotter temperature.
                if serde_json::from_str::<serde_json::Value>(&completion.content).is_ok()
                    || extraction::parse_or_repair(&completion.content).is_some()
                {
                    self.stats.successes.fetch_add(1, Ordering::SeqCst);
                    self.write_response(&LmResponse::success(
                        request_id,
                        completion.content,
                        started.elapsed(),
                    ))
                    .await;
                    self.ack(&entry_id).await;
                } else {
                    self.retry_or_dead_letter(
                        entry_id,
                        request,
                        "completion was not JSON",
                        started.elapsed(),
                    )
                    .await;
                }
            }
            Err(e) => {
                self.retry_or_dead_letter(entry_id, request, &e.to_string(), started.elapsed())
                    .await;
            }
        }
    }

    async fn retry_or_dead_letter(
        &self,
        entry_id: String,
        mut request: LmRequest,
        error: &str,
        elapsed: Duration,
    ) {
        if request.retry_count + 1 >= self.config.max_retries {
            warn!(
                request_id = %request.request_id,
                retries = request.retry_count,
                error,
                "request exhausted retries; dead-lettering"
            );
            self.write_response(&LmResponse::error(request.request_id, error, elapsed))
                .await;

            let context = serde_json::json!({
                "request": request,
                "error": error,
                "dead_lettered_at": Utc::now(),
            });
            let mut con = self.redis.clone();
            let pushed: redis::RedisResult<()> = con
                .lpush(&self.stream.dlq_key, context.to_string())
                .await;
            if let Err(e) = pushed {
                warn!(error = %e, "DLQ push failed");
            }
            self.ack(&entry_id).await;
            return;
        }

        debug!(
            request_id = %request.request_id,
            attempt = request.retry_count + 1,
            error,
            "re-enqueueing failed request"
        );
        request.retry_count += 1;
        let body = match serde_json::to_string(&request) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "cannot re-serialize request; dropping");
                self.ack(&entry_id).await;
                return;
            }
        };
        let mut con = self.redis.clone();
        let readded: redis::RedisResult<String> = redis::cmd("XADD")
            .arg(&self.stream.stream_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.stream.stream_maxlen)
            .arg("*")
            .arg("body")
            .arg(body)
            .query_async(&mut con)
            .await;
        if let Err(e) = readded {
            warn!(error = %e, "re-enqueue failed; leaving entry pending");
            return;
        }
        self.ack(&entry_id).await;
    }

    async fn write_response(&self, response: &LmResponse) {
        let key = self.stream.response_key(response.request_id);
        let body = match serde_json::to_string(response) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "cannot serialize response");
                return;
            }
        };
        let mut con = self.redis.clone();
        let written: redis::RedisResult<()> = con
            .set_ex(&key, body, self.stream.response_ttl_secs)
            .await;
        if let Err(e) = written {
            warn!(request_id = %response.request_id, error = %e, "response write failed");
        }
    }

    async fn ack(&self, entry_id: &str) {
        let mut con = self.redis.clone();
        let acked: redis::RedisResult<()> = con
            .xack(&self.stream.stream_key, &self.stream.group, &[entry_id])
            .await;
        if let Err(e) = acked {
            warn!(entry = %entry_id, error = %e, "ack failed");
        }
    }

    /// Shrink on a high timeout rate, grow cautiously when healthy.
    fn adjust_concurrency(&self) {
        let (successes, timeouts) = self.stats.take();
        let total = successes + timeouts;
        if total == 0 {
            return;
        }
        let timeout_rate = timeouts as f64 / total as f64;
        let current = self.current_concurrency();

        let next = if timeout_rate > 0.10 {
            ((current as f64 * 0.7).floor() as usize).max(self.config.min_concurrency)
        } else if timeout_rate < 0.02 && successes > 50 {
            ((current as f64 * 1.2).floor() as usize).min(self.config.max_concurrency)
        } else {
            current
        };

        if next != current {
            info!(
                from = current,
                to = next,
                timeout_rate,
                successes,
                timeouts,
                "adjusted LM concurrency"
            );
            self.concurrency.store(next, Ordering::SeqCst);
        }
    }
}

fn decode_entry(id: &StreamId) -> Option<LmRequest> {
    let raw = id.map.get("body")?;
    let body: String = redis::from_redis_value(raw).ok()?;
    serde_json::from_str(&body).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adaptive_arithmetic() {
        // The controller math, checked directly.
        let shrink = |c: usize, min: usize| ((c as f64 * 0.7).floor() as usize).max(min);
        let grow = |c: usize, max: usize| ((c as f64 * 1.2).floor() as usize).min(max);

        assert_eq!(shrink(50, 5), 35);
        assert_eq!(shrink(7, 5), 5); // floor(4.9) clamped to min
        assert_eq!(grow(10, 50), 12);
        assert_eq!(grow(49, 50), 50);
        assert_eq!(grow(5, 50), 6);
    }

    #[test]
    fn test_interval_stats_swap() {
        let stats = IntervalStats::default();
        stats.successes.fetch_add(60, Ordering::SeqCst);
        stats.timeouts.fetch_add(2, Ordering::SeqCst);
        assert_eq!(stats.take(), (60, 2));
        assert_eq!(stats.take(), (0, 0));
    }
}
