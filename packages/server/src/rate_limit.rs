//! Per-domain scrape pacing: randomized delay, a concurrency cap, and a
//! daily budget.
//!
//! The delay uses a keyed governor limiter with jitter between the
//! configured min and max; concurrency is a semaphore per domain; the
//! daily budget is a Redis counter keyed `ratelimit:{domain}:{yyyymmdd}`
//! so every worker process shares it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Jitter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use extraction::FetchError;

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub delay_min: Duration,
    pub delay_max: Duration,
    pub max_concurrent_per_domain: usize,
    pub daily_limit: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            delay_min: Duration::from_millis(1_000),
            delay_max: Duration::from_millis(3_000),
            max_concurrent_per_domain: 2,
            daily_limit: 5_000,
        }
    }
}

/// Held for the duration of one fetch; releasing it frees the domain
/// concurrency slot.
pub struct DomainPermit {
    _permit: OwnedSemaphorePermit,
}

pub struct DomainRateLimiter {
    limiter: KeyedLimiter,
    jitter: Jitter,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    redis: ConnectionManager,
    config: RateLimitConfig,
}

impl DomainRateLimiter {
    pub fn new(redis: ConnectionManager, config: RateLimitConfig) -> Self {
        let min = config.delay_min.max(Duration::from_millis(1));
        let quota =
            Quota::with_period(min).unwrap_or_else(|| Quota::per_second(nonzero!(1u32)));
        let spread = config.delay_max.saturating_sub(config.delay_min);
        Self {
            limiter: RateLimiter::keyed(quota),
            jitter: Jitter::new(Duration::ZERO, spread.max(Duration::from_millis(1))),
            semaphores: Mutex::new(HashMap::new()),
            redis,
            config,
        }
    }

    /// Block until the domain may be fetched; errors when the daily cap
    /// is spent.
    pub async fn acquire(&self, domain: &str) -> Result<DomainPermit, FetchError> {
        self.check_daily_budget(domain).await?;

        let semaphore = {
            let mut semaphores = self.semaphores.lock().expect("limiter poisoned");
            semaphores
                .entry(domain.to_string())
                .or_insert_with(|| {
                    Arc::new(Semaphore::new(self.config.max_concurrent_per_domain.max(1)))
                })
                .clone()
        };
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| FetchError::RateLimited {
                domain: domain.to_string(),
            })?;

        self.limiter
            .until_key_ready_with_jitter(&domain.to_string(), self.jitter)
            .await;

        Ok(DomainPermit { _permit: permit })
    }

    async fn check_daily_budget(&self, domain: &str) -> Result<(), FetchError> {
        let window = chrono::Utc::now().format("%Y%m%d");
        let key = format!("ratelimit:{domain}:{window}");
        let mut con = self.redis.clone();

        let count: u64 = con.incr(&key, 1u64).await.map_err(|e| {
            FetchError::Http(Box::new(e))
        })?;
        if count == 1 {
            // Two days covers any window straddling; the key is dated so
            // a missed expiry cannot leak budget across days.
            let _: Result<(), _> = con.expire(&key, 172_800).await;
        }
        if count > self.config.daily_limit {
            tracing::warn!(domain, count, limit = self.config.daily_limit, "daily cap hit");
            return Err(FetchError::RateLimited {
                domain: domain.to_string(),
            });
        }
        Ok(())
    }
}
