// =====================================================================================
// RATE LIMITING WITH LAZY TOKEN BUCKETS
// =====================================================================================

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::WebhookError;

const MAX_TRACKED_CLIENTS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Burst size.
    pub capacity: u32,
    pub refill_per_second: f64,
}

impl RateLimitConfig {
    pub fn per_second(requests: u32) -> Self {
        Self {
            capacity: requests.max(1),
            refill_per_second: requests.max(1) as f64,
        }
    }

    pub fn per_minute(requests: u32) -> Self {
        Self {
            capacity: requests.max(1),
            refill_per_second: requests.max(1) as f64 / 60.0,
        }
    }

    fn full_refill_time(&self) -> Duration {
        Duration::from_secs_f64(self.capacity as f64 / self.refill_per_second)
    }
}

#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: config.capacity as f64,
            last_refill: now,
        }
    }

    /// Refills for the time elapsed since the last check, then takes one
    /// token. On failure returns how long until a token is available.
    pub fn try_acquire(&mut self, config: &RateLimitConfig, now: Instant) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_per_second).min(config.capacity as f64);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(missing / config.refill_per_second))
        }
    }

    pub fn available(&self) -> u32 {
        self.tokens.floor() as u32
    }
}

#[derive(Debug)]
pub struct TokenBucketRateLimiter {
    name: &'static str,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    config: RateLimitConfig,
}

impl TokenBucketRateLimiter {
    pub fn new(name: &'static str, config: RateLimitConfig) -> Self {
        Self {
            name,
            buckets: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub async fn check_rate_limit(&self, client_id: &str) -> Result<(), WebhookError> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;

        if buckets.len() >= MAX_TRACKED_CLIENTS && !buckets.contains_key(client_id) {
            self.prune_idle(&mut buckets, now);
        }

        let bucket = buckets
            .entry(client_id.to_string())
            .or_insert_with(|| TokenBucket::new(&self.config, now));

        match bucket.try_acquire(&self.config, now) {
            Ok(()) => Ok(()),
            Err(retry_after) => {
                let retry_after_secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
                warn!(
                    limiter = self.name,
                    client_id = %client_id,
                    retry_after_secs,
                    "Rate limit exceeded"
                );
                Err(WebhookError::RateLimitExceeded { retry_after_secs })
            }
        }
    }

    pub async fn remaining(&self, client_id: &str) -> u32 {
        let buckets = self.buckets.lock().await;
        buckets.get(client_id)
            .map(|bucket| {
                let mut projected = bucket.clone();
                let now = Instant::now();
                let elapsed = now.saturating_duration_since(projected.last_refill).as_secs_f64();
                projected.tokens = (projected.tokens + elapsed * self.config.refill_per_second)
                    .min(self.config.capacity as f64);
                projected.available()
            })
            .unwrap_or(self.config.capacity)
    }

    /// Buckets that would be full again carry no state worth keeping.
    fn prune_idle(&self, buckets: &mut HashMap<String, TokenBucket>, now: Instant) {
        let idle_after = self.config.full_refill_time();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < idle_after);
        debug!(limiter = self.name, pruned = before - buckets.len(), "Pruned idle rate limit buckets");
    }
}
