//! Client-side rate limiting for backend tiers.
//!
//! Each tier gets two token buckets, one counting requests per minute and
//! one counting estimated prompt/completion tokens per minute. Buckets
//! refill continuously from elapsed wall time and cap at one minute's
//! quota, so a quiet period buys at most one minute of burst.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

struct Bucket {
    capacity: f64,
    refill_per_sec: f64,
    available: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(per_minute: f64, now: Instant) -> Self {
        Self {
            capacity: per_minute,
            refill_per_sec: per_minute / 60.0,
            available: per_minute,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.available = (self.available + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Seconds until `amount` units are available, zero when already there.
    fn wait_for(&self, amount: f64) -> f64 {
        if self.available >= amount {
            0.0
        } else {
            (amount - self.available) / self.refill_per_sec
        }
    }

    fn take(&mut self, amount: f64) {
        self.available -= amount;
    }
}

/// Dual token-bucket limiter for one backend tier.
pub struct RateLimiter {
    name: String,
    state: Mutex<Buckets>,
}

struct Buckets {
    requests: Bucket,
    tokens: Bucket,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, requests_per_minute: u32, tokens_per_minute: u64) -> Self {
        let now = Instant::now();
        Self {
            name: name.into(),
            state: Mutex::new(Buckets {
                requests: Bucket::new(requests_per_minute as f64, now),
                tokens: Bucket::new(tokens_per_minute as f64, now),
            }),
        }
    }

    /// Wait until one request plus `estimated_tokens` fit under both
    /// buckets, or refuse if that cannot happen before `deadline`.
    ///
    /// Returns `false` on refusal. Estimates larger than a full minute's
    /// token quota are clamped to the bucket capacity so they wait for a
    /// full bucket rather than forever.
    pub async fn acquire(&self, estimated_tokens: u64, deadline: Instant) -> bool {
        loop {
            let wait = {
                let mut buckets = self
                    .state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let now = Instant::now();
                buckets.requests.refill(now);
                buckets.tokens.refill(now);

                let token_demand = (estimated_tokens as f64).min(buckets.tokens.capacity);
                let wait_secs = buckets
                    .requests
                    .wait_for(1.0)
                    .max(buckets.tokens.wait_for(token_demand));

                if wait_secs <= 0.0 {
                    buckets.requests.take(1.0);
                    buckets.tokens.take(token_demand);
                    return true;
                }
                Duration::from_secs_f64(wait_secs)
            };

            let now = Instant::now();
            if now + wait > deadline {
                debug!(
                    backend = %self.name,
                    wait_ms = wait.as_millis() as u64,
                    "Rate limit wait would overrun the deadline; refusing"
                );
                return false;
            }
            // Re-check after sleeping; a concurrent caller may have drawn
            // down the bucket in the meantime.
            tokio::time::sleep(wait.max(Duration::from_millis(5))).await;
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buckets = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("requests_available", &buckets.requests.available)
            .field("tokens_available", &buckets.tokens.available)
            .finish()
    }
}
