use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Opaque client identity. Extraction from a request (IP, token, header) is
/// a caller-supplied function so tests can inject deterministic keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientKey(pub String);

impl From<&str> for ClientKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Bucket capacity and refill rate.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    /// Maximum tokens (burst size).
    pub capacity: u32,
    /// Tokens refilled per minute.
    pub refill_per_minute: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 30,
            refill_per_minute: 30,
        }
    }
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitDecision {
    /// Whether the call may proceed.
    pub allowed: bool,
    /// Tokens left after this check.
    pub remaining: u32,
    /// Seconds until a token is available, when denied.
    pub retry_after_secs: f64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Per-client token bucket gating mutating API calls.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: Mutex<HashMap<ClientKey, Bucket>>,
}

impl RateLimiter {
    /// Creates a limiter.
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.duration_since(bucket.refilled_at);
        let refill = elapsed.as_secs_f64() * f64::from(self.config.refill_per_minute) / 60.0;
        if refill > 0.0 {
            bucket.tokens = (bucket.tokens + refill).min(f64::from(self.config.capacity));
            bucket.refilled_at = now;
        }
    }

    /// Checks (and consumes) one token for the client.
    pub fn check(&self, client: &ClientKey) -> RateLimitDecision {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: &ClientKey, now: Instant) -> RateLimitDecision {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(client.clone()).or_insert_with(|| Bucket {
            tokens: f64::from(self.config.capacity),
            refilled_at: now,
        });
        self.refill(bucket, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateLimitDecision {
                allowed: true,
                remaining: bucket.tokens.floor().max(0.0) as u32,
                retry_after_secs: 0.0,
            }
        } else {
            let per_token_secs = 60.0 / f64::from(self.config.refill_per_minute.max(1));
            RateLimitDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs: (1.0 - bucket.tokens) * per_token_secs,
            }
        }
    }

    /// Drops buckets idle longer than `max_idle` to bound memory.
    pub fn prune_idle(&self, max_idle: Duration) {
        let now = Instant::now();
        self.buckets
            .lock()
            .retain(|_, bucket| now.duration_since(bucket.refilled_at) <= max_idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_bounds_a_burst() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            capacity: 5,
            refill_per_minute: 5,
        });
        let client = ClientKey::from("10.0.0.1");
        let start = Instant::now();
        let allowed = (0..10)
            .filter(|_| limiter.check_at(&client, start).allowed)
            .count();
        assert_eq!(allowed, 5);
        let denied = limiter.check_at(&client, start);
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs > 0.0);
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            capacity: 2,
            refill_per_minute: 60,
        });
        let client = ClientKey::from("10.0.0.2");
        let start = Instant::now();
        assert!(limiter.check_at(&client, start).allowed);
        assert!(limiter.check_at(&client, start).allowed);
        assert!(!limiter.check_at(&client, start).allowed);
        // One token per second at 60/minute.
        let later = start + Duration::from_secs(2);
        assert!(limiter.check_at(&client, later).allowed);
    }

    #[test]
    fn clients_have_independent_buckets() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            capacity: 1,
            refill_per_minute: 1,
        });
        let start = Instant::now();
        assert!(limiter.check_at(&ClientKey::from("a"), start).allowed);
        assert!(limiter.check_at(&ClientKey::from("b"), start).allowed);
        assert!(!limiter.check_at(&ClientKey::from("a"), start).allowed);
    }

    #[test]
    fn rolling_window_never_exceeds_capacity_plus_refill() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            capacity: 10,
            refill_per_minute: 10,
        });
        let client = ClientKey::from("window");
        let start = Instant::now();
        let mut allowed = 0;
        // Simulate one check every 100 ms over 60 s: 600 attempts.
        for tick in 0..600u64 {
            let at = start + Duration::from_millis(tick * 100);
            if limiter.check_at(&client, at).allowed {
                allowed += 1;
            }
        }
        // Burst (10) plus refill over the minute (10), with fractional slack.
        assert!(allowed <= 21, "allowed={allowed}");
    }
}
