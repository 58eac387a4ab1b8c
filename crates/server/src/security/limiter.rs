//! Admission throttling for the public surface, keyed by remote address.
//!
//! Two scopes exist: plain HTTP requests and `/connect` handshakes, the
//! latter tighter because every accepted handshake pins a session task and
//! a route record. The matchmaking `next` cooldown is not handled here; it
//! belongs to the Matchmaker and is per connection, not per address.

use crate::config::{RateLimitConfig, RateLimitSettings};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Bucket-map sweep threshold; crossing it evicts quiet addresses.
const SWEEP_LEN: usize = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    Http,
    Connect,
}

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
}

impl RateDecision {
    fn allow() -> Self {
        RateDecision {
            allowed: true,
            retry_after: None,
        }
    }

    fn deny(retry_after: Duration) -> Self {
        RateDecision {
            allowed: false,
            retry_after: Some(retry_after),
        }
    }
}

/// Token bucket for one remote address. `burst` tokens refill evenly over
/// one window; an empty bucket with a configured penalty locks the address
/// out entirely until the penalty lapses.
#[derive(Debug)]
struct AddressBucket {
    tokens: f64,
    refilled_at: Instant,
    locked_until: Option<Instant>,
}

impl AddressBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        AddressBucket {
            tokens: capacity,
            refilled_at: now,
            locked_until: None,
        }
    }
}

#[derive(Debug)]
struct ScopedBuckets {
    settings: RateLimitSettings,
    buckets: Mutex<HashMap<String, AddressBucket>>,
}

impl ScopedBuckets {
    fn new(settings: RateLimitSettings) -> Self {
        ScopedBuckets {
            settings,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn capacity(&self) -> f64 {
        self.settings.burst as f64
    }

    /// Tokens regained per second; the window is validated non-zero at
    /// configuration load.
    fn refill_rate(&self) -> f64 {
        self.capacity() / self.settings.window.as_secs_f64()
    }

    async fn admit(&self, address: &str) -> RateDecision {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        if buckets.len() > SWEEP_LEN {
            let capacity = self.capacity();
            buckets.retain(|_, bucket| {
                bucket.locked_until.is_some_and(|until| now < until) || bucket.tokens < capacity
            });
        }
        let capacity = self.capacity();
        let rate = self.refill_rate();
        let bucket = buckets
            .entry(address.to_string())
            .or_insert_with(|| AddressBucket::full(capacity, now));
        if let Some(until) = bucket.locked_until {
            if now < until {
                return RateDecision::deny(until.saturating_duration_since(now));
            }
            bucket.locked_until = None;
            bucket.tokens = capacity;
            bucket.refilled_at = now;
        }
        let elapsed = now.saturating_duration_since(bucket.refilled_at);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * rate).min(capacity);
        bucket.refilled_at = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return RateDecision::allow();
        }
        if self.settings.penalty.is_zero() {
            let deficit = 1.0 - bucket.tokens;
            return RateDecision::deny(Duration::from_secs_f64(deficit / rate));
        }
        bucket.locked_until = Some(now + self.settings.penalty);
        RateDecision::deny(self.settings.penalty)
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    http: ScopedBuckets,
    connect: ScopedBuckets,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        RateLimiter {
            http: ScopedBuckets::new(config.http.clone()),
            connect: ScopedBuckets::new(config.connect.clone()),
        }
    }

    pub async fn check(&self, scope: RateScope, address: &str) -> RateDecision {
        match scope {
            RateScope::Http => self.http.admit(address).await,
            RateScope::Connect => self.connect.admit(address).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn make_config() -> RateLimitConfig {
        let settings = RateLimitSettings {
            burst: 2,
            window: Duration::from_millis(200),
            penalty: Duration::from_millis(80),
        };
        RateLimitConfig {
            http: settings.clone(),
            connect: settings,
        }
    }

    #[tokio::test]
    async fn burst_admits_then_penalty_locks_the_address() {
        let limiter = RateLimiter::new(&make_config());
        let address = "198.51.100.40";
        assert!(limiter.check(RateScope::Connect, address).await.allowed);
        assert!(limiter.check(RateScope::Connect, address).await.allowed);
        let decision = limiter.check(RateScope::Connect, address).await;
        assert!(!decision.allowed);
        assert!(decision.retry_after.expect("retry hint") >= Duration::from_millis(70));
        sleep(Duration::from_millis(90)).await;
        assert!(limiter.check(RateScope::Connect, address).await.allowed);
    }

    #[tokio::test]
    async fn tokens_refill_without_penalty() {
        let mut config = make_config();
        config.http.burst = 1;
        config.http.window = Duration::from_millis(50);
        config.http.penalty = Duration::ZERO;
        let limiter = RateLimiter::new(&config);
        let address = "198.51.100.41";
        assert!(limiter.check(RateScope::Http, address).await.allowed);
        let denied = limiter.check(RateScope::Http, address).await;
        assert!(!denied.allowed);
        assert!(denied.retry_after.expect("retry hint") <= Duration::from_millis(50));
        sleep(Duration::from_millis(60)).await;
        assert!(limiter.check(RateScope::Http, address).await.allowed);
    }

    #[tokio::test]
    async fn http_and_connect_buckets_are_separate() {
        let limiter = RateLimiter::new(&make_config());
        let address = "198.51.100.42";
        assert!(limiter.check(RateScope::Http, address).await.allowed);
        assert!(limiter.check(RateScope::Http, address).await.allowed);
        assert!(!limiter.check(RateScope::Http, address).await.allowed);
        // an exhausted HTTP bucket must not block the handshake path
        assert!(limiter.check(RateScope::Connect, address).await.allowed);
    }

    #[tokio::test]
    async fn addresses_do_not_share_tokens() {
        let limiter = RateLimiter::new(&make_config());
        assert!(limiter.check(RateScope::Connect, "198.51.100.43").await.allowed);
        assert!(limiter.check(RateScope::Connect, "198.51.100.43").await.allowed);
        assert!(!limiter.check(RateScope::Connect, "198.51.100.43").await.allowed);
        assert!(limiter.check(RateScope::Connect, "198.51.100.44").await.allowed);
    }
}
