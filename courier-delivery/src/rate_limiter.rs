//! Per-sender submission limits using the token bucket algorithm
//!
//! Each sender address gets an hourly and a daily bucket. A submission takes
//! one token from each; when either is empty the submission is refused.
//!
//! ```text
//! per_hour: 100
//! - Bucket starts with 100 tokens
//! - Refills at 100 / 3600 tokens per second
//! - 100 messages can be sent at once, then roughly one every 36 seconds
//! ```

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use courier_common::Address;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86400);

/// Submission limits per sender address. `0` disables a limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub per_hour: u32,

    #[serde(default)]
    pub per_day: u32,
}

impl RateLimitConfig {
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.per_hour > 0 || self.per_day > 0
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(limit: u32, period: Duration) -> Self {
        let capacity = f64::from(limit);
        Self {
            tokens: capacity,
            capacity,
            refill_rate: capacity / period.as_secs_f64(),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = elapsed.mul_add(self.refill_rate, self.tokens).min(self.capacity);
        self.last_refill = now;
    }

    fn has_token(&mut self) -> bool {
        self.refill();
        self.tokens >= 1.0
    }

    fn time_until_available(&self) -> Duration {
        if self.tokens >= 1.0 || self.refill_rate <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
    }
}

#[derive(Debug)]
struct SenderBuckets {
    hourly: Option<TokenBucket>,
    daily: Option<TokenBucket>,
}

/// Why a submission was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimited {
    /// Wait before the sender may submit again
    pub retry_after: Duration,
}

#[derive(Debug)]
pub struct SenderRateLimiter {
    config: RateLimitConfig,
    senders: DashMap<String, Arc<parking_lot::Mutex<SenderBuckets>>>,
}

impl SenderRateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            senders: DashMap::new(),
        }
    }

    fn buckets(&self, sender: &str) -> Arc<parking_lot::Mutex<SenderBuckets>> {
        if let Some(buckets) = self.senders.get(sender) {
            return Arc::clone(buckets.value());
        }

        self.senders
            .entry(sender.to_string())
            .or_insert_with(|| {
                Arc::new(parking_lot::Mutex::new(SenderBuckets {
                    hourly: (self.config.per_hour > 0)
                        .then(|| TokenBucket::new(self.config.per_hour, HOUR)),
                    daily: (self.config.per_day > 0)
                        .then(|| TokenBucket::new(self.config.per_day, DAY)),
                }))
            })
            .clone()
    }

    /// Take a token for `sender`, or report how long to wait.
    pub fn check(&self, sender: &Address) -> Result<(), RateLimited> {
        if !self.config.is_enabled() {
            return Ok(());
        }

        let key = sender.to_string().to_ascii_lowercase();
        let shared = self.buckets(&key);
        let mut guard = shared.lock();
        let buckets = &mut *guard;

        let mut retry_after = Duration::ZERO;
        for bucket in [&mut buckets.hourly, &mut buckets.daily].into_iter().flatten() {
            if !bucket.has_token() {
                retry_after = retry_after.max(bucket.time_until_available());
            }
        }

        if !retry_after.is_zero() {
            tracing::debug!(sender = %key, ?retry_after, "Sender rate limited");
            return Err(RateLimited { retry_after });
        }

        for bucket in [&mut buckets.hourly, &mut buckets.daily].into_iter().flatten() {
            bucket.tokens -= 1.0;
        }

        Ok(())
    }

    /// Give back the token taken by a [`SenderRateLimiter::check`] whose
    /// submission was not accepted after all.
    pub fn refund(&self, sender: &Address) {
        if !self.config.is_enabled() {
            return;
        }

        let key = sender.to_string().to_ascii_lowercase();
        let Some(shared) = self.senders.get(&key).map(|entry| Arc::clone(entry.value())) else {
            return;
        };

        let mut guard = shared.lock();
        let buckets = &mut *guard;
        for bucket in [&mut buckets.hourly, &mut buckets.daily].into_iter().flatten() {
            bucket.tokens = (bucket.tokens + 1.0).min(bucket.capacity);
        }
    }

    /// Forget senders whose buckets have fully refilled.
    pub fn cleanup_idle(&self) {
        self.senders.retain(|_, shared| {
            let mut guard = shared.lock();
            let buckets = &mut *guard;
            [&mut buckets.hourly, &mut buckets.daily]
                .into_iter()
                .flatten()
                .any(|bucket| {
                    bucket.refill();
                    bucket.tokens < bucket.capacity
                })
        });
    }

    pub fn tracked_senders(&self) -> usize {
        self.senders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender(address: &str) -> Address {
        Address::parse(address).expect("valid address")
    }

    #[test]
    fn test_disabled_by_default() {
        let limiter = SenderRateLimiter::new(RateLimitConfig::default());
        for _ in 0..1000 {
            assert!(limiter.check(&sender("bulk@example.com")).is_ok());
        }
        assert_eq!(limiter.tracked_senders(), 0);
    }

    #[test]
    fn test_hourly_limit() {
        let limiter = SenderRateLimiter::new(RateLimitConfig {
            per_hour: 3,
            per_day: 0,
        });

        for _ in 0..3 {
            assert!(limiter.check(&sender("app@example.com")).is_ok());
        }

        let limited = limiter
            .check(&sender("App@example.com"))
            .expect_err("fourth message should be refused");
        assert!(limited.retry_after > Duration::from_secs(1000));
        assert!(limited.retry_after <= HOUR);

        // other senders are unaffected
        assert!(limiter.check(&sender("other@example.com")).is_ok());
    }

    #[test]
    fn test_daily_limit_applies_alongside_hourly() {
        let limiter = SenderRateLimiter::new(RateLimitConfig {
            per_hour: 10,
            per_day: 2,
        });

        assert!(limiter.check(&sender("app@example.com")).is_ok());
        assert!(limiter.check(&sender("app@example.com")).is_ok());
        assert!(limiter.check(&sender("app@example.com")).is_err());
    }

    #[test]
    fn test_refused_submission_consumes_nothing() {
        let limiter = SenderRateLimiter::new(RateLimitConfig {
            per_hour: 1,
            per_day: 5,
        });

        assert!(limiter.check(&sender("app@example.com")).is_ok());
        assert!(limiter.check(&sender("app@example.com")).is_err());

        let buckets = limiter.buckets("app@example.com");
        let buckets = buckets.lock();
        let daily = buckets.daily.as_ref().expect("daily bucket");
        assert!(daily.tokens > 3.9 && daily.tokens < 4.1);
    }

    #[test]
    fn test_refund_restores_token() {
        let limiter = SenderRateLimiter::new(RateLimitConfig {
            per_hour: 1,
            per_day: 0,
        });

        assert!(limiter.check(&sender("app@example.com")).is_ok());
        limiter.refund(&sender("App@example.com"));
        assert!(limiter.check(&sender("app@example.com")).is_ok());
        assert!(limiter.check(&sender("app@example.com")).is_err());

        // never above capacity, and unknown senders are ignored
        limiter.refund(&sender("app@example.com"));
        limiter.refund(&sender("app@example.com"));
        limiter.refund(&sender("new@example.com"));
        assert!(limiter.check(&sender("app@example.com")).is_ok());
        assert!(limiter.check(&sender("app@example.com")).is_err());
        assert_eq!(limiter.tracked_senders(), 1);
    }

    #[test]
    fn test_cleanup_keeps_active_senders() {
        let limiter = SenderRateLimiter::new(RateLimitConfig {
            per_hour: 5,
            per_day: 0,
        });

        assert!(limiter.check(&sender("app@example.com")).is_ok());
        limiter.cleanup_idle();
        assert_eq!(limiter.tracked_senders(), 1);
    }
}
