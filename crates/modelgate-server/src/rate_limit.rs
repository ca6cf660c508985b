//! Per-key data-plane rate limiting.
//!
//! A leaky-bucket limiter keyed by user id. Tokens refill continuously at
//! `rpm` per minute; each request consumes one. The decision carries what
//! the `X-RateLimit-*` headers need, on success and on rejection alike.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// The refill window (requests-per-minute means per this window).
const WINDOW: Duration = Duration::from_secs(60);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Outcome of one acquire attempt.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    /// Configured ceiling (the `X-RateLimit-Limit` header).
    pub limit: u64,
    /// Whole tokens left after this request.
    pub remaining: u64,
    /// Seconds until the bucket is full again.
    pub reset_secs: u64,
}

/// A leaky-bucket rate limiter keyed by user id.
///
/// Each key gets its own independent bucket, created on first use with
/// the rpm in force at that moment; a changed rpm applies from the next
/// refill.
pub struct RateLimiter {
    buckets: DashMap<i64, Bucket>,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Try to consume one token for the key at the given ceiling.
    ///
    /// An `rpm` of zero disables limiting (always allowed).
    pub fn try_acquire(&self, key: i64, rpm: u64) -> RateDecision {
        if rpm == 0 {
            return RateDecision {
                allowed: true,
                limit: 0,
                remaining: 0,
                reset_secs: 0,
            };
        }

        let max_tokens = rpm as f64;
        let mut entry = self.buckets.entry(key).or_insert_with(|| Bucket {
            tokens: max_tokens,
            last_refill: Instant::now(),
        });
        let bucket = entry.value_mut();

        // Refill based on elapsed time, clamped to the ceiling.
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        let refill = elapsed.as_secs_f64() / WINDOW.as_secs_f64() * max_tokens;
        bucket.tokens = (bucket.tokens + refill).min(max_tokens);
        bucket.last_refill = now;

        let allowed = if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        };

        let missing = max_tokens - bucket.tokens;
        let reset_secs = (missing / max_tokens * WINDOW.as_secs_f64()).ceil() as u64;

        RateDecision {
            allowed,
            limit: rpm,
            remaining: bucket.tokens.floor().max(0.0) as u64,
            reset_secs,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_ceiling_then_rejects() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            assert!(limiter.try_acquire(1, 5).allowed);
        }
        let denied = limiter.try_acquire(1, 5);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.reset_secs > 0);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            assert!(limiter.try_acquire(1, 3).allowed);
        }
        assert!(!limiter.try_acquire(1, 3).allowed);
        assert!(limiter.try_acquire(2, 3).allowed);
    }

    #[test]
    fn zero_rpm_disables_limiting() {
        let limiter = RateLimiter::new();
        for _ in 0..1000 {
            assert!(limiter.try_acquire(1, 0).allowed);
        }
    }

    #[test]
    fn remaining_counts_down() {
        let limiter = RateLimiter::new();
        let first = limiter.try_acquire(7, 10);
        assert_eq!(first.limit, 10);
        assert_eq!(first.remaining, 9);
        let second = limiter.try_acquire(7, 10);
        assert_eq!(second.remaining, 8);
    }
}
