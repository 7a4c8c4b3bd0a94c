//! Provider-wide rate limiting using the token bucket algorithm
//!
//! One limiter is shared by every worker (and every concurrent campaign) that
//! talks to the same provider integration, so the aggregate send rate never
//! exceeds what the provider account allows.
//!
//! # Token Bucket Algorithm
//!
//! - Tokens are added to the bucket at a constant rate (`messages_per_second`)
//! - Each provider call consumes one token
//! - If no tokens are available the caller sleeps until enough have refilled
//! - The bucket has a maximum capacity, which bounds bursts
//!
//! # Example
//!
//! ```text
//! Rate limit: 20 msg/sec, burst: 40
//! - Bucket starts with 40 tokens
//! - Tokens refill at 20/sec
//! - Can send 40 messages immediately (burst)
//! - Then limited to 20/sec sustained rate
//! ```

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use volley_common::tracing;

/// Shortest sleep between acquisition attempts
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Longest sleep between acquisition attempts, so a waiter re-checks the
/// bucket regularly even when refill is slow
const MAX_WAIT: Duration = Duration::from_secs(1);

/// Configuration for rate limiting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained provider calls per second
    #[serde(default = "default_messages_per_second")]
    pub messages_per_second: f64,

    /// Maximum tokens in the bucket; twice the rate when unset
    #[serde(default)]
    pub burst_size: Option<u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            messages_per_second: default_messages_per_second(),
            burst_size: None,
        }
    }
}

impl RateLimitConfig {
    /// Effective bucket capacity
    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.burst_size
            .map_or(self.messages_per_second * 2.0, f64::from)
    }
}

const fn default_messages_per_second() -> f64 {
    20.0
}

/// Reasons a blocking acquisition gave up
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AcquireError {
    #[error("Acquisition cancelled")]
    Cancelled,

    #[error("Requested {requested} tokens but the bucket only holds {capacity}")]
    ExceedsCapacity { requested: u32, capacity: f64 },
}

#[derive(Debug)]
struct TokenBucket {
    /// Current number of tokens
    tokens: f64,
    /// Maximum tokens (burst size)
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    /// Last time tokens were added
    last_refill: Instant,
}

impl TokenBucket {
    fn new(refill_rate: f64, capacity: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();

        self.tokens = elapsed
            .mul_add(self.refill_rate, self.tokens)
            .min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self, count: f64) -> bool {
        self.refill();

        if self.tokens >= count {
            self.tokens -= count;
            true
        } else {
            false
        }
    }

    /// Time until `count` tokens will be available, assuming no other consumer
    fn time_until_available(&mut self, count: f64) -> Duration {
        self.refill();

        if self.tokens >= count {
            return Duration::ZERO;
        }

        // Very slow refill rates overflow `Duration`; callers re-check anyway
        Duration::try_from_secs_f64((count - self.tokens) / self.refill_rate).unwrap_or(MAX_WAIT)
    }
}

/// Shared token-bucket limiter for one provider integration
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_capacity(config.messages_per_second, config.capacity())
    }

    /// Create a limiter with an explicit refill rate and capacity
    #[must_use]
    pub fn with_capacity(messages_per_second: f64, capacity: f64) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(messages_per_second, capacity)),
        }
    }

    /// Take `count` tokens if they are available right now
    pub fn try_consume(&self, count: u32) -> bool {
        self.bucket.lock().try_consume(f64::from(count))
    }

    /// Take `count` tokens, sleeping until they are available
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::Cancelled`] if `cancel` fires while waiting and
    /// [`AcquireError::ExceedsCapacity`] if `count` can never be satisfied.
    pub async fn consume_blocking(
        &self,
        count: u32,
        cancel: &CancellationToken,
    ) -> Result<(), AcquireError> {
        let wanted = f64::from(count);

        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                if wanted > bucket.capacity {
                    return Err(AcquireError::ExceedsCapacity {
                        requested: count,
                        capacity: bucket.capacity,
                    });
                }

                if bucket.try_consume(wanted) {
                    return Ok(());
                }

                bucket.time_until_available(wanted)
            };

            let wait = wait.clamp(MIN_WAIT, MAX_WAIT);
            tracing::trace!(
                wait_ms = wait.as_millis(),
                "Rate limit reached, waiting for tokens"
            );

            tokio::select! {
                () = cancel.cancelled() => return Err(AcquireError::Cancelled),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Tokens currently in the bucket
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        bucket.tokens
    }

    /// Snapshot of the bucket for monitoring
    pub fn stats(&self) -> RateLimitStats {
        let mut bucket = self.bucket.lock();
        bucket.refill();

        RateLimitStats {
            available_tokens: bucket.tokens,
            capacity: bucket.capacity,
            refill_rate: bucket.refill_rate,
        }
    }
}

/// Statistics for the rate limiter
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitStats {
    /// Currently available tokens
    pub available_tokens: f64,
    /// Maximum capacity (burst size)
    pub capacity: f64,
    /// Refill rate (tokens per second)
    pub refill_rate: f64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capacity_is_twice_the_rate() {
        let config = RateLimitConfig::default();
        assert!((config.capacity() - 40.0).abs() < f64::EPSILON);

        let config = RateLimitConfig {
            messages_per_second: 5.0,
            burst_size: Some(7),
        };
        assert!((config.capacity() - 7.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_bounded_by_capacity() {
        let limiter = RateLimiter::with_capacity(5.0, 10.0);

        let granted = (0..20).filter(|_| limiter.try_consume(1)).count();
        assert_eq!(granted, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_after_one_second() {
        let limiter = RateLimiter::with_capacity(5.0, 10.0);
        while limiter.try_consume(1) {}

        tokio::time::advance(Duration::from_secs(1)).await;

        let granted = (0..20).filter(|_| limiter.try_consume(1)).count();
        assert_eq!(granted, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_never_exceeds_capacity() {
        let limiter = RateLimiter::with_capacity(5.0, 10.0);
        tokio::time::advance(Duration::from_secs(60)).await;

        let stats = limiter.stats();
        assert!((stats.available_tokens - 10.0).abs() < f64::EPSILON);
        assert!((stats.capacity - 10.0).abs() < f64::EPSILON);
        assert!((stats.refill_rate - 5.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    #[allow(clippy::cast_precision_loss)]
    async fn test_grants_over_a_window_respect_rate_law() {
        let limiter = RateLimiter::with_capacity(5.0, 10.0);
        let mut granted = 0_u32;

        // 3 seconds in 100ms steps, hammering the bucket every step
        for _ in 0..30 {
            granted += u32::try_from((0..50).filter(|_| limiter.try_consume(1)).count()).unwrap();
            tokio::time::advance(Duration::from_millis(100)).await;
        }

        assert!(f64::from(granted) <= 5.0f64.mul_add(3.0, 10.0) + 1e-6);
        assert!(granted >= 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_blocking_waits_for_refill() {
        let limiter = RateLimiter::with_capacity(2.0, 2.0);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..4 {
            limiter.consume_blocking(1, &cancel).await.unwrap();
        }

        // 2 tokens immediately, the other 2 need one second of refill
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(990), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1100), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_blocking_is_cancellable() {
        let limiter = RateLimiter::with_capacity(0.001, 1.0);
        let cancel = CancellationToken::new();
        limiter.consume_blocking(1, &cancel).await.unwrap();

        let waiter = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            waiter.cancel();
        });

        let result = limiter.consume_blocking(1, &cancel).await;
        assert_eq!(result, Err(AcquireError::Cancelled));
    }

    #[tokio::test]
    async fn test_consume_more_than_capacity() {
        let limiter = RateLimiter::with_capacity(1.0, 3.0);
        let result = limiter.consume_blocking(4, &CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(AcquireError::ExceedsCapacity { requested: 4, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanishing_rate_waits_without_overflow() {
        let config = RateLimitConfig {
            messages_per_second: 1e-300,
            burst_size: Some(1),
        };
        let limiter = RateLimiter::new(&config);
        let cancel = CancellationToken::new();
        limiter.consume_blocking(1, &cancel).await.unwrap();

        assert_eq!(limiter.bucket.lock().time_until_available(1.0), MAX_WAIT);

        let waiter = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            waiter.cancel();
        });
        assert_eq!(
            limiter.consume_blocking(1, &cancel).await,
            Err(AcquireError::Cancelled)
        );
    }
}
