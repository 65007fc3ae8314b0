//! Per-destination token bucket.
//!
//! Tokens accrue continuously at `requests_per_second` up to `burst`. A caller
//! of [`RateLimiter::acquire`] withdraws one token under the bucket lock; if the
//! balance goes negative it has reserved a future token and sleeps for its own
//! deficit after releasing the lock. Withdrawal is serialized, the waiting and
//! the caller's subsequent work are not.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::error::JobError;

/// Throughput allowed towards one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests_per_second: f64,
    /// Bucket capacity: how many requests may go out back to back.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_burst() -> u32 {
    1
}

/// Slowest accepted rate: one request every 1e6 seconds (about 11.5 days).
pub const MIN_REQUESTS_PER_SECOND: f64 = 1e-6;

impl RateLimit {
    pub fn per_second(requests_per_second: f64) -> Self {
        Self {
            requests_per_second,
            burst: default_burst(),
        }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }

    /// Rates below [`MIN_REQUESTS_PER_SECOND`] and a zero burst are rejected.
    pub fn validate(&self) -> Result<(), JobError> {
        if !self.requests_per_second.is_finite()
            || self.requests_per_second < MIN_REQUESTS_PER_SECOND
        {
            return Err(JobError::InvalidConfig(format!(
                "requests_per_second must be a finite number >= {MIN_REQUESTS_PER_SECOND}, got {}",
                self.requests_per_second
            )));
        }
        if self.burst == 0 {
            return Err(JobError::InvalidConfig("burst must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Bucket {
    rate: f64,
    capacity: f64,
    /// May be negative: outstanding reservations.
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(limit: &RateLimit) -> Self {
        let capacity = f64::from(limit.burst);
        Self {
            rate: limit.requests_per_second,
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, returning how long the caller must wait for it.
    fn reserve(&mut self, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            // Saturates for rates too slow to express as a Duration.
            Duration::try_from_secs_f64(-self.tokens / self.rate).unwrap_or(Duration::MAX)
        }
    }

    fn same_limit(&self, limit: &RateLimit) -> bool {
        self.rate == limit.requests_per_second && self.capacity == f64::from(limit.burst)
    }

    fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token-bucket throttle keyed by destination.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    /// An empty limiter: every destination is unthrottled until configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the limit for `key`.
    ///
    /// A new or changed limit gets a fresh, full bucket. Configuring the same
    /// limit again keeps the existing bucket, so a limiter shared by
    /// successive jobs carries its balance from one job to the next.
    pub async fn configure(&self, key: impl Into<String>, limit: &RateLimit) {
        let key = key.into();
        let mut buckets = self.buckets.write().await;
        if let Some(existing) = buckets.get(&key)
            && existing.lock().await.same_limit(limit)
        {
            return;
        }
        tracing::debug!(
            destination = %key,
            rps = limit.requests_per_second,
            burst = limit.burst,
            "rate limit configured"
        );
        buckets.insert(key, Arc::new(Mutex::new(Bucket::new(limit))));
    }

    async fn bucket(&self, key: &str) -> Option<Arc<Mutex<Bucket>>> {
        self.buckets.read().await.get(key).cloned()
    }

    /// Wait until a token for `key` is available. Unconfigured keys pass immediately.
    ///
    /// The token is reserved before sleeping. Dropping the future mid-wait
    /// does not give it back: the balance stays one lower, so later callers
    /// wait at most one extra token interval.
    pub async fn acquire(&self, key: &str) {
        let Some(bucket) = self.bucket(key).await else {
            return;
        };

        let wait = bucket.lock().await.reserve(Instant::now());
        if !wait.is_zero() {
            tracing::trace!(destination = %key, wait_ms = wait.as_millis() as u64, "throttled");
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token only if one is available right now.
    pub async fn try_acquire(&self, key: &str) -> bool {
        let Some(bucket) = self.bucket(key).await else {
            return true;
        };
        bucket.lock().await.try_take(Instant::now())
    }

    /// Current token balance for `key` (negative while reservations are queued).
    pub async fn available(&self, key: &str) -> Option<f64> {
        let bucket = self.bucket(key).await?;
        let mut bucket = bucket.lock().await;
        bucket.refill(Instant::now());
        Some(bucket.tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_destination_is_not_throttled() {
        let limiter = RateLimiter::new();
        for _ in 0..100 {
            assert!(limiter.try_acquire("free").await);
        }
        limiter.acquire("free").await;
        assert!(limiter.available("free").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_throttle() {
        let limiter = RateLimiter::new();
        limiter
            .configure("ep", &RateLimit::per_second(10.0).with_burst(3))
            .await;

        assert!(limiter.try_acquire("ep").await);
        assert!(limiter.try_acquire("ep").await);
        assert!(limiter.try_acquire("ep").await);
        assert!(!limiter.try_acquire("ep").await);

        // 10/s refills continuously: one token after 100ms, not a whole second.
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(limiter.try_acquire("ep").await);
        assert!(!limiter.try_acquire("ep").await);
    }

    #[tokio::test(start_paused = true)]
    async fn fractional_tokens_accumulate() {
        let limiter = RateLimiter::new();
        limiter.configure("ep", &RateLimit::per_second(4.0)).await;
        assert!(limiter.try_acquire("ep").await);

        tokio::time::advance(Duration::from_millis(125)).await;
        let balance = limiter.available("ep").await.unwrap();
        assert!((balance - 0.5).abs() < 1e-6, "balance {balance}");
        assert!(!limiter.try_acquire("ep").await);

        tokio::time::advance(Duration::from_millis(125)).await;
        assert!(limiter.try_acquire("ep").await);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let limiter = RateLimiter::new();
        limiter.configure("ep", &RateLimit::per_second(2.0)).await;

        let start = Instant::now();
        limiter.acquire("ep").await;
        limiter.acquire("ep").await;
        limiter.acquire("ep").await;
        // First token is free, the next two cost 500ms each.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(999), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1010), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_respect_rate_window() {
        let limiter = Arc::new(RateLimiter::new());
        let limit = RateLimit::per_second(5.0).with_burst(2);
        limiter.configure("ep", &limit).await;

        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire("ep").await;
                Instant::now().duration_since(start)
            }));
        }
        let mut completions = Vec::new();
        for handle in handles {
            completions.push(handle.await.unwrap());
        }
        completions.sort();

        // Any 1s window holds at most rate + burst completions.
        let bound = (limit.requests_per_second as usize) + limit.burst as usize;
        for (i, t) in completions.iter().enumerate() {
            let in_window = completions[i..]
                .iter()
                .take_while(|c| **c < *t + Duration::from_secs(1))
                .count();
            assert!(in_window <= bound, "{in_window} completions in window starting {t:?}");
        }
        // 20 tokens at 5/s with 2 up front needs 18 / 5 = 3.6s.
        let last = *completions.last().unwrap();
        assert!(last >= Duration::from_millis(3599), "{last:?}");
        assert!(last < Duration::from_millis(3610), "{last:?}");
    }

    #[test]
    fn validate_rejects_nonsense() {
        assert!(RateLimit::per_second(0.0).validate().is_err());
        assert!(RateLimit::per_second(f64::INFINITY).validate().is_err());
        assert!(RateLimit::per_second(1.0).with_burst(0).validate().is_err());
        assert!(RateLimit::per_second(1e-30).validate().is_err());
        assert!(RateLimit::per_second(0.5).validate().is_ok());
        assert!(RateLimit::per_second(MIN_REQUESTS_PER_SECOND).validate().is_ok());
    }

    #[test]
    fn glacial_rate_saturates_the_wait() {
        let mut bucket = Bucket::new(&RateLimit::per_second(1e-30));
        let now = Instant::now();
        assert_eq!(bucket.reserve(now), Duration::ZERO);
        assert_eq!(bucket.reserve(now), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn reconfiguring_the_same_limit_keeps_the_balance() {
        let limiter = RateLimiter::new();
        let limit = RateLimit::per_second(1.0).with_burst(2);
        limiter.configure("ep", &limit).await;
        assert!(limiter.try_acquire("ep").await);
        assert!(limiter.try_acquire("ep").await);

        limiter.configure("ep", &limit).await;
        assert!(!limiter.try_acquire("ep").await);

        limiter.configure("ep", &limit.clone().with_burst(3)).await;
        assert_eq!(limiter.available("ep").await, Some(3.0));
    }

    #[tokio::test]
    async fn try_acquire_waits_out_a_held_lock() {
        let limiter = Arc::new(RateLimiter::new());
        limiter.configure("ep", &RateLimit::per_second(1.0)).await;

        let bucket = limiter.bucket("ep").await.unwrap();
        let guard = bucket.lock().await;
        let contender = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.try_acquire("ep").await })
        };
        tokio::task::yield_now().await;
        drop(guard);

        assert!(contender.await.unwrap());
    }
}
