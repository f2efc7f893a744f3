//! Per-API-key token-bucket rate limiter (spec §3/§4.5).
//!
//! Each key gets an independent bucket: capacity `token_limit`, refilled at
//! `tokens_per_period` per `period_sec`, plus a bounded queue of size `queue_limit` so a
//! denial can report how many requests are already waiting. A request consumes exactly
//! one bucket token regardless of how many LLM tokens it ultimately uses. State per
//! bucket is serialized by a per-entry mutex (via `dashmap`); buckets for different keys
//! never contend with one another.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    waiters: usize,
}

impl Bucket {
    fn new(capacity: u32, tokens_per_period: u32, period_sec: u64) -> Self {
        let refill_per_sec = tokens_per_period as f64 / period_sec.max(1) as f64;
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec,
            last_refill: Instant::now(),
            waiters: 0,
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = Instant::now();
    }

    /// Seconds until at least one token will be available.
    fn retry_after_secs(&self) -> u64 {
        if self.refill_per_sec <= 0.0 {
            return u64::MAX / 2;
        }
        let deficit = (1.0 - self.tokens).max(0.0);
        (deficit / self.refill_per_sec).ceil() as u64
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Admission {
    Allowed,
    Denied { retry_after_secs: u64 },
    QueueFull,
}

pub struct RateLimiter {
    buckets: DashMap<String, Mutex<Bucket>>,
    capacity: u32,
    tokens_per_period: u32,
    period_sec: u64,
    queue_limit: usize,
}

impl RateLimiter {
    pub fn new(capacity: u32, tokens_per_period: u32, period_sec: u64, queue_limit: usize) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity,
            tokens_per_period,
            period_sec,
            queue_limit,
        }
    }

    /// Attempt to consume one token for `key`. Never blocks the caller beyond the
    /// per-bucket lock; returns immediately with the admission decision (spec §4.5
    /// `TryAcquire` returns immediately with allowed/denied).
    pub async fn try_acquire(&self, key: &str) -> Admission {
        let entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(Bucket::new(self.capacity, self.tokens_per_period, self.period_sec)));
        let mut bucket = entry.lock().await;
        bucket.refill();

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            bucket.waiters = bucket.waiters.saturating_sub(1);
            Admission::Allowed
        } else if bucket.waiters >= self.queue_limit {
            Admission::QueueFull
        } else {
            bucket.waiters += 1;
            Admission::Denied { retry_after_secs: bucket.retry_after_secs() }
        }
    }

    /// Resets all buckets — called only on configuration reload (spec §4.5).
    pub fn reset(&self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_bucket_allows_up_to_capacity() {
        let limiter = RateLimiter::new(2, 0, 1, 10);
        assert!(matches!(limiter.try_acquire("k1").await, Admission::Allowed));
        assert!(matches!(limiter.try_acquire("k1").await, Admission::Allowed));
        assert!(matches!(
            limiter.try_acquire("k1").await,
            Admission::Denied { .. }
        ));
    }

    #[tokio::test]
    async fn different_keys_have_independent_buckets() {
        let limiter = RateLimiter::new(1, 0, 1, 10);
        assert!(matches!(limiter.try_acquire("a").await, Admission::Allowed));
        assert!(matches!(limiter.try_acquire("b").await, Admission::Allowed));
    }

    #[tokio::test]
    async fn exceeding_queue_limit_returns_queue_full() {
        let limiter = RateLimiter::new(1, 0, 1, 1);
        assert!(matches!(limiter.try_acquire("k").await, Admission::Allowed));
        assert!(matches!(
            limiter.try_acquire("k").await,
            Admission::Denied { .. }
        ));
        assert!(matches!(limiter.try_acquire("k").await, Admission::QueueFull));
    }

    #[tokio::test(start_paused = true)]
    async fn refills_over_time() {
        let limiter = RateLimiter::new(1, 1, 1, 10);
        assert!(matches!(limiter.try_acquire("k").await, Admission::Allowed));
        assert!(matches!(
            limiter.try_acquire("k").await,
            Admission::Denied { .. }
        ));
        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(matches!(limiter.try_acquire("k").await, Admission::Allowed));
    }

    #[tokio::test]
    async fn reset_clears_all_buckets() {
        let limiter = RateLimiter::new(1, 0, 1, 10);
        limiter.try_acquire("k").await;
        limiter.reset();
        assert!(matches!(limiter.try_acquire("k").await, Admission::Allowed));
    }
}
