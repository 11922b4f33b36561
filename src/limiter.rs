//! Token-bucket admission control.
//!
//! [`RateLimiter`] is a single bucket shared by every call. [`KeyedRateLimiter`]
//! holds one bucket per caller key. Both implement [`Admission`], the seam the
//! rate-limiting interceptor depends on.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{Error, Result};

/// Admission gate consulted once per call before the handler runs.
#[async_trait::async_trait]
pub trait Admission: Send + Sync + 'static {
    /// Admits or rejects one call attributed to `key`.
    ///
    /// # Errors
    /// Returns [`Error::RateLimitExceeded`] when the call must be rejected.
    async fn try_acquire(&self, key: &str) -> Result<()>;

    /// Releases bookkeeping for keys that no longer need it.
    async fn prune_idle(&self) {}
}

/// Token count and the instant it was last brought up to date.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(capacity: u32) -> Self {
        Self {
            tokens: f64::from(capacity),
            last_refill: Instant::now(),
        }
    }

    fn available(&self, capacity: u32, refill_per_second: f64) -> f64 {
        let elapsed = Instant::now()
            .duration_since(self.last_refill)
            .as_secs_f64();
        (self.tokens + elapsed * refill_per_second).min(f64::from(capacity))
    }

    /// Refills for elapsed time, then takes one token if there is one.
    fn take(&mut self, capacity: u32, refill_per_second: f64) -> Result<()> {
        self.tokens = self.available(capacity, refill_per_second);
        self.last_refill = Instant::now();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Error::RateLimitExceeded)
        }
    }
}

/// Rate limiter using the token bucket algorithm.
///
/// Holds at most `capacity` tokens and replenishes `refill_per_second` tokens per
/// second. Every acquisition refills and consumes under one critical section, so
/// the token count stays within `0..=capacity` under concurrent callers.
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<Bucket>>,
    capacity: u32,
    refill_per_second: f64,
}

impl RateLimiter {
    /// Creates a full bucket.
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of tokens (burst size)
    /// * `refill_per_second` - Sustained admission rate
    pub fn new(capacity: u32, refill_per_second: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(Bucket::full(capacity))),
            capacity,
            refill_per_second,
        }
    }

    /// Attempts to take one token.
    ///
    /// Returns `Ok(())` if a token was acquired, `Err(Error::RateLimitExceeded)`
    /// otherwise.
    pub async fn check_rate_limit(&self) -> Result<()> {
        self.state
            .lock()
            .await
            .take(self.capacity, self.refill_per_second)
    }

    /// Tokens currently available, after accounting for elapsed refill.
    pub async fn available(&self) -> f64 {
        self.state
            .lock()
            .await
            .available(self.capacity, self.refill_per_second)
    }

    /// Bucket capacity.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

#[async_trait::async_trait]
impl Admission for RateLimiter {
    async fn try_acquire(&self, _key: &str) -> Result<()> {
        self.check_rate_limit().await
    }
}

/// One token bucket per caller key.
///
/// Buckets live inside the map and are only touched under its shard lock, so an
/// acquisition and a prune of the same key never interleave.
#[derive(Clone)]
pub struct KeyedRateLimiter {
    buckets: Arc<DashMap<String, Bucket>>,
    capacity: u32,
    refill_per_second: f64,
}

impl KeyedRateLimiter {
    /// Creates an empty set of buckets; each key starts with a full bucket.
    pub fn new(capacity: u32, refill_per_second: f64) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            capacity,
            refill_per_second,
        }
    }

    /// Takes one token from `key`'s bucket, creating it full on first use.
    pub fn check_rate_limit(&self, key: &str) -> Result<()> {
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            return bucket.take(self.capacity, self.refill_per_second);
        }

        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::full(self.capacity))
            .take(self.capacity, self.refill_per_second)
    }

    /// Drops buckets that have refilled completely; they are indistinguishable
    /// from fresh ones.
    pub fn prune(&self) {
        let capacity = f64::from(self.capacity);
        self.buckets
            .retain(|_, bucket| bucket.available(self.capacity, self.refill_per_second) < capacity);
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[async_trait::async_trait]
impl Admission for KeyedRateLimiter {
    async fn try_acquire(&self, key: &str) -> Result<()> {
        self.check_rate_limit(key)
    }

    async fn prune_idle(&self) {
        self.prune();
    }
}
