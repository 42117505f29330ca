//! Per-subscription rate limiting.
//!
//! Implements a token bucket per key. Callers ask [`RateLimiter::allow`]
//! before each send; the call never waits, a denied request is deferred by
//! the caller instead of being queued here.

mod bucket;
mod memory;
mod shared;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{Error, Result};

pub use bucket::{BucketState, Clock, SystemClock, TokioClock};
pub use memory::MemoryRateLimiter;
pub use shared::{BucketStore, InMemoryBucketStore, SharedRateLimiter};

/// Quota applied to one rate-limit key.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateLimitPolicy {
    /// No limit.
    #[default]
    None,
    /// Token bucket with `capacity` burst, refilled continuously at
    /// `refill_per_sec` tokens per second.
    TokenBucket { capacity: u32, refill_per_sec: f64 },
}

impl RateLimitPolicy {
    /// Create a token-bucket policy for a requests-per-second limit.
    pub fn per_second(refill_per_sec: f64, capacity: u32) -> Result<Self> {
        let policy = Self::TokenBucket {
            capacity,
            refill_per_sec,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::None => Ok(()),
            Self::TokenBucket {
                capacity,
                refill_per_sec,
            } => {
                if capacity == 0 {
                    return Err(Error::validation("rate limit capacity must be at least 1"));
                }
                if !refill_per_sec.is_finite() || refill_per_sec <= 0.0 {
                    return Err(Error::validation(format!(
                        "rate limit must be a positive finite number, got {}",
                        refill_per_sec
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Which limiter implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RateLimiterBackend {
    /// Always allows.
    None,
    /// In-process buckets.
    #[default]
    Memory,
    /// Buckets in a [`BucketStore`] shared across limiter instances.
    Shared,
}

impl RateLimiterBackend {
    /// Build a limiter for this backend.
    ///
    /// The `shared` backend gets a fresh [`InMemoryBucketStore`]; use
    /// [`SharedRateLimiter::new`] directly to plug in another store, or
    /// [`SharedRateLimiter::with_clock`] for another time source.
    pub fn build(self, default_policy: RateLimitPolicy) -> Result<Arc<dyn RateLimiter>> {
        default_policy.validate()?;
        let limiter: Arc<dyn RateLimiter> = match self {
            Self::None => Arc::new(NoopRateLimiter),
            Self::Memory => Arc::new(MemoryRateLimiter::new(default_policy)),
            Self::Shared => Arc::new(SharedRateLimiter::new(
                Arc::new(InMemoryBucketStore::new()),
                default_policy,
            )),
        };
        Ok(limiter)
    }
}

/// Non-blocking quota check keyed by an opaque string.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Refill the key's bucket and consume one token if available.
    ///
    /// Returns `true` if a token was acquired, `false` if rate limited.
    async fn allow(&self, key: &str) -> bool;

    /// Install a policy for one key, replacing the default policy for it.
    async fn set_policy(&self, key: &str, policy: RateLimitPolicy) -> Result<()>;

    /// Forget a key's policy and bucket.
    async fn remove(&self, key: &str);

    fn backend(&self) -> RateLimiterBackend;
}

/// Limiter that never denies.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn allow(&self, _key: &str) -> bool {
        true
    }

    async fn set_policy(&self, _key: &str, policy: RateLimitPolicy) -> Result<()> {
        policy.validate()
    }

    async fn remove(&self, _key: &str) {}

    fn backend(&self) -> RateLimiterBackend {
        RateLimiterBackend::None
    }
}
