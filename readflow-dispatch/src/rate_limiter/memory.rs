//! In-process rate limiter with one lock per key.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use super::{BucketState, Clock, RateLimitPolicy, RateLimiter, RateLimiterBackend, TokioClock};
use crate::Result;

/// Token buckets kept in process memory.
///
/// The map shard lock is only held long enough to fetch the bucket handle;
/// refill and consume happen under the bucket's own mutex, so two keys never
/// contend with each other.
#[derive(Debug)]
pub struct MemoryRateLimiter {
    default_policy: RateLimitPolicy,
    policies: DashMap<String, RateLimitPolicy>,
    buckets: DashMap<String, Arc<Mutex<BucketState>>>,
    clock: TokioClock,
}

impl MemoryRateLimiter {
    pub fn new(default_policy: RateLimitPolicy) -> Self {
        Self {
            default_policy,
            policies: DashMap::new(),
            buckets: DashMap::new(),
            clock: TokioClock::new(),
        }
    }

    fn policy_for(&self, key: &str) -> RateLimitPolicy {
        self.policies
            .get(key)
            .map(|p| *p)
            .unwrap_or(self.default_policy)
    }

    /// Tokens currently available for `key`, after refilling.
    pub fn available_tokens(&self, key: &str) -> Option<f64> {
        let RateLimitPolicy::TokenBucket {
            capacity,
            refill_per_sec,
        } = self.policy_for(key)
        else {
            return None;
        };

        let now = self.clock.now_millis();
        let bucket = self.bucket(key, capacity, now);
        let mut state = bucket.lock();
        *state = state.refilled(capacity, refill_per_sec, now);
        Some(state.tokens)
    }

    fn bucket(&self, key: &str, capacity: u32, now_ms: i64) -> Arc<Mutex<BucketState>> {
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BucketState::full(capacity, now_ms))))
            .clone()
    }
}

impl Default for MemoryRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitPolicy::None)
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn allow(&self, key: &str) -> bool {
        let RateLimitPolicy::TokenBucket {
            capacity,
            refill_per_sec,
        } = self.policy_for(key)
        else {
            return true;
        };

        let now = self.clock.now_millis();
        let bucket = self.bucket(key, capacity, now);
        let mut state = bucket.lock();
        let (next, allowed) = state.try_take(capacity, refill_per_sec, now);
        *state = next;

        if !allowed {
            trace!(key = %key, tokens = next.tokens, "rate limited");
        }
        allowed
    }

    async fn set_policy(&self, key: &str, policy: RateLimitPolicy) -> Result<()> {
        policy.validate()?;
        let previous = self.policies.insert(key.to_string(), policy);
        if previous != Some(policy) {
            // A new policy starts from a full bucket.
            self.buckets.remove(key);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) {
        self.policies.remove(key);
        self.buckets.remove(key);
    }

    fn backend(&self) -> RateLimiterBackend {
        RateLimiterBackend::Memory
    }
}
