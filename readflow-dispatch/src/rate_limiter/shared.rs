//! Rate limiter whose buckets and policies live in a shared store.
//!
//! Several limiter instances (or processes, given an external store) can
//! point at the same [`BucketStore`]. Bucket updates are optimistic: read
//! the bucket, compute the next state, then compare-and-swap it back,
//! retrying when another writer got there first. Bucket timestamps come
//! from the limiter's [`Clock`]; the default [`SystemClock`] is comparable
//! across processes.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, trace};

use super::{BucketState, Clock, RateLimitPolicy, RateLimiter, RateLimiterBackend, SystemClock};
use crate::Result;

/// Maximum number of compare-and-swap rounds before giving up on a call.
const MAX_CAS_ATTEMPTS: usize = 32;

/// Storage for bucket states and per-key policies.
///
/// Both [`BucketState`] and [`RateLimitPolicy`] are serde types, so an
/// implementation may keep them in any external key-value store.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Load the current state of a bucket, if any.
    async fn load(&self, key: &str) -> Option<BucketState>;

    /// Replace the bucket with `new` only if it still equals `expected`
    /// (`None` meaning "absent"). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<BucketState>,
        new: BucketState,
    ) -> bool;

    /// Drop a bucket.
    async fn remove(&self, key: &str);

    /// Policy installed for `key`, if any.
    async fn load_policy(&self, key: &str) -> Option<RateLimitPolicy>;

    /// Install a policy for `key`, returning the one it replaced.
    async fn store_policy(&self, key: &str, policy: RateLimitPolicy) -> Option<RateLimitPolicy>;

    /// Drop the policy for `key`.
    async fn remove_policy(&self, key: &str);
}

/// [`BucketStore`] kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryBucketStore {
    buckets: DashMap<String, BucketState>,
    policies: DashMap<String, RateLimitPolicy>,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn load(&self, key: &str) -> Option<BucketState> {
        self.buckets.get(key).map(|b| *b)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<BucketState>,
        new: BucketState,
    ) -> bool {
        match (self.buckets.entry(key.to_string()), expected) {
            (Entry::Occupied(mut entry), Some(expected)) if *entry.get() == expected => {
                entry.insert(new);
                true
            }
            (Entry::Vacant(entry), None) => {
                entry.insert(new);
                true
            }
            _ => false,
        }
    }

    async fn remove(&self, key: &str) {
        self.buckets.remove(key);
    }

    async fn load_policy(&self, key: &str) -> Option<RateLimitPolicy> {
        self.policies.get(key).map(|p| *p)
    }

    async fn store_policy(&self, key: &str, policy: RateLimitPolicy) -> Option<RateLimitPolicy> {
        self.policies.insert(key.to_string(), policy)
    }

    async fn remove_policy(&self, key: &str) {
        self.policies.remove(key);
    }
}

/// Rate limiter backed by a [`BucketStore`].
///
/// Per-key policies are read from the store on every call, so a policy set
/// through one instance applies to all of them. Keys without a stored policy
/// use this instance's default.
pub struct SharedRateLimiter {
    store: Arc<dyn BucketStore>,
    default_policy: RateLimitPolicy,
    clock: Arc<dyn Clock>,
}

impl SharedRateLimiter {
    /// Limiter over `store`, timestamping buckets with the wall clock.
    pub fn new(store: Arc<dyn BucketStore>, default_policy: RateLimitPolicy) -> Self {
        Self::with_clock(store, default_policy, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn BucketStore>,
        default_policy: RateLimitPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            default_policy,
            clock,
        }
    }

    async fn policy_for(&self, key: &str) -> RateLimitPolicy {
        self.store
            .load_policy(key)
            .await
            .unwrap_or(self.default_policy)
    }
}

#[async_trait]
impl RateLimiter for SharedRateLimiter {
    async fn allow(&self, key: &str) -> bool {
        let RateLimitPolicy::TokenBucket {
            capacity,
            refill_per_sec,
        } = self.policy_for(key).await
        else {
            return true;
        };

        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now_millis();
            let current = self.store.load(key).await;
            let state = current.unwrap_or_else(|| BucketState::full(capacity, now));
            let (next, allowed) = state.try_take(capacity, refill_per_sec, now);

            if self.store.compare_and_swap(key, current, next).await {
                if !allowed {
                    trace!(key = %key, tokens = next.tokens, "rate limited");
                }
                return allowed;
            }
        }

        // Deny under heavy contention rather than over-admit.
        debug!(key = %key, "rate limiter contention, denying");
        false
    }

    async fn set_policy(&self, key: &str, policy: RateLimitPolicy) -> Result<()> {
        policy.validate()?;
        let previous = self.store.store_policy(key, policy).await;
        if previous != Some(policy) {
            // A new policy starts from a full bucket.
            self.store.remove(key).await;
        }
        Ok(())
    }

    async fn remove(&self, key: &str) {
        self.store.remove_policy(key).await;
        self.store.remove(key).await;
    }

    fn backend(&self) -> RateLimiterBackend {
        RateLimiterBackend::Shared
    }
}
