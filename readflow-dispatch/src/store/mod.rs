//! Persistence collaborators.
//!
//! The dispatcher only talks to storage through these traits; the crate
//! ships in-memory implementations.

mod memory;

pub use memory::{MemoryAttemptStore, MemorySubscriptionStore};

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::Result;
use crate::domain::{AttemptKey, DeliveryAttempt, DeliveryStatus, Subscription};

/// Read access to outgoing subscriptions.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, id: u64) -> Result<Option<Subscription>>;

    /// All subscriptions owned by `user_id`, enabled or not.
    async fn list_for_user(&self, user_id: u64) -> Result<Vec<Subscription>>;

    async fn upsert(&self, subscription: Subscription) -> Result<()>;

    async fn remove(&self, id: u64) -> Result<Option<Subscription>>;
}

/// Delivery attempt records.
///
/// A record is either free or claimed by exactly one worker. Only the
/// claiming worker may write it back, through [`update`](Self::update) or
/// [`release`](Self::release).
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Insert `attempt` unless a record already exists for its key.
    /// Returns `true` when inserted.
    async fn insert_if_absent(&self, attempt: DeliveryAttempt) -> Result<bool>;

    /// Claim a free record that is waiting and due at `now`.
    async fn claim(&self, key: AttemptKey, now: Instant) -> Result<Option<DeliveryAttempt>>;

    /// Write a claimed record back, keeping the claim.
    async fn update(&self, attempt: &DeliveryAttempt) -> Result<()>;

    /// Write a claimed record back and release the claim.
    async fn release(&self, attempt: DeliveryAttempt) -> Result<()>;

    async fn get(&self, key: AttemptKey) -> Result<Option<DeliveryAttempt>>;

    /// Free records due at `now`, oldest retry instant first.
    async fn due(&self, now: Instant, limit: usize) -> Result<Vec<DeliveryAttempt>>;

    /// Remove terminal records completed before `completed_before`.
    /// Returns the number removed.
    async fn purge_terminal(&self, completed_before: Instant) -> Result<usize>;

    /// Records in `status`, optionally restricted to one user.
    async fn list_by_status(
        &self,
        status: DeliveryStatus,
        user_id: Option<u64>,
    ) -> Result<Vec<DeliveryAttempt>>;

    async fn count_by_status(&self) -> Result<HashMap<DeliveryStatus, usize>>;

    /// Drop every free, non-terminal record of a subscription.
    async fn cancel_subscription(&self, subscription_id: u64) -> Result<usize>;
}
