//! In-memory stores.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use super::{AttemptStore, SubscriptionStore};
use crate::domain::{AttemptKey, DeliveryAttempt, DeliveryStatus, Subscription};
use crate::{Error, Result};

/// Subscriptions kept in a concurrent map.
#[derive(Debug, Default)]
pub struct MemorySubscriptionStore {
    subscriptions: DashMap<u64, Subscription>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscriptions(subscriptions: impl IntoIterator<Item = Subscription>) -> Self {
        let store = Self::new();
        for sub in subscriptions {
            store.subscriptions.insert(sub.id, sub);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn get(&self, id: u64) -> Result<Option<Subscription>> {
        Ok(self.subscriptions.get(&id).map(|s| s.clone()))
    }

    async fn list_for_user(&self, user_id: u64) -> Result<Vec<Subscription>> {
        let mut subs: Vec<_> = self
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.clone())
            .collect();
        subs.sort_by_key(|s| s.id);
        Ok(subs)
    }

    async fn upsert(&self, subscription: Subscription) -> Result<()> {
        self.subscriptions.insert(subscription.id, subscription);
        Ok(())
    }

    async fn remove(&self, id: u64) -> Result<Option<Subscription>> {
        Ok(self.subscriptions.remove(&id).map(|(_, s)| s))
    }
}

#[derive(Debug)]
struct Record {
    attempt: DeliveryAttempt,
    claimed: bool,
}

/// Attempt records in a concurrent map.
///
/// Claims are taken under the map entry's lock, so two workers can never
/// hold the same key at once.
#[derive(Debug, Default)]
pub struct MemoryAttemptStore {
    records: DashMap<AttemptKey, Record>,
}

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn write_back(&self, attempt: &DeliveryAttempt, keep_claim: bool) -> Result<()> {
        let mut record = self
            .records
            .get_mut(&attempt.key)
            .ok_or_else(|| Error::not_found("DeliveryAttempt", attempt.key.to_string()))?;
        if !record.claimed {
            return Err(Error::validation(format!(
                "attempt {} written back without a claim",
                attempt.key
            )));
        }
        record.attempt = attempt.clone();
        record.claimed = keep_claim;
        Ok(())
    }
}

#[async_trait]
impl AttemptStore for MemoryAttemptStore {
    async fn insert_if_absent(&self, attempt: DeliveryAttempt) -> Result<bool> {
        match self.records.entry(attempt.key) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(Record {
                    attempt,
                    claimed: false,
                });
                Ok(true)
            }
        }
    }

    async fn claim(&self, key: AttemptKey, now: Instant) -> Result<Option<DeliveryAttempt>> {
        let Some(mut record) = self.records.get_mut(&key) else {
            return Ok(None);
        };
        if record.claimed || !record.attempt.is_due(now) {
            return Ok(None);
        }
        record.claimed = true;
        Ok(Some(record.attempt.clone()))
    }

    async fn update(&self, attempt: &DeliveryAttempt) -> Result<()> {
        self.write_back(attempt, true)
    }

    async fn release(&self, attempt: DeliveryAttempt) -> Result<()> {
        self.write_back(&attempt, false)
    }

    async fn get(&self, key: AttemptKey) -> Result<Option<DeliveryAttempt>> {
        Ok(self.records.get(&key).map(|r| r.attempt.clone()))
    }

    async fn due(&self, now: Instant, limit: usize) -> Result<Vec<DeliveryAttempt>> {
        let mut due: Vec<DeliveryAttempt> = self
            .records
            .iter()
            .filter(|r| !r.claimed && r.attempt.is_due(now))
            .map(|r| r.attempt.clone())
            .collect();
        // `None` (never deferred) sorts first.
        due.sort_by_key(|a| (a.next_retry_at, a.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn purge_terminal(&self, completed_before: Instant) -> Result<usize> {
        let before = self.records.len();
        self.records.retain(|_, r| {
            !(r.attempt.is_terminal()
                && r.attempt
                    .completed_at
                    .is_some_and(|at| at < completed_before))
        });
        Ok(before.saturating_sub(self.records.len()))
    }

    async fn list_by_status(
        &self,
        status: DeliveryStatus,
        user_id: Option<u64>,
    ) -> Result<Vec<DeliveryAttempt>> {
        let mut list: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.attempt.status == status)
            .filter(|r| user_id.is_none_or(|id| r.attempt.user_id == id))
            .map(|r| r.attempt.clone())
            .collect();
        list.sort_by_key(|a| (a.created_at, a.key.subscription_id, a.key.article_id));
        Ok(list)
    }

    async fn count_by_status(&self) -> Result<HashMap<DeliveryStatus, usize>> {
        let mut counts = HashMap::new();
        for r in self.records.iter() {
            *counts.entry(r.attempt.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn cancel_subscription(&self, subscription_id: u64) -> Result<usize> {
        let before = self.records.len();
        self.records.retain(|key, r| {
            key.subscription_id != subscription_id || r.claimed || r.attempt.is_terminal()
        });
        Ok(before.saturating_sub(self.records.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Article;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn attempt(sub: u64, article: u64) -> DeliveryAttempt {
        DeliveryAttempt::new(sub, "webhook", Arc::new(Article::new(article, 1, "t")))
    }

    #[tokio::test]
    async fn test_insert_if_absent_is_unique() {
        let store = MemoryAttemptStore::new();
        assert!(store.insert_if_absent(attempt(1, 1)).await.unwrap());
        assert!(!store.insert_if_absent(attempt(1, 1)).await.unwrap());
        assert!(store.insert_if_absent(attempt(2, 1)).await.unwrap());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = MemoryAttemptStore::new();
        store.insert_if_absent(attempt(1, 1)).await.unwrap();
        let key = AttemptKey::new(1, 1);
        let now = Instant::now();

        let claimed = store.claim(key, now).await.unwrap().unwrap();
        assert!(store.claim(key, now).await.unwrap().is_none());
        assert!(store.due(now, 10).await.unwrap().is_empty());

        store.release(claimed).await.unwrap();
        assert!(store.claim(key, now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let store = Arc::new(MemoryAttemptStore::new());
        store.insert_if_absent(attempt(1, 1)).await.unwrap();
        let key = AttemptKey::new(1, 1);

        let mut handles = vec![];
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim(key, Instant::now()).await.unwrap().is_some()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_write_back_requires_claim() {
        let store = MemoryAttemptStore::new();
        let a = attempt(1, 1);
        store.insert_if_absent(a.clone()).await.unwrap();
        assert!(store.release(a).await.is_err());

        let missing = attempt(9, 9);
        assert!(matches!(
            store.update(&missing).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_orders_by_retry_instant() {
        let store = MemoryAttemptStore::new();
        let now = Instant::now();

        let mut later = attempt(1, 1);
        later.status = DeliveryStatus::TransientFailure;
        later.next_retry_at = Some(now + Duration::from_secs(2));
        let mut sooner = attempt(2, 1);
        sooner.status = DeliveryStatus::RateLimited;
        sooner.next_retry_at = Some(now + Duration::from_secs(1));
        let fresh = attempt(3, 1);

        for a in [later, sooner, fresh] {
            store.insert_if_absent(a).await.unwrap();
        }

        let keys = |list: Vec<DeliveryAttempt>| list.into_iter().map(|a| a.key).collect::<Vec<_>>();
        assert_eq!(keys(store.due(now, 10).await.unwrap()), vec![AttemptKey::new(3, 1)]);
        assert_eq!(
            keys(store.due(now + Duration::from_secs(5), 10).await.unwrap()),
            vec![AttemptKey::new(3, 1), AttemptKey::new(2, 1), AttemptKey::new(1, 1)]
        );
        assert_eq!(store.due(now + Duration::from_secs(5), 2).await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_terminal_respects_retention() {
        let store = MemoryAttemptStore::new();
        store.insert_if_absent(attempt(1, 1)).await.unwrap();
        store.insert_if_absent(attempt(2, 1)).await.unwrap();

        let now = Instant::now();
        let mut done = store.claim(AttemptKey::new(1, 1), now).await.unwrap().unwrap();
        done.transition(DeliveryStatus::Sending).unwrap();
        done.transition(DeliveryStatus::Success).unwrap();
        store.release(done).await.unwrap();

        assert_eq!(store.purge_terminal(Instant::now()).await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(store.purge_terminal(Instant::now()).await.unwrap(), 1);

        // The pending attempt is never purged.
        assert!(store.get(AttemptKey::new(2, 1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_counts_and_listing() {
        let store = MemoryAttemptStore::new();
        store.insert_if_absent(attempt(1, 1)).await.unwrap();
        let mut failed = attempt(1, 2);
        failed.status = DeliveryStatus::PermanentFailure;
        store.insert_if_absent(failed).await.unwrap();

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.get(&DeliveryStatus::Pending), Some(&1));
        assert_eq!(counts.get(&DeliveryStatus::PermanentFailure), Some(&1));

        let failures = store
            .list_by_status(DeliveryStatus::PermanentFailure, Some(1))
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert!(
            store
                .list_by_status(DeliveryStatus::PermanentFailure, Some(2))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_cancel_subscription_keeps_terminal_and_claimed() {
        let store = MemoryAttemptStore::new();
        store.insert_if_absent(attempt(1, 1)).await.unwrap();
        store.insert_if_absent(attempt(1, 2)).await.unwrap();
        let mut done = attempt(1, 3);
        done.status = DeliveryStatus::Success;
        store.insert_if_absent(done).await.unwrap();
        store.insert_if_absent(attempt(2, 1)).await.unwrap();

        let _claimed = store
            .claim(AttemptKey::new(1, 2), Instant::now())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(store.cancel_subscription(1).await.unwrap(), 1);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_subscription_store() {
        let store = MemorySubscriptionStore::with_subscriptions([
            Subscription::new(2, 10, "webhook", json!({})),
            Subscription::new(1, 10, "shaarli", json!({})),
            Subscription::new(3, 11, "webhook", json!({})),
        ]);

        let subs = store.list_for_user(10).await.unwrap();
        assert_eq!(subs.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);

        assert!(store.remove(1).await.unwrap().is_some());
        assert!(store.get(1).await.unwrap().is_none());
        assert_eq!(store.len(), 2);
    }
}
