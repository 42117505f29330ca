//! Delivery pipeline.
//!
//! Turns article events into delivery attempts, gates them through the
//! rate limiter, sends them with the subscription's provider and records
//! the outcome. Retries are not scheduled here: a failed or deferred
//! attempt is left waiting with a `next_retry_at` and the retry sweep
//! picks it up.

mod delivery;
mod jobs;

pub use jobs::{CleanupJob, RetrySweepJob};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{Article, AttemptKey, DeliveryAttempt, DeliveryReport, DeliveryStatus, Subscription};
use crate::event_bus::{DispatchEvent, EventBus, EventReceiver};
use crate::provider::{ConfigurationError, Provider, ProviderRegistry};
use crate::rate_limiter::RateLimiter;
use crate::scheduler::{
    DispatchOutcome, JobScheduler, MAX_DELAY_MS, PoolSnapshot, RetryPolicy, WorkerPools,
};
use crate::store::{AttemptStore, MemoryAttemptStore, MemorySubscriptionStore, SubscriptionStore};
use crate::{Error, Result};

/// Name of the event bus subscriber feeding article events to the pipeline.
pub const ARTICLE_CONSUMER: &str = "article-consumer";

/// Pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Deadline of one `send()` call, in milliseconds.
    pub send_timeout_ms: u64,
    /// Deferral after a rate-limit denial, in milliseconds.
    pub rate_limit_delay_ms: u64,
    pub retry: RetryPolicy,
    /// Attempts examined per retry sweep.
    pub sweep_batch_size: usize,
    /// How long terminal attempts are kept, in seconds.
    pub retention_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 30_000,
            rate_limit_delay_ms: 1_000,
            retry: RetryPolicy::default(),
            sweep_batch_size: 256,
            retention_secs: 86_400,
        }
    }
}

impl PipelineConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.send_timeout_ms == 0 {
            return Err(Error::config("send_timeout_ms must be greater than 0"));
        }
        if self.rate_limit_delay_ms == 0 {
            return Err(Error::config("rate_limit_delay_ms must be greater than 0"));
        }
        if self.send_timeout_ms > MAX_DELAY_MS || self.rate_limit_delay_ms > MAX_DELAY_MS {
            return Err(Error::config(format!(
                "send_timeout_ms and rate_limit_delay_ms must be at most {}",
                MAX_DELAY_MS
            )));
        }
        if self.sweep_batch_size == 0 {
            return Err(Error::config("sweep_batch_size must be greater than 0"));
        }
        self.retry.validate()
    }
}

/// Counters exposed by [`DeliveryPipeline::stats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    /// Attempts per status name.
    pub attempts: BTreeMap<String, usize>,
    pub cached_providers: usize,
    pub pools: Vec<PoolSnapshot>,
}

impl PipelineStats {
    pub fn count(&self, status: DeliveryStatus) -> usize {
        self.attempts.get(&status.to_string()).copied().unwrap_or(0)
    }
}

struct CachedProvider {
    subscription: Subscription,
    provider: Arc<dyn Provider>,
}

struct Inner {
    registry: Arc<ProviderRegistry>,
    limiter: Arc<dyn RateLimiter>,
    subscriptions: Arc<dyn SubscriptionStore>,
    attempts: Arc<dyn AttemptStore>,
    pools: Arc<WorkerPools>,
    cancel: CancellationToken,
    providers: DashMap<u64, CachedProvider>,
    outcomes: Option<Arc<EventBus<DispatchEvent>>>,
    config: PipelineConfig,
}

/// Delivery orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct DeliveryPipeline {
    inner: Arc<Inner>,
}

/// Builder for [`DeliveryPipeline`].
pub struct DeliveryPipelineBuilder {
    registry: Arc<ProviderRegistry>,
    limiter: Arc<dyn RateLimiter>,
    subscriptions: Option<Arc<dyn SubscriptionStore>>,
    attempts: Option<Arc<dyn AttemptStore>>,
    outcomes: Option<Arc<EventBus<DispatchEvent>>>,
    config: PipelineConfig,
}

impl DeliveryPipelineBuilder {
    pub fn subscriptions(mut self, store: Arc<dyn SubscriptionStore>) -> Self {
        self.subscriptions = Some(store);
        self
    }

    pub fn attempts(mut self, store: Arc<dyn AttemptStore>) -> Self {
        self.attempts = Some(store);
        self
    }

    /// Publish terminal outcomes on `bus` as [`DispatchEvent::DeliveryFinished`].
    ///
    /// This must not be the bus articles arrive on: outcome events would
    /// take queue slots from the article consumer. [`DeliveryPipeline::install`]
    /// refuses that wiring.
    pub fn outcomes(mut self, bus: Arc<EventBus<DispatchEvent>>) -> Self {
        self.outcomes = Some(bus);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build a pipeline dispatching into `scheduler`'s worker pools.
    pub fn build(self, scheduler: &JobScheduler) -> Result<DeliveryPipeline> {
        self.config.validate()?;
        Ok(DeliveryPipeline {
            inner: Arc::new(Inner {
                registry: self.registry,
                limiter: self.limiter,
                subscriptions: self
                    .subscriptions
                    .unwrap_or_else(|| Arc::new(MemorySubscriptionStore::new())),
                attempts: self
                    .attempts
                    .unwrap_or_else(|| Arc::new(MemoryAttemptStore::new())),
                pools: scheduler.pools(),
                cancel: scheduler.work_token(),
                providers: DashMap::new(),
                outcomes: self.outcomes,
                config: self.config,
            }),
        })
    }
}

impl DeliveryPipeline {
    pub fn builder(
        registry: Arc<ProviderRegistry>,
        limiter: Arc<dyn RateLimiter>,
    ) -> DeliveryPipelineBuilder {
        DeliveryPipelineBuilder {
            registry,
            limiter,
            subscriptions: None,
            attempts: None,
            outcomes: None,
            config: PipelineConfig::default(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Register the retry sweep, the cleanup job and an article consumer
    /// subscribed to `articles` with a queue of `capacity` events.
    pub fn install(
        &self,
        scheduler: &JobScheduler,
        articles: &EventBus<DispatchEvent>,
        capacity: usize,
        sweep_interval: Duration,
        cleanup_interval: Duration,
    ) -> Result<()> {
        let shared_bus = self
            .inner
            .outcomes
            .as_ref()
            .is_some_and(|outcomes| std::ptr::eq(outcomes.as_ref(), articles));
        if shared_bus {
            return Err(Error::config(
                "outcome events must be published on a different bus than articles",
            ));
        }

        let events = articles.subscribe(ARTICLE_CONSUMER, capacity);
        scheduler.every(Arc::new(RetrySweepJob::new(self.clone())), sweep_interval);
        scheduler.every(Arc::new(CleanupJob::new(self.clone())), cleanup_interval);
        let pipeline = self.clone();
        scheduler.spawn_listener(ARTICLE_CONSUMER, move |_stop| pipeline.run_consumer(events));
        Ok(())
    }

    /// Validate and store a subscription.
    ///
    /// The provider is built right away so a bad configuration fails here
    /// instead of on the first delivery. The subscription's rate-limit
    /// policy replaces whatever was installed for it before.
    pub async fn register_subscription(&self, subscription: Subscription) -> Result<()> {
        let provider = self
            .inner
            .registry
            .build(&subscription.provider, &subscription.config)?;

        let key = subscription.rate_limit_key();
        match subscription.rate_limit {
            Some(policy) => self.inner.limiter.set_policy(&key, policy).await?,
            None => self.inner.limiter.remove(&key).await,
        }

        info!(
            subscription_id = subscription.id,
            user_id = subscription.user_id,
            provider = %subscription.provider,
            name = %subscription.display_name(),
            "Registered subscription"
        );

        self.inner.providers.insert(
            subscription.id,
            CachedProvider {
                subscription: subscription.clone(),
                provider,
            },
        );
        self.inner.subscriptions.upsert(subscription).await
    }

    /// Remove a subscription, its cached provider, its rate-limit state and
    /// its waiting attempts.
    pub async fn remove_subscription(&self, id: u64) -> Result<Option<Subscription>> {
        let removed = self.inner.subscriptions.remove(id).await?;
        self.inner.providers.remove(&id);
        self.inner
            .limiter
            .remove(&crate::domain::rate_limit_key(id))
            .await;
        let cancelled = self.inner.attempts.cancel_subscription(id).await?;
        if removed.is_some() {
            info!(subscription_id = id, cancelled, "Removed subscription");
        }
        Ok(removed)
    }

    /// Provider for `subscription`, rebuilt when its configuration changed.
    pub(crate) fn provider_for(
        &self,
        subscription: &Subscription,
    ) -> std::result::Result<Arc<dyn Provider>, ConfigurationError> {
        let cached = self.inner.providers.get(&subscription.id).and_then(|cached| {
            cached
                .subscription
                .same_provider_config(subscription)
                .then(|| cached.provider.clone())
        });
        if let Some(provider) = cached {
            return Ok(provider);
        }

        debug!(subscription_id = subscription.id, "building provider");
        let provider = self
            .inner
            .registry
            .build(&subscription.provider, &subscription.config)?;
        self.inner.providers.insert(
            subscription.id,
            CachedProvider {
                subscription: subscription.clone(),
                provider: provider.clone(),
            },
        );
        Ok(provider)
    }

    /// Create attempts for every subscription matching `article` and try to
    /// dispatch them right away.
    ///
    /// Returns the number of new attempts. A pair that already has an
    /// attempt is left alone.
    pub async fn handle_article(&self, article: Arc<Article>) -> Result<usize> {
        let subscriptions = self.inner.subscriptions.list_for_user(article.user_id).await?;
        let mut created = 0;

        for subscription in subscriptions.iter().filter(|s| s.matches(&article)) {
            let attempt = DeliveryAttempt::new(subscription.id, &subscription.provider, article.clone());
            let key = attempt.key;
            if !self.inner.attempts.insert_if_absent(attempt).await? {
                debug!(attempt = %key, "attempt already exists, skipping");
                continue;
            }
            created += 1;

            match self.dispatch(key, &subscription.provider) {
                DispatchOutcome::Dispatched => {}
                DispatchOutcome::Saturated => {
                    debug!(attempt = %key, provider = %subscription.provider, "pool saturated, left for the retry sweep");
                }
                DispatchOutcome::Closed => {
                    debug!(attempt = %key, "pipeline shutting down, left pending");
                }
            }
        }

        debug!(article_id = article.id, user_id = article.user_id, created, "article handled");
        Ok(created)
    }

    /// Hand an attempt to its provider kind's pool.
    pub fn dispatch(&self, key: AttemptKey, provider_kind: &str) -> DispatchOutcome {
        let pipeline = self.clone();
        self.inner.pools.try_dispatch(provider_kind, async move {
            if let Err(e) = pipeline.process(key).await {
                warn!(attempt = %key, error = %e, "failed to process attempt");
            }
        })
    }

    /// Consume article events until the bus goes away.
    pub async fn run_consumer(self, mut events: EventReceiver<DispatchEvent>) {
        info!(subscriber = %events.name(), "Article consumer started");
        while let Some(event) = events.recv().await {
            match event {
                DispatchEvent::ArticleCreated(article) => {
                    if let Err(e) = self.handle_article(article.clone()).await {
                        warn!(article_id = article.id, error = %e, "failed to handle article");
                    }
                }
                DispatchEvent::DeliveryFinished(_) => {}
            }
        }
        info!("Article consumer stopped");
    }

    /// Dispatch attempts whose retry instant has passed.
    ///
    /// Stops dispatching a kind as soon as its pool is saturated; those
    /// attempts stay waiting for the next sweep.
    pub async fn retry_sweep(&self) -> Result<SweepReport> {
        let due = self
            .inner
            .attempts
            .due(Instant::now(), self.inner.config.sweep_batch_size)
            .await?;

        let mut report = SweepReport {
            due: due.len(),
            ..Default::default()
        };
        let mut saturated: Vec<String> = Vec::new();

        for attempt in due {
            if saturated.contains(&attempt.provider_kind) {
                report.deferred += 1;
                continue;
            }
            match self.dispatch(attempt.key, &attempt.provider_kind) {
                DispatchOutcome::Dispatched => report.dispatched += 1,
                DispatchOutcome::Saturated => {
                    report.deferred += 1;
                    saturated.push(attempt.provider_kind.clone());
                }
                DispatchOutcome::Closed => break,
            }
        }

        if report.due > 0 {
            debug!(
                due = report.due,
                dispatched = report.dispatched,
                deferred = report.deferred,
                "retry sweep"
            );
        }
        Ok(report)
    }

    /// Purge terminal attempts older than the retention window.
    pub async fn cleanup(&self) -> Result<usize> {
        let Some(cutoff) = Instant::now().checked_sub(self.inner.config.retention()) else {
            return Ok(0);
        };
        let purged = self.inner.attempts.purge_terminal(cutoff).await?;
        if purged > 0 {
            info!(purged, "Purged terminal delivery attempts");
        }
        Ok(purged)
    }

    pub async fn attempt(&self, key: AttemptKey) -> Result<Option<DeliveryAttempt>> {
        self.inner.attempts.get(key).await
    }

    /// Permanently failed deliveries of `user_id`.
    pub async fn failures(&self, user_id: u64) -> Result<Vec<DeliveryReport>> {
        let failed = self
            .inner
            .attempts
            .list_by_status(DeliveryStatus::PermanentFailure, Some(user_id))
            .await?;
        Ok(failed.iter().map(DeliveryAttempt::report).collect())
    }

    pub async fn stats(&self) -> Result<PipelineStats> {
        let attempts = self
            .inner
            .attempts
            .count_by_status()
            .await?
            .into_iter()
            .map(|(status, count)| (status.to_string(), count))
            .collect();

        Ok(PipelineStats {
            attempts,
            cached_providers: self.inner.providers.len(),
            pools: self.inner.pools.snapshot(),
        })
    }
}

/// Result of one retry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub due: usize,
    pub dispatched: usize,
    pub deferred: usize,
}
