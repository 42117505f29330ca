//! End-to-end dispatch scenarios.
//!
//! These tests drive the whole pipeline (event bus, scheduler, worker
//! pools, rate limiter and in-memory stores) against scripted providers,
//! on a paused tokio clock so timing assertions are exact.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rstest::rstest;
use serde_json::json;
use tokio::time::Instant;

use readflow_dispatch::Error;
use readflow_dispatch::domain::{Article, AttemptKey, DeliveryStatus, Subscription};
use readflow_dispatch::event_bus::{DispatchEvent, EventBus, OverflowPolicy};
use readflow_dispatch::pipeline::{ARTICLE_CONSUMER, DeliveryPipeline, PipelineConfig};
use readflow_dispatch::provider::{
    Provider, ProviderContext, ProviderDef, ProviderError, ProviderRegistry, SendContext,
};
use readflow_dispatch::rate_limiter::{
    InMemoryBucketStore, RateLimitPolicy, RateLimiter, RateLimiterBackend, SharedRateLimiter,
    TokioClock,
};
use readflow_dispatch::scheduler::{JobScheduler, RetryPolicy};

const KIND: &str = "scripted";
const USER: u64 = 42;

/// What a scripted send does.
#[derive(Debug, Clone, Copy)]
enum Step {
    Succeed,
    Transient,
    Permanent,
    Panic,
    /// Never completes on its own.
    Hang,
}

struct ScriptedProvider {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: Mutex<Vec<Instant>>,
}

impl ScriptedProvider {
    fn new(fallback: Step) -> Arc<Self> {
        Self::with_script(&[], fallback)
    }

    fn with_script(steps: &[Step], fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.iter().copied().collect()),
            fallback,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<Instant> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn kind(&self) -> &str {
        KIND
    }

    async fn send(&self, _ctx: &SendContext, _article: &Article) -> Result<(), ProviderError> {
        self.calls.lock().push(Instant::now());
        let step = self.script.lock().pop_front().unwrap_or(self.fallback);
        match step {
            Step::Succeed => Ok(()),
            Step::Transient => Err(ProviderError::transient("downstream unavailable")),
            Step::Permanent => Err(ProviderError::permanent("bad status code: 400 - rejected")),
            Step::Panic => panic!("provider bug"),
            Step::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

fn scripted_def(provider: Arc<ScriptedProvider>) -> ProviderDef {
    ProviderDef::new("Scripted", "test provider", move |_config, _ctx| {
        Ok(provider.clone() as Arc<dyn Provider>)
    })
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        send_timeout_ms: 5_000,
        rate_limit_delay_ms: 1_000,
        retry: RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            max_attempts: 3,
            jitter_ratio: 0.0,
        },
        sweep_batch_size: 64,
        retention_secs: 60,
    }
}

struct Harness {
    scheduler: JobScheduler,
    pipeline: DeliveryPipeline,
    articles: Arc<EventBus<DispatchEvent>>,
    outcomes: Arc<EventBus<DispatchEvent>>,
    registry: Arc<ProviderRegistry>,
}

/// Limiter for `backend` whose buckets follow the paused test clock.
fn limiter_for(backend: RateLimiterBackend) -> Arc<dyn RateLimiter> {
    match backend {
        RateLimiterBackend::Shared => Arc::new(SharedRateLimiter::with_clock(
            Arc::new(InMemoryBucketStore::new()),
            RateLimitPolicy::None,
            Arc::new(TokioClock::new()),
        )),
        other => other
            .build(RateLimitPolicy::None)
            .expect("Failed to build rate limiter"),
    }
}

fn harness_with(
    provider: Arc<ScriptedProvider>,
    config: PipelineConfig,
    backend: RateLimiterBackend,
) -> Harness {
    harness_full(provider, config, backend, 64)
}

fn harness_full(
    provider: Arc<ScriptedProvider>,
    config: PipelineConfig,
    backend: RateLimiterBackend,
    article_capacity: usize,
) -> Harness {
    let registry = Arc::new(ProviderRegistry::new(ProviderContext::default()));
    registry.register(KIND, scripted_def(provider));

    let scheduler = JobScheduler::with_pool_sizes(8, HashMap::new());
    let articles = Arc::new(EventBus::new(OverflowPolicy::Drop));
    let outcomes = Arc::new(EventBus::new(OverflowPolicy::Drop));
    let pipeline = DeliveryPipeline::builder(registry.clone(), limiter_for(backend))
        .outcomes(outcomes.clone())
        .config(config)
        .build(&scheduler)
        .expect("Failed to build pipeline");

    pipeline
        .install(
            &scheduler,
            &articles,
            article_capacity,
            Duration::from_millis(100),
            Duration::from_secs(3600),
        )
        .expect("Failed to install pipeline");
    scheduler.start();

    Harness {
        scheduler,
        pipeline,
        articles,
        outcomes,
        registry,
    }
}

fn harness(provider: Arc<ScriptedProvider>, config: PipelineConfig) -> Harness {
    harness_with(provider, config, RateLimiterBackend::Memory)
}

fn article(id: u64) -> Arc<Article> {
    Arc::new(Article::new(id, USER, format!("Article {}", id)).with_url("https://example.com/a"))
}

fn subscription(id: u64) -> Subscription {
    Subscription::new(id, USER, KIND, json!({}))
}

async fn attempt_status(pipeline: &DeliveryPipeline, key: AttemptKey) -> Option<DeliveryStatus> {
    pipeline
        .attempt(key)
        .await
        .expect("Failed to read attempt")
        .map(|a| a.status)
}

/// Poll until every attempt in `keys` is terminal.
async fn wait_terminal(pipeline: &DeliveryPipeline, keys: &[AttemptKey]) {
    for _ in 0..1_000 {
        let mut done = true;
        for key in keys {
            if !attempt_status(pipeline, *key)
                .await
                .is_some_and(DeliveryStatus::is_terminal)
            {
                done = false;
                break;
            }
        }
        if done {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("attempts {:?} did not reach a terminal status", keys);
}

async fn wait_calls(provider: &ScriptedProvider, count: usize) {
    for _ in 0..1_000 {
        if provider.calls().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("provider saw {} calls, expected {}", provider.calls().len(), count);
}

mod rate_limiting {
    use super::*;

    #[rstest]
    #[case::memory(RateLimiterBackend::Memory)]
    #[case::shared(RateLimiterBackend::Shared)]
    #[tokio::test(start_paused = true)]
    async fn test_burst_is_spaced_by_rate_limit(#[case] backend: RateLimiterBackend) {
        let provider = ScriptedProvider::new(Step::Succeed);
        let h = harness_with(provider.clone(), fast_config(), backend);
        h.pipeline
            .register_subscription(
                subscription(1).with_rate_limit(RateLimitPolicy::per_second(1.0, 1).unwrap()),
            )
            .await
            .unwrap();

        let mut keys = Vec::new();
        for id in 1..=5 {
            assert_eq!(h.pipeline.handle_article(article(id)).await.unwrap(), 1);
            keys.push(AttemptKey::new(1, id));
        }

        wait_terminal(&h.pipeline, &keys).await;

        for key in &keys {
            let attempt = h.pipeline.attempt(*key).await.unwrap().unwrap();
            assert_eq!(attempt.status, DeliveryStatus::Success);
            // Deferrals are not counted as sends.
            assert_eq!(attempt.attempts, 1);
        }

        let calls = provider.calls();
        assert_eq!(calls.len(), 5);
        for pair in calls.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(gap >= Duration::from_millis(999), "sends only {:?} apart", gap);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_attempt_waits_in_rate_limited_status() {
        let provider = ScriptedProvider::new(Step::Succeed);
        let h = harness(provider.clone(), fast_config());
        h.pipeline
            .register_subscription(
                subscription(1).with_rate_limit(RateLimitPolicy::per_second(0.1, 1).unwrap()),
            )
            .await
            .unwrap();

        h.pipeline.handle_article(article(1)).await.unwrap();
        h.pipeline.handle_article(article(2)).await.unwrap();
        wait_calls(&provider, 1).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut statuses = vec![
            attempt_status(&h.pipeline, AttemptKey::new(1, 1)).await.unwrap(),
            attempt_status(&h.pipeline, AttemptKey::new(1, 2)).await.unwrap(),
        ];
        statuses.sort_by_key(|s| s.to_string());
        assert_eq!(
            statuses,
            vec![DeliveryStatus::RateLimited, DeliveryStatus::Success]
        );
        assert_eq!(provider.calls().len(), 1);
    }
}

mod retries {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_bounded() {
        let provider = ScriptedProvider::new(Step::Transient);
        let h = harness(provider.clone(), fast_config());
        h.pipeline.register_subscription(subscription(1)).await.unwrap();

        h.pipeline.handle_article(article(1)).await.unwrap();
        let key = AttemptKey::new(1, 1);
        wait_terminal(&h.pipeline, &[key]).await;

        let attempt = h.pipeline.attempt(key).await.unwrap().unwrap();
        assert_eq!(attempt.status, DeliveryStatus::PermanentFailure);
        assert_eq!(attempt.attempts, 3);
        assert!(
            attempt
                .last_error
                .as_deref()
                .unwrap()
                .starts_with("retries exhausted")
        );

        let calls = provider.calls();
        assert_eq!(calls.len(), 3);
        // Backoff doubles: 100ms, then 200ms.
        assert!(calls[1].duration_since(calls[0]) >= Duration::from_millis(100));
        assert!(calls[2].duration_since(calls[1]) >= Duration::from_millis(200));

        // Nothing is sent once the attempt is terminal.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(provider.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let provider = ScriptedProvider::with_script(&[Step::Transient], Step::Succeed);
        let h = harness(provider.clone(), fast_config());
        h.pipeline.register_subscription(subscription(1)).await.unwrap();

        h.pipeline.handle_article(article(1)).await.unwrap();
        let key = AttemptKey::new(1, 1);
        wait_terminal(&h.pipeline, &[key]).await;

        let attempt = h.pipeline.attempt(key).await.unwrap().unwrap();
        assert_eq!(attempt.status, DeliveryStatus::Success);
        assert_eq!(attempt.attempts, 2);
        assert_eq!(attempt.last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let provider = ScriptedProvider::new(Step::Permanent);
        let h = harness(provider.clone(), fast_config());
        h.pipeline.register_subscription(subscription(1)).await.unwrap();

        h.pipeline.handle_article(article(1)).await.unwrap();
        let key = AttemptKey::new(1, 1);
        wait_terminal(&h.pipeline, &[key]).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let attempt = h.pipeline.attempt(key).await.unwrap().unwrap();
        assert_eq!(attempt.status, DeliveryStatus::PermanentFailure);
        assert_eq!(attempt.attempts, 1);
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_provider_counts_as_transient() {
        let provider = ScriptedProvider::with_script(&[Step::Panic], Step::Succeed);
        let h = harness(provider.clone(), fast_config());
        h.pipeline.register_subscription(subscription(1)).await.unwrap();

        h.pipeline.handle_article(article(1)).await.unwrap();
        let key = AttemptKey::new(1, 1);
        wait_terminal(&h.pipeline, &[key]).await;

        let attempt = h.pipeline.attempt(key).await.unwrap().unwrap();
        assert_eq!(attempt.status, DeliveryStatus::Success);
        assert_eq!(attempt.attempts, 2);
        assert_eq!(provider.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_counts_as_transient() {
        let provider = ScriptedProvider::new(Step::Hang);
        let mut config = fast_config();
        config.send_timeout_ms = 500;
        config.retry.max_attempts = 1;
        let h = harness(provider.clone(), config);
        h.pipeline.register_subscription(subscription(1)).await.unwrap();

        h.pipeline.handle_article(article(1)).await.unwrap();
        let key = AttemptKey::new(1, 1);
        wait_terminal(&h.pipeline, &[key]).await;

        let attempt = h.pipeline.attempt(key).await.unwrap().unwrap();
        assert_eq!(attempt.status, DeliveryStatus::PermanentFailure);
        assert!(attempt.last_error.as_deref().unwrap().contains("timed out"));
    }
}

mod attempts {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_one_attempt_per_subscription_and_article() {
        let provider = ScriptedProvider::new(Step::Succeed);
        let h = harness(provider.clone(), fast_config());
        h.pipeline.register_subscription(subscription(1)).await.unwrap();

        let shared = article(1);
        let results = futures::future::join_all(
            (0..10).map(|_| h.pipeline.handle_article(shared.clone())),
        )
        .await;
        let created: usize = results.into_iter().map(|r| r.unwrap()).sum();
        assert_eq!(created, 1);

        wait_terminal(&h.pipeline, &[AttemptKey::new(1, 1)]).await;
        assert_eq!(h.pipeline.handle_article(shared).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_owner_subscriptions_receive_article() {
        let provider = ScriptedProvider::new(Step::Succeed);
        let h = harness(provider.clone(), fast_config());
        h.pipeline.register_subscription(subscription(1)).await.unwrap();
        h.pipeline
            .register_subscription(Subscription::new(2, USER + 1, KIND, json!({})))
            .await
            .unwrap();
        let mut disabled = subscription(3);
        disabled.enabled = false;
        h.pipeline.register_subscription(disabled).await.unwrap();

        assert_eq!(h.pipeline.handle_article(article(1)).await.unwrap(), 1);
        assert!(h.pipeline.attempt(AttemptKey::new(2, 1)).await.unwrap().is_none());
        assert!(h.pipeline.attempt(AttemptKey::new(3, 1)).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removing_subscription_cancels_waiting_attempts() {
        let provider = ScriptedProvider::new(Step::Transient);
        let mut config = fast_config();
        config.retry.base_delay_ms = 1_000;
        config.retry.max_attempts = 5;
        let h = harness(provider.clone(), config);
        h.pipeline.register_subscription(subscription(1)).await.unwrap();

        h.pipeline.handle_article(article(1)).await.unwrap();
        let key = AttemptKey::new(1, 1);
        for _ in 0..100 {
            if attempt_status(&h.pipeline, key).await == Some(DeliveryStatus::TransientFailure) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            attempt_status(&h.pipeline, key).await,
            Some(DeliveryStatus::TransientFailure)
        );

        assert!(h.pipeline.remove_subscription(1).await.unwrap().is_some());
        assert!(h.pipeline.attempt(key).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_purges_after_retention() {
        let provider = ScriptedProvider::new(Step::Succeed);
        let h = harness(provider, fast_config());
        h.pipeline.register_subscription(subscription(1)).await.unwrap();

        h.pipeline.handle_article(article(1)).await.unwrap();
        let key = AttemptKey::new(1, 1);
        wait_terminal(&h.pipeline, &[key]).await;

        assert_eq!(h.pipeline.cleanup().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(h.pipeline.cleanup().await.unwrap(), 1);
        assert!(h.pipeline.attempt(key).await.unwrap().is_none());
    }
}

mod registry {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_last_registration_wins() {
        let first = ScriptedProvider::new(Step::Permanent);
        let second = ScriptedProvider::new(Step::Succeed);
        let h = harness(first.clone(), fast_config());
        h.registry.register(KIND, scripted_def(second.clone()));

        let listed = h.registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].kind, KIND);

        h.pipeline.register_subscription(subscription(1)).await.unwrap();
        h.pipeline.handle_article(article(1)).await.unwrap();
        wait_terminal(&h.pipeline, &[AttemptKey::new(1, 1)]).await;

        assert_eq!(
            attempt_status(&h.pipeline, AttemptKey::new(1, 1)).await,
            Some(DeliveryStatus::Success)
        );
        assert!(first.calls().is_empty());
        assert_eq!(second.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_configuration_fails_registration() {
        let registry = Arc::new(ProviderRegistry::with_builtins(ProviderContext::default()));
        let scheduler = JobScheduler::with_pool_sizes(1, HashMap::new());
        let limiter = RateLimiterBackend::Memory.build(RateLimitPolicy::None).unwrap();
        let pipeline = DeliveryPipeline::builder(registry, limiter)
            .build(&scheduler)
            .unwrap();

        let err = pipeline
            .register_subscription(Subscription::new(1, USER, "webhook", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderConfiguration(_)));

        let err = pipeline
            .register_subscription(Subscription::new(2, USER, "carrier-pigeon", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderConfiguration(_)));

        // Nothing was stored for the rejected subscriptions.
        assert_eq!(pipeline.handle_article(article(1)).await.unwrap(), 0);
    }
}

mod shutdown {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_bounded_and_returns_attempts_to_pending() {
        let provider = ScriptedProvider::new(Step::Hang);
        let h = harness(provider.clone(), fast_config());
        h.pipeline.register_subscription(subscription(1)).await.unwrap();

        for id in 1..=3 {
            h.pipeline.handle_article(article(id)).await.unwrap();
        }
        wait_calls(&provider, 3).await;

        let timeout = Duration::from_secs(1);
        let report = h.scheduler.shutdown(timeout).await;

        assert_eq!(report.in_flight, 3);
        assert!(report.is_graceful());
        assert!(report.elapsed >= timeout);
        assert!(report.elapsed <= timeout + Duration::from_millis(200));

        for id in 1..=3 {
            let attempt = h.pipeline.attempt(AttemptKey::new(1, id)).await.unwrap().unwrap();
            assert_eq!(attempt.status, DeliveryStatus::Pending);
            assert_eq!(attempt.attempts, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_dispatch_after_shutdown() {
        let provider = ScriptedProvider::new(Step::Succeed);
        let h = harness(provider.clone(), fast_config());
        h.pipeline.register_subscription(subscription(1)).await.unwrap();

        let report = h.scheduler.shutdown(Duration::from_secs(1)).await;
        assert!(report.is_graceful());

        assert_eq!(h.pipeline.handle_article(article(1)).await.unwrap(), 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(provider.calls().is_empty());
        assert_eq!(
            attempt_status(&h.pipeline, AttemptKey::new(1, 1)).await,
            Some(DeliveryStatus::Pending)
        );
    }
}

mod visibility {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_outcome_published_for_bus_article() {
        let provider = ScriptedProvider::new(Step::Succeed);
        let h = harness(provider, fast_config());
        let mut outcomes = h.outcomes.subscribe("outcomes", 16);
        h.pipeline.register_subscription(subscription(1)).await.unwrap();

        let report = h.articles.publish(DispatchEvent::ArticleCreated(article(7))).await;
        assert_eq!(report.dropped, 0);

        let finished = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match outcomes.recv().await {
                    Some(DispatchEvent::DeliveryFinished(report)) => return report,
                    Some(_) => continue,
                    None => panic!("bus closed"),
                }
            }
        })
        .await
        .expect("no outcome published");

        assert_eq!(finished.subscription_id, 1);
        assert_eq!(finished.article_id, 7);
        assert_eq!(finished.status, DeliveryStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcomes_never_take_article_queue_slots() {
        let provider = ScriptedProvider::new(Step::Succeed);
        let h = harness_full(provider, fast_config(), RateLimiterBackend::Memory, 1);
        let mut outcomes = h.outcomes.subscribe("outcomes", 16);
        h.pipeline.register_subscription(subscription(1)).await.unwrap();

        for id in 1..=3 {
            let report = h.articles.publish(DispatchEvent::ArticleCreated(article(id))).await;
            assert_eq!(report.delivered, 1);
            assert_eq!(report.dropped, 0);
            wait_terminal(&h.pipeline, &[AttemptKey::new(1, id)]).await;

            let finished = tokio::time::timeout(Duration::from_secs(10), outcomes.recv())
                .await
                .expect("no outcome published");
            assert!(matches!(
                finished,
                Some(DispatchEvent::DeliveryFinished(report)) if report.article_id == id
            ));
        }

        let consumer = h
            .articles
            .stats()
            .into_iter()
            .find(|s| s.name == ARTICLE_CONSUMER)
            .unwrap();
        assert_eq!(consumer.delivered, 3);
        assert_eq!(consumer.dropped, 0);
    }

    #[tokio::test]
    async fn test_install_rejects_outcomes_on_article_bus() {
        let registry = Arc::new(ProviderRegistry::new(ProviderContext::default()));
        let scheduler = JobScheduler::with_pool_sizes(1, HashMap::new());
        let bus = Arc::new(EventBus::new(OverflowPolicy::Drop));
        let pipeline = DeliveryPipeline::builder(registry, limiter_for(RateLimiterBackend::None))
            .outcomes(bus.clone())
            .build(&scheduler)
            .unwrap();

        let err = pipeline
            .install(&scheduler, &bus, 8, Duration::from_secs(1), Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_and_stats() {
        let provider = ScriptedProvider::with_script(&[Step::Permanent], Step::Succeed);
        let h = harness(provider, fast_config());
        h.pipeline.register_subscription(subscription(1)).await.unwrap();
        h.pipeline.register_subscription(subscription(2)).await.unwrap();

        h.pipeline.handle_article(article(1)).await.unwrap();
        wait_terminal(
            &h.pipeline,
            &[AttemptKey::new(1, 1), AttemptKey::new(2, 1)],
        )
        .await;

        let failures = h.pipeline.failures(USER).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].status, DeliveryStatus::PermanentFailure);
        assert_eq!(failures[0].attempts, 1);
        assert!(h.pipeline.failures(USER + 1).await.unwrap().is_empty());

        let stats = h.pipeline.stats().await.unwrap();
        assert_eq!(stats.count(DeliveryStatus::Success), 1);
        assert_eq!(stats.count(DeliveryStatus::PermanentFailure), 1);
        assert_eq!(stats.count(DeliveryStatus::Pending), 0);
        assert_eq!(stats.cached_providers, 2);
        let pool = stats.pools.iter().find(|p| p.kind == KIND).unwrap();
        assert_eq!(pool.size, 8);
        assert_eq!(pool.busy, 0);
    }
}
