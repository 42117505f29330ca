use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use readflow_dispatch::config::{DispatchConfig, load_subscriptions, log_filter_from_env_file};
use readflow_dispatch::domain::Article;
use readflow_dispatch::event_bus::{DispatchEvent, EventBus, OverflowPolicy};
use readflow_dispatch::logging::{LoggingHandle, init_logging};
use readflow_dispatch::pipeline::{ARTICLE_CONSUMER, DeliveryPipeline};
use readflow_dispatch::provider::{ProviderContext, ProviderRegistry};
use readflow_dispatch::scheduler::JobScheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    let env_file = dotenvy::dotenv().ok();

    let config = DispatchConfig::from_env().context("invalid configuration")?;
    let (logging, _guard) = init_logging(&config.logging)?;

    let registry = Arc::new(ProviderRegistry::with_builtins(ProviderContext::default()));
    let limiter = config.rate_limiter.build(config.default_rate_limit)?;
    let scheduler = JobScheduler::with_pool_sizes(config.default_pool_size, config.pool_sizes.clone());

    // Outcomes get their own bus and never take article queue slots.
    let bus = EventBus::new(config.overflow);
    let outcome_bus = Arc::new(EventBus::new(OverflowPolicy::Drop));
    let mut outcomes = outcome_bus.subscribe("outcome-log", config.event_bus_capacity);

    let pipeline = DeliveryPipeline::builder(registry, limiter)
        .outcomes(outcome_bus)
        .config(config.pipeline.clone())
        .build(&scheduler)?;

    match &config.subscriptions_path {
        Some(path) => {
            let subscriptions = load_subscriptions(path)
                .with_context(|| format!("failed to load subscriptions from {}", path.display()))?;
            for subscription in subscriptions {
                let id = subscription.id;
                if let Err(e) = pipeline.register_subscription(subscription).await {
                    warn!(subscription_id = id, error = %e, "Skipping invalid subscription");
                }
            }
        }
        None => warn!("READFLOW_SUBSCRIPTIONS is not set, no subscription registered"),
    }

    pipeline.install(
        &scheduler,
        &bus,
        config.event_bus_capacity,
        config.sweep_interval(),
        config.cleanup_interval(),
    )?;
    scheduler.spawn_listener("outcome-log", move |_stop| async move {
        while let Some(event) = outcomes.recv().await {
            if let DispatchEvent::DeliveryFinished(report) = event {
                info!(
                    subscription_id = report.subscription_id,
                    article_id = report.article_id,
                    provider = %report.provider_kind,
                    status = %report.status,
                    attempts = report.attempts,
                    error = report.last_error.as_deref().unwrap_or(""),
                    "Delivery finished"
                );
            }
        }
    });
    match env_file {
        Some(path) => {
            scheduler.spawn_listener("log-reload", move |_stop| {
                reload_filter_on_hangup(logging, path)
            });
        }
        None => debug!(filter = %logging.get_filter(), "No .env file, log filter reload disabled"),
    }
    scheduler.start();
    info!(
        rate_limiter = %config.rate_limiter,
        pool_size = config.default_pool_size,
        "readflow-dispatch started, reading article events from stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Article>(line) {
                        Ok(article) => {
                            let report = bus.publish(DispatchEvent::ArticleCreated(Arc::new(article))).await;
                            if report.dropped > 0 {
                                warn!(dropped = report.dropped, "Article event dropped by a full subscriber");
                            }
                        }
                        Err(e) => warn!(error = %e, "Ignoring malformed article event"),
                    }
                }
                Ok(None) => {
                    info!("Input closed, shutting down");
                    drain_articles(&bus, config.shutdown_timeout()).await;
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read input");
                    break;
                }
            }
        }
    }

    let report = scheduler.shutdown(config.shutdown_timeout()).await;
    if report.is_graceful() {
        info!(elapsed = ?report.elapsed, "Shutdown complete");
    } else {
        warn!(
            abandoned = report.abandoned,
            elapsed = ?report.elapsed,
            "Shutdown complete with abandoned deliveries"
        );
    }
    Ok(())
}

/// Wait until the article consumer has picked up every queued event.
async fn drain_articles(bus: &EventBus<DispatchEvent>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let queued = bus
            .stats()
            .iter()
            .find(|s| s.name == ARTICLE_CONSUMER)
            .map_or(0, |s| s.queued);
        if queued == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    warn!("Article queue not drained before the shutdown timeout");
}

/// Re-apply `READFLOW_LOG_FILTER` from the env file on every SIGHUP.
#[cfg(unix)]
async fn reload_filter_on_hangup(logging: Arc<LoggingHandle>, env_file: PathBuf) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGHUP, log filter reload disabled");
            return;
        }
    };

    while hangup.recv().await.is_some() {
        match log_filter_from_env_file(&env_file) {
            Ok(Some(directive)) => {
                if let Err(e) = logging.set_filter(&directive) {
                    warn!(error = %e, "Keeping current log filter");
                }
            }
            Ok(None) => info!(
                filter = %logging.get_filter(),
                "READFLOW_LOG_FILTER not set in {}, keeping current filter",
                env_file.display()
            ),
            Err(e) => warn!(error = %e, "Failed to reload log filter"),
        }
    }
}

#[cfg(not(unix))]
async fn reload_filter_on_hangup(logging: Arc<LoggingHandle>, env_file: PathBuf) {
    debug!(
        filter = %logging.get_filter(),
        env_file = %env_file.display(),
        "SIGHUP is not available, log filter reload disabled"
    );
}
