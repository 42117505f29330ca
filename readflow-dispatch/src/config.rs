//! Runtime configuration.
//!
//! Every setting has a default; `READFLOW_*` environment variables override
//! them. Subscriptions for the binary come from a separate JSON file.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::Subscription;
use crate::event_bus::OverflowPolicy;
use crate::logging::LoggingConfig;
use crate::pipeline::PipelineConfig;
use crate::rate_limiter::{RateLimitPolicy, RateLimiterBackend};
use crate::{Error, Result};

/// Prefix of every environment variable read by [`DispatchConfig::from_env`].
pub const ENV_PREFIX: &str = "READFLOW_";

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub pipeline: PipelineConfig,
    /// Period of the retry sweep, in milliseconds.
    pub sweep_interval_ms: u64,
    /// Period of terminal-attempt cleanup, in seconds.
    pub cleanup_interval_secs: u64,
    /// Worker pool size for provider kinds without an explicit entry.
    pub default_pool_size: usize,
    /// Worker pool size per provider kind.
    pub pool_sizes: HashMap<String, usize>,
    /// Queue capacity of each event bus subscriber.
    pub event_bus_capacity: usize,
    pub overflow: OverflowPolicy,
    pub rate_limiter: RateLimiterBackend,
    /// Policy for subscriptions that do not carry their own.
    pub default_rate_limit: RateLimitPolicy,
    pub shutdown_timeout_secs: u64,
    pub logging: LoggingConfig,
    /// JSON file holding the subscriptions to register at startup.
    pub subscriptions_path: Option<PathBuf>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            sweep_interval_ms: 1_000,
            cleanup_interval_secs: 600,
            default_pool_size: 4,
            pool_sizes: HashMap::new(),
            event_bus_capacity: 1_024,
            overflow: OverflowPolicy::Drop,
            rate_limiter: RateLimiterBackend::Memory,
            default_rate_limit: RateLimitPolicy::None,
            shutdown_timeout_secs: 10,
            logging: LoggingConfig::default(),
            subscriptions_path: None,
        }
    }
}

impl DispatchConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| -> Option<String> {
            lookup(&format!("{ENV_PREFIX}{suffix}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();
        let pipeline = &mut config.pipeline;
        apply(&mut pipeline.send_timeout_ms, &get, "SEND_TIMEOUT_MS")?;
        apply(&mut pipeline.rate_limit_delay_ms, &get, "RATE_LIMIT_DELAY_MS")?;
        apply(&mut pipeline.retry.base_delay_ms, &get, "RETRY_BASE_DELAY_MS")?;
        apply(&mut pipeline.retry.max_delay_ms, &get, "RETRY_MAX_DELAY_MS")?;
        apply(&mut pipeline.retry.max_attempts, &get, "RETRY_MAX_ATTEMPTS")?;
        apply(&mut pipeline.retry.jitter_ratio, &get, "RETRY_JITTER_RATIO")?;
        apply(&mut pipeline.sweep_batch_size, &get, "SWEEP_BATCH_SIZE")?;
        apply(&mut pipeline.retention_secs, &get, "RETENTION_SECS")?;

        apply(&mut config.sweep_interval_ms, &get, "SWEEP_INTERVAL_MS")?;
        apply(&mut config.cleanup_interval_secs, &get, "CLEANUP_INTERVAL_SECS")?;
        apply(&mut config.default_pool_size, &get, "POOL_SIZE")?;
        apply(&mut config.event_bus_capacity, &get, "EVENT_BUS_CAPACITY")?;
        apply(&mut config.rate_limiter, &get, "RATE_LIMITER")?;
        apply(&mut config.shutdown_timeout_secs, &get, "SHUTDOWN_TIMEOUT_SECS")?;

        if let Some(raw) = get("POOL_SIZES") {
            config.pool_sizes = parse_pool_sizes(&raw)?;
        }
        if let Some(raw) = get("OVERFLOW") {
            config.overflow = parse_overflow(&raw)?;
        }
        if let Some(raw) = get("RATE_LIMIT_PER_SEC") {
            let refill_per_sec = parse_value("RATE_LIMIT_PER_SEC", &raw)?;
            let capacity = match get("RATE_LIMIT_BURST") {
                Some(raw) => parse_value("RATE_LIMIT_BURST", &raw)?,
                None => 1,
            };
            config.default_rate_limit = RateLimitPolicy::TokenBucket {
                capacity,
                refill_per_sec,
            };
        }

        if let Some(filter) = get("LOG_FILTER") {
            config.logging.filter = filter;
        }
        apply(&mut config.logging.format, &get, "LOG_FORMAT")?;
        config.logging.dir = get("LOG_DIR").map(PathBuf::from);
        config.subscriptions_path = get("SUBSCRIPTIONS").map(PathBuf::from);

        config.validate()?;
        debug!(?config, "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        if self.sweep_interval_ms == 0 {
            return Err(Error::config("sweep_interval_ms must be greater than 0"));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(Error::config("cleanup_interval_secs must be greater than 0"));
        }
        if self.default_pool_size == 0 {
            return Err(Error::config("default_pool_size must be greater than 0"));
        }
        if let Some((kind, _)) = self.pool_sizes.iter().find(|(_, size)| **size == 0) {
            return Err(Error::config(format!(
                "pool size for '{}' must be greater than 0",
                kind
            )));
        }
        if self.event_bus_capacity == 0 {
            return Err(Error::config("event_bus_capacity must be greater than 0"));
        }
        if let OverflowPolicy::Block { timeout_ms: 0 } = self.overflow {
            return Err(Error::config("overflow block timeout must be greater than 0"));
        }
        self.default_rate_limit
            .validate()
            .map_err(|e| Error::config(format!("default_rate_limit: {}", e)))?;
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn apply<T, G>(target: &mut T, get: &G, suffix: &str) -> Result<()>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(suffix) {
        *target = parse_value(suffix, &raw)?;
    }
    Ok(())
}

fn parse_value<T>(suffix: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse().map_err(|e| {
        Error::config(format!(
            "invalid value '{}' for {}{}: {}",
            raw, ENV_PREFIX, suffix, e
        ))
    })
}

/// Parse `kind=size` pairs separated by commas, e.g. `webhook=8,shaarli=2`.
fn parse_pool_sizes(raw: &str) -> Result<HashMap<String, usize>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (kind, size) = pair.split_once('=').ok_or_else(|| {
                Error::config(format!("invalid pool size entry '{}', expected kind=size", pair))
            })?;
            let size = parse_value("POOL_SIZES", size.trim())?;
            Ok((kind.trim().to_string(), size))
        })
        .collect()
}

/// Parse `drop` or `block:<timeout_ms>`.
fn parse_overflow(raw: &str) -> Result<OverflowPolicy> {
    match raw.split_once(':') {
        None if raw.eq_ignore_ascii_case("drop") => Ok(OverflowPolicy::Drop),
        None if raw.eq_ignore_ascii_case("block") => Ok(OverflowPolicy::Block { timeout_ms: 1_000 }),
        Some((mode, timeout)) if mode.eq_ignore_ascii_case("block") => Ok(OverflowPolicy::Block {
            timeout_ms: parse_value("OVERFLOW", timeout.trim())?,
        }),
        _ => Err(Error::config(format!(
            "invalid overflow policy '{}', expected drop or block:<ms>",
            raw
        ))),
    }
}

/// Read subscriptions from a JSON array file.
pub fn load_subscriptions(path: &Path) -> Result<Vec<Subscription>> {
    let content = std::fs::read_to_string(path)?;
    let subscriptions: Vec<Subscription> = serde_json::from_str(&content)?;

    let mut seen = HashSet::new();
    if let Some(dup) = subscriptions.iter().find(|s| !seen.insert(s.id)) {
        return Err(Error::validation(format!(
            "duplicate subscription id {} in {}",
            dup.id,
            path.display()
        )));
    }
    Ok(subscriptions)
}

/// Read `READFLOW_LOG_FILTER` from a dotenv file without touching the
/// process environment. `None` when the file does not set it.
pub fn log_filter_from_env_file(path: &Path) -> Result<Option<String>> {
    let name = format!("{}LOG_FILTER", ENV_PREFIX);
    let entries = dotenvy::from_path_iter(path)
        .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;

    let mut filter = None;
    for entry in entries {
        let (key, value) = entry
            .map_err(|e| Error::config(format!("invalid line in {}: {}", path.display(), e)))?;
        if key == name && !value.trim().is_empty() {
            filter = Some(value.trim().to_string());
        }
    }
    Ok(filter)
}
