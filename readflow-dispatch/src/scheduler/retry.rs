//! Retry backoff policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Longest delay any retry or deferral may schedule: one day.
pub const MAX_DELAY_MS: u64 = 86_400_000;

/// Exponential backoff with symmetric jitter and an attempt cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay after the first failure, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound of the pre-jitter delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Failed sends allowed before the attempt is given up.
    pub max_attempts: u32,
    /// Jitter as a fraction of the delay (0.25 = ±25%).
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            max_attempts: 5,
            jitter_ratio: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config("retry max_attempts must be at least 1"));
        }
        if self.base_delay_ms == 0 {
            return Err(Error::config("retry base_delay_ms must be greater than 0"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::config("retry max_delay_ms must be >= base_delay_ms"));
        }
        if self.max_delay_ms > MAX_DELAY_MS {
            return Err(Error::config(format!(
                "retry max_delay_ms must be at most {}",
                MAX_DELAY_MS
            )));
        }
        if !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err(Error::config("retry jitter_ratio must be in [0, 1)"));
        }
        Ok(())
    }

    /// Whether `failures` failed sends exhaust the policy.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }

    /// Pre-jitter delay after the `failures`-th failure (1-based):
    /// `min(max_delay, base * 2^(failures - 1))`.
    pub fn base_delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    /// Delay after the `failures`-th failure, with jitter applied.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let delay_ms = self.base_delay_for(failures).as_millis() as u64;

        let jitter_range = (delay_ms as f64 * self.jitter_ratio) as u64;
        if jitter_range == 0 {
            return Duration::from_millis(delay_ms);
        }

        // Uniform in [-jitter_range, +jitter_range].
        let span = jitter_range.saturating_mul(2).saturating_add(1);
        let offset = rand::random::<u64>() % span;
        let jittered = delay_ms.saturating_add(offset).saturating_sub(jitter_range);
        Duration::from_millis(jittered.max(1))
    }
}
