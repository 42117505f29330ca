//! Token bucket arithmetic shared by every limiter backend.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Millisecond time source for bucket refills.
///
/// Buckets only store timestamps from their limiter's clock, so every
/// limiter sharing a [`BucketStore`](super::BucketStore) must read the same
/// kind of clock.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in milliseconds.
    fn now_millis(&self) -> i64;
}

/// Wall clock, milliseconds since the Unix epoch.
///
/// Comparable across processes and hosts, which makes it the default for
/// the shared backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Milliseconds elapsed on the tokio clock since creation.
///
/// Monotonic and follows a paused test runtime, but only meaningful inside
/// the process that created it.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}

/// Snapshot of a single token bucket.
///
/// A plain serializable value, so a store can keep it anywhere and
/// compare-and-swap whole states; the memory backend simply mutates it under
/// a per-key lock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Current number of tokens, always within `0..=capacity`.
    pub tokens: f64,
    /// Last refill time, in the owning limiter's clock milliseconds.
    pub last_refill_ms: i64,
}

impl BucketState {
    /// A bucket that starts full.
    pub fn full(capacity: u32, now_ms: i64) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill_ms: now_ms,
        }
    }

    /// Refill tokens based on elapsed time.
    pub fn refilled(self, capacity: u32, refill_per_sec: f64, now_ms: i64) -> Self {
        let elapsed_ms = now_ms.saturating_sub(self.last_refill_ms).max(0);
        let new_tokens = elapsed_ms as f64 * refill_per_sec / 1000.0;

        Self {
            tokens: (self.tokens + new_tokens).min(capacity as f64),
            // Never move backwards if callers race on `now`.
            last_refill_ms: now_ms.max(self.last_refill_ms),
        }
    }

    /// Refill, then try to consume one token.
    ///
    /// Returns the next state and whether a token was taken.
    pub fn try_take(self, capacity: u32, refill_per_sec: f64, now_ms: i64) -> (Self, bool) {
        let mut next = self.refilled(capacity, refill_per_sec, now_ms);
        if next.tokens >= 1.0 {
            next.tokens -= 1.0;
            (next, true)
        } else {
            (next, false)
        }
    }
}
