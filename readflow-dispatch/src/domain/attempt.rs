//! Delivery attempt record and its state machine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::time::Instant;

use super::Article;
use crate::{Error, Result};

/// Composite key of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptKey {
    pub subscription_id: u64,
    pub article_id: u64,
}

impl AttemptKey {
    pub fn new(subscription_id: u64, article_id: u64) -> Self {
        Self {
            subscription_id,
            article_id,
        }
    }
}

impl std::fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.subscription_id, self.article_id)
    }
}

/// Status of a delivery attempt.
///
/// `RateLimited` and `TransientFailure` are the two "pending after a delay"
/// forms: once `next_retry_at` has passed they are picked up exactly like
/// `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    RateLimited,
    Sending,
    TransientFailure,
    Success,
    PermanentFailure,
}

impl DeliveryStatus {
    /// SUCCESS and PERMANENT_FAILURE never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::PermanentFailure)
    }

    /// Waiting to be (re)processed.
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::RateLimited | Self::TransientFailure
        )
    }

    pub fn can_transition_to(self, to: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        match self {
            Pending | RateLimited | TransientFailure => matches!(to, RateLimited | Sending),
            // `Pending` here is a send interrupted by shutdown.
            Sending => matches!(to, Success | TransientFailure | PermanentFailure | Pending),
            Success | PermanentFailure => false,
        }
    }
}

/// One tracked try to send an article through a subscription.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub key: AttemptKey,
    pub user_id: u64,
    pub provider_kind: String,
    pub article: Arc<Article>,
    /// Number of send calls that ended in a failure or success.
    /// Rate-limit deferrals and shutdown interruptions do not count.
    pub attempts: u32,
    pub status: DeliveryStatus,
    pub next_retry_at: Option<Instant>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the attempt reached a terminal status; drives retention.
    pub completed_at: Option<Instant>,
}

impl DeliveryAttempt {
    pub fn new(subscription_id: u64, provider_kind: impl Into<String>, article: Arc<Article>) -> Self {
        let now = Utc::now();
        Self {
            key: AttemptKey::new(subscription_id, article.id),
            user_id: article.user_id,
            provider_kind: provider_kind.into(),
            article,
            attempts: 0,
            status: DeliveryStatus::Pending,
            next_retry_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Move to `to`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, to: DeliveryStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::invalid_transition(self.status, to));
        }
        self.status = to;
        self.updated_at = Utc::now();
        if to.is_terminal() {
            self.completed_at = Some(Instant::now());
            self.next_retry_at = None;
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Waiting and past its retry instant (or never deferred).
    pub fn is_due(&self, now: Instant) -> bool {
        self.status.is_waiting() && self.next_retry_at.is_none_or(|at| at <= now)
    }

    pub fn report(&self) -> DeliveryReport {
        DeliveryReport {
            subscription_id: self.key.subscription_id,
            article_id: self.key.article_id,
            user_id: self.user_id,
            provider_kind: self.provider_kind.clone(),
            status: self.status,
            attempts: self.attempts,
            last_error: self.last_error.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Serializable summary of an attempt, used for outcome events and the
/// failure view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub subscription_id: u64,
    pub article_id: u64,
    pub user_id: u64,
    pub provider_kind: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}
