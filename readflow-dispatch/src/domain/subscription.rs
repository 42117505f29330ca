//! Outgoing subscription (a user's delivery channel).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Article;
use crate::rate_limiter::RateLimitPolicy;

/// A user-configured outgoing channel.
///
/// The provider configuration stays an opaque JSON document here; it is
/// parsed into the provider's own typed config when the provider is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: u64,
    pub user_id: u64,
    /// Human-friendly name.
    #[serde(default)]
    pub alias: String,
    /// Provider kind, e.g. `webhook` or `shaarli`.
    pub provider: String,
    /// Provider-specific configuration blob.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Rate-limit policy. `None` falls back to the limiter's default policy.
    #[serde(default)]
    pub rate_limit: Option<RateLimitPolicy>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl Subscription {
    pub fn new(id: u64, user_id: u64, provider: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            id,
            user_id,
            alias: String::new(),
            provider: provider.into(),
            config,
            rate_limit: None,
            enabled: true,
            updated_at: Utc::now(),
        }
    }

    pub fn with_rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = Some(policy);
        self
    }

    /// Key used for this subscription's rate-limit bucket.
    pub fn rate_limit_key(&self) -> String {
        rate_limit_key(self.id)
    }

    /// Whether an article event should be delivered through this subscription.
    pub fn matches(&self, article: &Article) -> bool {
        self.enabled && self.user_id == article.user_id
    }

    /// Whether the provider built for `other` can be reused for `self`.
    pub fn same_provider_config(&self, other: &Subscription) -> bool {
        self.provider == other.provider && self.config == other.config
    }

    pub fn display_name(&self) -> &str {
        if self.alias.is_empty() {
            &self.provider
        } else {
            &self.alias
        }
    }
}

pub(crate) fn rate_limit_key(subscription_id: u64) -> String {
    format!("subscription:{}", subscription_id)
}
