//! Outgoing providers.
//!
//! A provider pushes an article to one external service. Providers are
//! built from a subscription's configuration blob by the
//! [`ProviderRegistry`] and are expected to:
//! - respect the caller's deadline and cancellation token,
//! - never panic on malformed downstream responses,
//! - map errors they do not understand to [`ProviderError::Transient`].

mod error;
mod registry;
mod shaarli;
mod webhook;

pub use error::{ConfigurationError, ProviderError, is_transient_status};
pub use registry::{ProviderConstructor, ProviderDef, ProviderDescriptor, ProviderRegistry};
pub use shaarli::{ShaarliConfig, ShaarliProvider};
pub use webhook::{WebhookConfig, WebhookProvider};

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::Article;

/// User agent sent by HTTP providers.
pub const USER_AGENT: &str = concat!("readflow-dispatch/", env!("CARGO_PKG_VERSION"));

/// Built-in provider kinds.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProviderKind {
    /// Generic JSON webhook.
    Webhook,
    /// Shaarli bookmarking service.
    Shaarli,
}

/// Shared resources handed to provider constructors.
#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub http_client: Client,
    pub user_agent: String,
}

impl ProviderContext {
    pub fn new(http_client: Client) -> Self {
        Self {
            http_client,
            user_agent: USER_AGENT.to_string(),
        }
    }
}

impl Default for ProviderContext {
    fn default() -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self::new(client)
    }
}

/// Per-call context for [`Provider::send`].
#[derive(Debug, Clone)]
pub struct SendContext {
    pub subscription_id: u64,
    pub user_id: u64,
    /// 1-based number of this send call for the attempt.
    pub attempt: u32,
    /// The call is abandoned at this instant.
    pub deadline: Instant,
    /// Cancelled when the dispatcher is shutting down.
    pub cancel: CancellationToken,
}

impl SendContext {
    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// An integration that delivers articles to an external service.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider kind name, as registered.
    fn kind(&self) -> &str;

    /// Deliver one article.
    async fn send(&self, ctx: &SendContext, article: &Article) -> Result<(), ProviderError>;
}
