//! Generic webhook provider.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};
use url::Url;

use super::{ConfigurationError, Provider, ProviderContext, ProviderError, SendContext};
use crate::domain::Article;

const KIND: &str = "webhook";

/// Header carrying the shared secret.
pub const SECRET_HEADER: &str = "X-Webhook-Secret";

/// Webhook provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Target URL.
    #[serde(default)]
    pub endpoint: String,
    /// HTTP method (default: POST).
    #[serde(default = "default_method")]
    pub method: String,
    /// Custom headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Shared secret sent in the `X-Webhook-Secret` header.
    #[serde(default)]
    pub secret: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            method: default_method(),
            headers: BTreeMap::new(),
            secret: None,
            timeout_secs: default_timeout(),
        }
    }
}

/// Posts articles as JSON to an HTTP endpoint.
#[derive(Debug)]
pub struct WebhookProvider {
    endpoint: Url,
    method: Method,
    headers: HeaderMap,
    timeout: Duration,
    client: Client,
}

impl WebhookProvider {
    /// Parse and validate a configuration blob.
    pub fn from_value(config: &Value, ctx: &ProviderContext) -> Result<Self, ConfigurationError> {
        let config: WebhookConfig = serde_json::from_value(config.clone())?;
        Self::new(config, ctx)
    }

    pub fn new(config: WebhookConfig, ctx: &ProviderContext) -> Result<Self, ConfigurationError> {
        let endpoint = parse_endpoint(KIND, &config.endpoint)?;

        let method = match config.method.to_uppercase().as_str() {
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "PATCH" => Method::PATCH,
            other => {
                return Err(ConfigurationError::invalid_field(
                    KIND,
                    "method",
                    format!("unsupported method {:?}", other),
                ));
            }
        };

        let headers = build_headers(&config)?;

        if config.timeout_secs == 0 {
            return Err(ConfigurationError::invalid_field(
                KIND,
                "timeout_secs",
                "must be greater than 0",
            ));
        }

        Ok(Self {
            endpoint,
            method,
            headers,
            timeout: Duration::from_secs(config.timeout_secs),
            client: ctx.http_client.clone(),
        })
    }

    /// Build the JSON payload.
    fn build_payload(&self, ctx: &SendContext, article: &Article) -> Value {
        json!({
            "event_type": "article.created",
            "subscription_id": ctx.subscription_id,
            "attempt": ctx.attempt,
            "id": article.id,
            "user_id": article.user_id,
            "title": article.title,
            "text": article.text,
            "url": article.url,
            "created_at": article.created_at.to_rfc3339(),
            "updated_at": article.updated_at.to_rfc3339(),
        })
    }
}

/// Build the request headers, rejecting names or values HTTP cannot carry.
fn build_headers(config: &WebhookConfig) -> Result<HeaderMap, ConfigurationError> {
    let mut headers = HeaderMap::new();

    for (name, value) in &config.headers {
        let name = name.parse::<HeaderName>().map_err(|e| {
            ConfigurationError::invalid_field(KIND, "headers", format!("{:?}: {}", name, e))
        })?;
        let value = value.parse::<HeaderValue>().map_err(|e| {
            ConfigurationError::invalid_field(KIND, "headers", format!("{}: {}", name, e))
        })?;
        headers.insert(name, value);
    }

    if let Some(secret) = &config.secret {
        if secret.is_empty() {
            return Err(ConfigurationError::invalid_secret(KIND, "must not be empty"));
        }
        let mut value = secret
            .parse::<HeaderValue>()
            .map_err(|_| ConfigurationError::invalid_secret(KIND, "not a valid header value"))?;
        value.set_sensitive(true);
        headers.insert(HeaderName::from_static("x-webhook-secret"), value);
    }

    Ok(headers)
}

/// Absolute http(s) URL or a configuration error.
pub(super) fn parse_endpoint(provider: &'static str, raw: &str) -> Result<Url, ConfigurationError> {
    if raw.trim().is_empty() {
        return Err(ConfigurationError::missing_field(provider, "endpoint"));
    }

    let invalid = |reason: String| ConfigurationError::InvalidUrl {
        provider,
        field: "endpoint",
        value: raw.to_string(),
        reason,
    };

    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(invalid(format!("unsupported scheme {:?}", scheme))),
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

#[async_trait]
impl Provider for WebhookProvider {
    fn kind(&self) -> &str {
        KIND
    }

    async fn send(&self, ctx: &SendContext, article: &Article) -> Result<(), ProviderError> {
        let payload = self.build_payload(ctx, article);
        let timeout = self.timeout.min(ctx.remaining());

        let request = self
            .client
            .request(self.method.clone(), self.endpoint.clone())
            .headers(self.headers.clone())
            .timeout(timeout)
            .json(&payload)
            .send();

        let response = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return Err(ProviderError::transient("cancelled"));
            }
            response = request => response?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                subscription_id = ctx.subscription_id,
                status = %status,
                "Webhook failed"
            );
            return Err(ProviderError::from_status(status, &body));
        }

        debug!(
            subscription_id = ctx.subscription_id,
            article_id = article.id,
            "Webhook delivered"
        );
        Ok(())
    }
}
