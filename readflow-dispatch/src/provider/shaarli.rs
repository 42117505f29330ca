//! Shaarli provider.
//!
//! Creates a link on a Shaarli instance through its REST API
//! (`POST /api/v1/links`), authenticated with an HS512 JWT carrying only
//! the `iat` claim.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::webhook::parse_endpoint;
use super::{ConfigurationError, Provider, ProviderContext, ProviderError, SendContext};
use crate::domain::Article;

const KIND: &str = "shaarli";
const LINKS_PATH: &str = "/api/v1/links";

/// Shaarli provider configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShaarliConfig {
    /// Base URL of the Shaarli instance.
    #[serde(default)]
    pub endpoint: String,
    /// API secret used to sign tokens.
    #[serde(default)]
    pub secret: String,
    /// Create links as private.
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Serialize)]
struct ShaarliEntry<'a> {
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    private: bool,
    created: String,
    updated: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iat: u64,
}

pub struct ShaarliProvider {
    links_url: Url,
    private: bool,
    encoding_key: EncodingKey,
    client: Client,
}

impl std::fmt::Debug for ShaarliProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaarliProvider")
            .field("links_url", &self.links_url.as_str())
            .field("private", &self.private)
            .finish_non_exhaustive()
    }
}

impl ShaarliProvider {
    /// Parse and validate a configuration blob.
    pub fn from_value(config: &Value, ctx: &ProviderContext) -> Result<Self, ConfigurationError> {
        let config: ShaarliConfig = serde_json::from_value(config.clone())?;
        Self::new(config, ctx)
    }

    pub fn new(config: ShaarliConfig, ctx: &ProviderContext) -> Result<Self, ConfigurationError> {
        let mut links_url = parse_endpoint(KIND, &config.endpoint)?;
        links_url.set_path(LINKS_PATH);
        links_url.set_query(None);

        if config.secret.is_empty() {
            return Err(ConfigurationError::missing_field(KIND, "secret"));
        }
        if config.secret.trim().is_empty() {
            return Err(ConfigurationError::invalid_secret(KIND, "must not be blank"));
        }

        Ok(Self {
            links_url,
            private: config.private,
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            client: ctx.http_client.clone(),
        })
    }

    fn access_token(&self) -> Result<String, ProviderError> {
        let iat = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| ProviderError::transient(format!("clock error: {}", e)))?
            .as_secs();

        encode(&Header::new(Algorithm::HS512), &Claims { iat }, &self.encoding_key)
            .map_err(|e| ProviderError::permanent(format!("token generation failed: {}", e)))
    }
}

#[async_trait]
impl Provider for ShaarliProvider {
    fn kind(&self) -> &str {
        KIND
    }

    async fn send(&self, ctx: &SendContext, article: &Article) -> Result<(), ProviderError> {
        let token = self.access_token()?;

        let entry = ShaarliEntry {
            title: &article.title,
            description: article.text.as_deref(),
            url: article.url.as_deref(),
            private: self.private,
            created: article.created_at.to_rfc3339(),
            updated: article.updated_at.to_rfc3339(),
        };

        let request = self
            .client
            .post(self.links_url.clone())
            .bearer_auth(token)
            .timeout(ctx.remaining())
            .json(&entry)
            .send();

        let response = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return Err(ProviderError::transient("cancelled"));
            }
            response = request => response?,
        };

        let status = response.status();
        if status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            warn!(
                subscription_id = ctx.subscription_id,
                status = %status,
                "Shaarli rejected link"
            );
            return Err(ProviderError::from_status(status, &body));
        }

        debug!(
            subscription_id = ctx.subscription_id,
            article_id = article.id,
            "Shaarli link created"
        );
        Ok(())
    }
}
