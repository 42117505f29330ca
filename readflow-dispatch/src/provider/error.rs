//! Provider error types.

use reqwest::StatusCode;
use thiserror::Error;

/// A provider could not be built from its configuration.
///
/// Never retried: the subscription has to be fixed first.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("{provider}: missing {field}")]
    MissingField {
        provider: &'static str,
        field: &'static str,
    },

    #[error("{provider}: invalid {field} URL {value:?}: {reason}")]
    InvalidUrl {
        provider: &'static str,
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("{provider}: invalid secret: {reason}")]
    InvalidSecret {
        provider: &'static str,
        reason: String,
    },

    #[error("{provider}: invalid {field}: {reason}")]
    InvalidField {
        provider: &'static str,
        field: &'static str,
        reason: String,
    },

    #[error("unknown provider kind: {0}")]
    UnknownKind(String),

    #[error("malformed provider configuration: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ConfigurationError {
    pub fn missing_field(provider: &'static str, field: &'static str) -> Self {
        Self::MissingField { provider, field }
    }

    pub fn invalid_secret(provider: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidSecret {
            provider,
            reason: reason.into(),
        }
    }

    pub fn invalid_field(
        provider: &'static str,
        field: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidField {
            provider,
            field,
            reason: reason.into(),
        }
    }
}

/// Outcome of a failed `send()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Worth retrying: network trouble, timeouts, 5xx, 408 and 429.
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying will not help: other 4xx, malformed requests.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let msg = if body.is_empty() {
            format!("bad status code: {}", status.as_u16())
        } else {
            format!("bad status code: {} - {}", status.as_u16(), truncate(body, 256))
        };

        if is_transient_status(status) {
            Self::Transient(msg)
        } else {
            Self::Permanent(msg)
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            return Self::Permanent(format!("invalid request: {}", err));
        }
        if let Some(status) = err.status() {
            return Self::from_status(status, "");
        }
        // Connect, timeout, body and decode errors; anything unknown retries.
        Self::Transient(format!("request failed: {}", err))
    }
}

/// 408, 429 and every 5xx.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
