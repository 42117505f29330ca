//! Article model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A processed article, as handed to outgoing providers.
///
/// Articles are immutable once published to the pipeline; they travel as
/// `Arc<Article>` so every attempt shares the same allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: u64,
    /// Owner of the article. Only that user's subscriptions receive it.
    pub user_id: u64,
    pub title: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Article {
    /// Create an article stamped with the current time.
    pub fn new(id: u64, user_id: u64, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            title: title.into(),
            text: None,
            url: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}
