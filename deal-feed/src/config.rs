use std::time::Duration;

use serde::Deserialize;

use crate::backoff::{Backoff, millis};
use crate::error::FetchError;

const BACKEND_URL_VAR: &str = "DEALS_BACKEND_URL";

/// Where the deals backend lives and how the feed paces itself against it.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub backend_url: String,
    pub deals_path: String,
    pub stream_path: String,
    pub page_limit: usize,
    pub backoff: Backoff,
    pub auto_reconnect: bool,
    #[serde(rename = "reconciliation_delay_ms", with = "millis")]
    pub reconciliation_delay: Duration,
    #[serde(rename = "price_history_stale_after_ms", with = "millis")]
    pub price_history_stale_after: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8000".to_string(),
            deals_path: "/api/deals".to_string(),
            stream_path: "/api/deals/stream".to_string(),
            page_limit: 16,
            backoff: Backoff::default(),
            auto_reconnect: true,
            reconciliation_delay: Duration::from_secs(10),
            price_history_stale_after: Duration::from_secs(5 * 60),
        }
    }
}

impl FeedConfig {
    /// Defaults, with the backend URL taken from `DEALS_BACKEND_URL` (a `.env` file
    /// is read first if there is one).
    pub fn from_env() -> Self {
        if let Err(e) = dotenvy::dotenv()
            && !e.not_found()
        {
            log::warn!("Ignoring unreadable .env file: {e}");
        }

        let mut config = Self::default();
        if let Ok(url) = std::env::var(BACKEND_URL_VAR)
            && !url.trim().is_empty()
        {
            config.backend_url = url.trim().to_string();
        }
        config
    }

    pub fn with_backend_url(mut self, backend_url: impl Into<String>) -> Self {
        self.backend_url = backend_url.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.backend_url.trim_end_matches('/'))
    }

    pub fn deals_url(&self) -> String {
        self.url(&self.deals_path)
    }

    pub fn stream_url(&self) -> String {
        self.url(&self.stream_path)
    }

    pub fn stores_url(&self) -> String {
        self.url(&format!("{}/stores", self.deals_path))
    }

    /// The product key is percent-encoded as a single path segment.
    pub fn price_history_url(&self, product_key: &str) -> Result<reqwest::Url, FetchError> {
        let base = self.url(&format!("{}/price-history", self.deals_path));
        let mut url = reqwest::Url::parse(&base)
            .map_err(|e| FetchError::Request(format!("bad backend url `{base}`: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| FetchError::Request(format!("backend url `{base}` can't take a path")))?
            .push(product_key);
        Ok(url)
    }
}
