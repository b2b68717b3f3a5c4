//! Pull-based marketplace adapters
//!
//! An adapter call either yields a whole batch of raw quotes or fails as a
//! unit. Row-level problems are left to the normalizer.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;
use types::snapshot::PriceQuote;

use crate::config::SourceConfig;
use crate::error::SourceError;

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Tag stamped on every row this adapter produces.
    fn source_id(&self) -> &str;

    async fn fetch(&self) -> Result<Vec<PriceQuote>, SourceError>;
}

/// Fetches a JSON array of quotes from one URL.
pub struct HttpJsonSource {
    id: String,
    url: String,
    client: Client,
    timeout: Duration,
}

impl HttpJsonSource {
    pub fn new(config: &SourceConfig, client: Client, timeout: Duration) -> Self {
        Self {
            id: config.id.clone(),
            url: config.url.clone(),
            client,
            timeout,
        }
    }

    fn unavailable(&self, reason: impl ToString) -> SourceError {
        SourceError::Unavailable {
            source_id: self.id.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl SourceAdapter for HttpJsonSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self) -> Result<Vec<PriceQuote>, SourceError> {
        let response = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SourceError::Timeout {
                        source_id: self.id.clone(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    self.unavailable(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.unavailable(format!("HTTP {}", status)));
        }

        let quotes: Vec<PriceQuote> = response.json().await.map_err(|e| SourceError::Malformed {
            source_id: self.id.clone(),
            reason: e.to_string(),
        })?;
        debug!(source = %self.id, rows = quotes.len(), "Fetched quotes");
        Ok(quotes)
    }
}

/// Serves a fixed batch; used for tests and local replay.
pub struct StaticSource {
    id: String,
    quotes: Vec<PriceQuote>,
}

impl StaticSource {
    pub fn new(id: impl Into<String>, quotes: Vec<PriceQuote>) -> Self {
        Self { id: id.into(), quotes }
    }
}

#[async_trait]
impl SourceAdapter for StaticSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self) -> Result<Vec<PriceQuote>, SourceError> {
        Ok(self.quotes.clone())
    }
}
