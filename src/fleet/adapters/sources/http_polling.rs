//! Discovery source polling a discovery service over HTTP.

use crate::fleet::{
    domain::DiscoveryDocument,
    ports::{DiscoverySource, DiscoverySourceError},
};
use async_trait::async_trait;
use std::time::Duration;

/// Polls a discovery endpoint with `GET` every interval.
///
/// When tags are configured they are sent as one comma-separated `tags`
/// query parameter. Every successful poll yields the full document; the
/// engine's merge makes repeated ingestion harmless.
#[derive(Debug, Clone)]
pub struct HttpPollingSource {
    name: String,
    url: String,
    tags: Vec<String>,
    interval: Duration,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpPollingSource {
    /// Creates a polling source. Requests time out after `interval`.
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            tags: Vec::new(),
            interval,
            timeout: interval,
            client: reqwest::Client::new(),
        }
    }

    /// Restricts the query to servers carrying any of `tags`.
    #[must_use]
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    /// Overrides the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DiscoverySource for HttpPollingSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn poll(&self) -> Result<Option<DiscoveryDocument>, DiscoverySourceError> {
        let mut request = self.client.get(&self.url).timeout(self.timeout);
        if !self.tags.is_empty() {
            request = request.query(&[("tags", self.tags.join(","))]);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                DiscoverySourceError::Timeout {
                    source_name: self.name.clone(),
                }
            } else {
                DiscoverySourceError::Fetch {
                    source_name: self.name.clone(),
                    reason: err.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoverySourceError::UnexpectedStatus {
                source_name: self.name.clone(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| DiscoverySourceError::Fetch {
                source_name: self.name.clone(),
                reason: err.to_string(),
            })?;
        DiscoveryDocument::from_slice(&body)
            .map(Some)
            .map_err(|err| DiscoverySourceError::Parse {
                source_name: self.name.clone(),
                reason: err.to_string(),
            })
    }
}
