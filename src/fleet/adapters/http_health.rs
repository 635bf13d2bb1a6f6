//! HTTP health check adapter.

use crate::fleet::ports::{HealthCheck, HealthCheckError};
use async_trait::async_trait;
use std::time::Duration;

/// Health check issuing a `GET` against the configured endpoint.
///
/// Any 2xx answer counts as healthy.
#[derive(Debug, Clone, Default)]
pub struct HttpHealthCheck {
    client: reqwest::Client,
}

impl HttpHealthCheck {
    /// Creates a health check with a default HTTP client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a health check sharing an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn check(&self, url: &str, timeout: Duration) -> Result<(), HealthCheckError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    HealthCheckError::Timeout(timeout)
                } else {
                    HealthCheckError::Unreachable(err.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(HealthCheckError::UnexpectedStatus(status.as_u16()))
        }
    }
}
