//! HTTP health endpoint port used when a registration names one.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Checks an explicit `health_check_url`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Returns `Ok` when `url` reports the server as healthy.
    ///
    /// # Errors
    ///
    /// Returns [`HealthCheckError`] when the endpoint is unreachable, slow,
    /// or answers with a non-success status.
    async fn check(&self, url: &str, timeout: Duration) -> Result<(), HealthCheckError>;
}

/// Errors returned by health check adapters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HealthCheckError {
    /// The endpoint answered with a non-success status code.
    #[error("health endpoint returned status {0}")]
    UnexpectedStatus(u16),

    /// The endpoint could not be reached.
    #[error("health endpoint unreachable: {0}")]
    Unreachable(String),

    /// The endpoint did not answer in time.
    #[error("health check timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}
