//! Discovery source port.

use crate::fleet::domain::DiscoveryDocument;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// An independent producer of candidate registrations.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Returns the configured source name, used in logs and reports.
    fn name(&self) -> &str;

    /// Returns how often the source should be polled.
    fn interval(&self) -> Duration;

    /// Runs one discovery cycle.
    ///
    /// Returns `None` when the source knows its content has not changed
    /// since the last successful cycle.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoverySourceError`] when the document cannot be fetched
    /// or parsed; the caller skips the cycle.
    async fn poll(&self) -> Result<Option<DiscoveryDocument>, DiscoverySourceError>;
}

/// Errors returned by a discovery cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoverySourceError {
    /// The document could not be read or fetched.
    #[error("discovery source '{source_name}' could not fetch its document: {reason}")]
    Fetch {
        /// Source name.
        source_name: String,
        /// Failure detail.
        reason: String,
    },

    /// The discovery endpoint answered with a non-success status.
    #[error("discovery source '{source_name}' received status {status}")]
    UnexpectedStatus {
        /// Source name.
        source_name: String,
        /// HTTP status code.
        status: u16,
    },

    /// The document is not a valid discovery document.
    #[error("discovery source '{source_name}' returned a malformed document: {reason}")]
    Parse {
        /// Source name.
        source_name: String,
        /// Parser message.
        reason: String,
    },

    /// The cycle did not finish in time.
    #[error("discovery source '{source_name}' timed out")]
    Timeout {
        /// Source name.
        source_name: String,
    },
}
