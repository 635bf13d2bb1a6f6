//! Error types for fleet domain validation and parsing.

use super::{ServerName, ServerStatus};
use thiserror::Error;

/// Errors returned while constructing fleet domain values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FleetDomainError {
    /// The server name is empty after trimming.
    #[error("server name must not be empty")]
    EmptyServerName,

    /// The server name contains characters outside `[A-Za-z0-9_.-]`.
    #[error(
        "server name '{0}' contains invalid characters (only ASCII alphanumerics, '_', '-' and '.' allowed)"
    )]
    InvalidServerName(String),

    /// The server name exceeds the 100-character limit.
    #[error("server name exceeds 100 character limit: {0}")]
    ServerNameTooLong(String),

    /// The connection endpoint is empty.
    #[error("server url must not be empty")]
    EmptyServerUrl,

    /// The health check URL does not use an HTTP scheme.
    #[error("health check url '{0}' must start with 'http://' or 'https://'")]
    InvalidHealthCheckUrl(String),

    /// A tool descriptor name is empty after trimming.
    #[error("tool name must not be empty")]
    EmptyToolName,

    /// Moving between two statuses is not part of the lifecycle.
    #[error("invalid status transition for server '{server}': {from} -> {to}")]
    InvalidStatusTransition {
        /// Server whose status was being changed.
        server: ServerName,
        /// Current status.
        from: ServerStatus,
        /// Requested status.
        to: ServerStatus,
    },
}

/// Error returned while parsing a server status from text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown server status: {0}")]
pub struct ParseServerStatusError(pub String);
