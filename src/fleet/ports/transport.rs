//! Transport port through which the connection manager reaches servers.

use crate::fleet::domain::ToolDescriptor;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Opens sessions to tool servers.
///
/// The wire protocol is up to the implementation. `open` covers both the
/// connection and any protocol handshake.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a session against `url`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the endpoint is unreachable or the
    /// handshake fails.
    async fn open(&self, url: &str) -> TransportResult<Box<dyn TransportSession>>;
}

/// One open session to a tool server.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Lists the tools the server currently offers.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the request fails.
    async fn list_tools(&self) -> TransportResult<Vec<ToolDescriptor>>;

    /// Invokes `tool_name` with `arguments`, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the call fails or times out.
    async fn call(
        &self,
        tool_name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> TransportResult<Value>;

    /// Closes the session and releases its resources.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the close handshake fails; the
    /// session is unusable afterwards either way.
    async fn close(&self) -> TransportResult<()>;
}

/// Errors returned by transport adapters.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The endpoint could not be reached.
    #[error("endpoint '{url}' is unreachable: {reason}")]
    Unreachable {
        /// Endpoint URL.
        url: String,
        /// Failure detail.
        reason: String,
    },

    /// The endpoint answered but the protocol handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The operation did not complete in time.
    #[error("operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The session was already closed.
    #[error("session is closed")]
    Closed,

    /// The server reported an error for the request.
    #[error("server error [{code}]: {message}")]
    Remote {
        /// Protocol error code.
        code: i64,
        /// Error message.
        message: String,
    },

    /// Generic adapter failure.
    #[error("transport runtime error: {0}")]
    Runtime(Arc<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    /// Wraps a runtime error from the transport adapter.
    pub fn runtime(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Runtime(Arc::new(err))
    }
}
