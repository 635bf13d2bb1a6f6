//! Tool router: picks a server for a tool call and dispatches it.

use super::connections::ConnectionManager;
use crate::fleet::{
    domain::{ServerName, ServerRegistration, ServerStatus},
    ports::{RegistryStore, Transport},
};
use mockable::Clock;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Candidates tried per call: the best one plus one fallback.
const MAX_ATTEMPTS: usize = 2;

/// One failed dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchAttempt {
    /// Server the call was sent to.
    pub server: ServerName,
    /// Failure reported for the attempt.
    pub error: String,
}

/// Coarse classification of routing failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteErrorKind {
    /// No server offers the tool.
    NoCapableServer,
    /// Servers offer the tool but none could serve the call.
    CapableServerUnreachable,
    /// The caller abandoned the call.
    Cancelled,
}

/// Routing errors returned to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    /// No connected server lists the tool.
    #[error("no connected server offers tool '{tool}'")]
    ToolNotFound {
        /// Requested tool.
        tool: String,
    },

    /// The tool is offered only by servers that are currently unhealthy.
    #[error("tool '{tool}' is only offered by unhealthy servers")]
    ProviderUnavailable {
        /// Requested tool.
        tool: String,
        /// Servers offering the tool.
        servers: Vec<ServerName>,
    },

    /// Every attempted server failed.
    #[error("tool '{tool}' failed on {} server(s)", attempts.len())]
    DispatchFailure {
        /// Requested tool.
        tool: String,
        /// Attempts in the order they were made.
        attempts: Vec<DispatchAttempt>,
    },

    /// The call was cancelled before a server answered.
    #[error("call to tool '{tool}' was cancelled")]
    Cancelled {
        /// Requested tool.
        tool: String,
    },
}

/// Serialisable explanation of a routing failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteReport {
    /// Failure class.
    pub kind: RouteErrorKind,
    /// Requested tool.
    pub tool: String,
    /// Human-readable message.
    pub message: String,
    /// Servers known to offer the tool but not usable.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unavailable: Vec<ServerName>,
    /// Failed attempts.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<DispatchAttempt>,
}

impl RouteError {
    /// Returns the failure class.
    #[must_use]
    pub const fn kind(&self) -> RouteErrorKind {
        match self {
            Self::ToolNotFound { .. } => RouteErrorKind::NoCapableServer,
            Self::ProviderUnavailable { .. } | Self::DispatchFailure { .. } => {
                RouteErrorKind::CapableServerUnreachable
            }
            Self::Cancelled { .. } => RouteErrorKind::Cancelled,
        }
    }

    /// Returns the requested tool.
    #[must_use]
    pub fn tool(&self) -> &str {
        match self {
            Self::ToolNotFound { tool }
            | Self::ProviderUnavailable { tool, .. }
            | Self::DispatchFailure { tool, .. }
            | Self::Cancelled { tool } => tool,
        }
    }

    /// Builds a structured explanation of the failure.
    #[must_use]
    pub fn report(&self) -> RouteReport {
        let (unavailable, attempts) = match self {
            Self::ProviderUnavailable { servers, .. } => (servers.clone(), Vec::new()),
            Self::DispatchFailure { attempts, .. } => (Vec::new(), attempts.clone()),
            Self::ToolNotFound { .. } | Self::Cancelled { .. } => (Vec::new(), Vec::new()),
        };
        RouteReport {
            kind: self.kind(),
            tool: self.tool().to_owned(),
            message: self.to_string(),
            unavailable,
            attempts,
        }
    }
}

/// Successful dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedCall {
    /// Server that answered.
    pub server: ServerName,
    /// Tool result.
    pub result: Value,
    /// Attempts that failed before the answer.
    pub failed_attempts: Vec<DispatchAttempt>,
}

/// Routes tool calls across connected servers.
pub struct ToolRouter<S, T, C>
where
    S: RegistryStore,
    T: Transport,
    C: Clock + Send + Sync,
{
    connections: Arc<ConnectionManager<S, T, C>>,
    call_timeout: Duration,
}

impl<S, T, C> ToolRouter<S, T, C>
where
    S: RegistryStore,
    T: Transport,
    C: Clock + Send + Sync,
{
    /// Creates a router bounding each call by `call_timeout`.
    #[must_use]
    pub const fn new(connections: Arc<ConnectionManager<S, T, C>>, call_timeout: Duration) -> Self {
        Self {
            connections,
            call_timeout,
        }
    }

    /// Dispatches `tool_name` to the best connected server.
    ///
    /// `preferred` is tried first when it is connected and offers the
    /// tool. Otherwise candidates are ordered by priority (highest first),
    /// then most recent `last_seen`, then name. A failed call is retried
    /// once on the next candidate.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] when no server can serve the call.
    pub async fn route(
        &self,
        tool_name: &str,
        arguments: Value,
        preferred: Option<&ServerName>,
    ) -> Result<RoutedCall, RouteError> {
        let candidates = self.candidates(tool_name, preferred).await?;
        let mut failed_attempts = Vec::new();

        for server in candidates.iter().take(MAX_ATTEMPTS) {
            let Some(connection) = self.connections.connection(server) else {
                failed_attempts.push(DispatchAttempt {
                    server: server.clone(),
                    error: "connection closed before dispatch".to_owned(),
                });
                continue;
            };

            debug!(tool = tool_name, server = %server, "dispatching tool call");
            match connection
                .call(tool_name, arguments.clone(), self.call_timeout)
                .await
            {
                Ok(result) => {
                    info!(tool = tool_name, server = %server, "tool call routed");
                    return Ok(RoutedCall {
                        server: server.clone(),
                        result,
                        failed_attempts,
                    });
                }
                Err(err) => {
                    warn!(tool = tool_name, server = %server, error = %err, "tool call failed");
                    failed_attempts.push(DispatchAttempt {
                        server: server.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        Err(RouteError::DispatchFailure {
            tool: tool_name.to_owned(),
            attempts: failed_attempts,
        })
    }

    /// Dispatches like [`ToolRouter::route`] unless `token` is cancelled
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Cancelled`] when the token fires, or any error
    /// of [`ToolRouter::route`].
    pub async fn route_cancellable(
        &self,
        tool_name: &str,
        arguments: Value,
        preferred: Option<&ServerName>,
        token: &CancellationToken,
    ) -> Result<RoutedCall, RouteError> {
        tokio::select! {
            biased;
            () = token.cancelled() => Err(RouteError::Cancelled { tool: tool_name.to_owned() }),
            routed = self.route(tool_name, arguments, preferred) => routed,
        }
    }

    /// Returns the servers a call to `tool_name` would try, in order.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::ToolNotFound`] or
    /// [`RouteError::ProviderUnavailable`] when no server qualifies.
    pub async fn candidates(
        &self,
        tool_name: &str,
        preferred: Option<&ServerName>,
    ) -> Result<Vec<ServerName>, RouteError> {
        let catalog = self.connections.catalog();
        let providers = catalog.providers(tool_name);

        let mut connected: Vec<ServerRegistration> = Vec::with_capacity(providers.len());
        for server in providers {
            if let Some(registration) = self.connections.registry().get(server).await
                && registration.status() == ServerStatus::Connected
            {
                connected.push(registration);
            }
        }

        if connected.is_empty() {
            return Err(if providers.is_empty() {
                RouteError::ToolNotFound {
                    tool: tool_name.to_owned(),
                }
            } else {
                RouteError::ProviderUnavailable {
                    tool: tool_name.to_owned(),
                    servers: providers.to_vec(),
                }
            });
        }

        connected.sort_by_key(|registration| {
            (
                Reverse(registration.priority()),
                Reverse(registration.last_seen()),
                registration.name().clone(),
            )
        });
        let mut ordered: Vec<ServerName> = connected
            .into_iter()
            .map(|registration| registration.name().clone())
            .collect();
        if let Some(hint) = preferred
            && let Some(position) = ordered.iter().position(|name| name == hint)
        {
            let chosen = ordered.remove(position);
            ordered.insert(0, chosen);
        }
        Ok(ordered)
    }
}
