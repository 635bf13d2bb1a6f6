//! In-memory transport for deterministic connection and routing tests.

use crate::fleet::{
    domain::ToolDescriptor,
    ports::{Transport, TransportError, TransportResult, TransportSession},
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// In-memory transport keyed by endpoint URL.
///
/// Endpoints are declared up front with their tool lists. Failure modes
/// can be toggled per endpoint while sessions are open. Successful calls
/// echo the endpoint URL, tool name and arguments back to the caller.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    state: Arc<RwLock<InMemoryTransportState>>,
}

#[derive(Debug, Default)]
struct InMemoryTransportState {
    endpoints: HashMap<String, Endpoint>,
    open_sessions: usize,
}

#[derive(Debug, Default)]
struct Endpoint {
    tools: Vec<ToolDescriptor>,
    unreachable: bool,
    failing_calls: bool,
    failing_probes: bool,
    hanging_probes: bool,
    open_delay: Option<Duration>,
    opens: usize,
    calls: usize,
}

fn lock_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::runtime(std::io::Error::other(err.to_string()))
}

impl InMemoryTransport {
    /// Creates a transport with no endpoints.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a reachable endpoint offering `tools`.
    ///
    /// Re-declaring an endpoint replaces its tool list and keeps its
    /// counters and failure toggles.
    ///
    /// # Errors
    ///
    /// Returns a runtime error when lock acquisition fails.
    pub fn add_endpoint(
        &self,
        url: impl Into<String>,
        tools: Vec<ToolDescriptor>,
    ) -> TransportResult<()> {
        let mut state = self.state.write().map_err(lock_error)?;
        state.endpoints.entry(url.into()).or_default().tools = tools;
        Ok(())
    }

    /// Makes `url` refuse new sessions and fail every request.
    ///
    /// # Errors
    ///
    /// Returns a runtime error when lock acquisition fails.
    pub fn set_unreachable(&self, url: &str, unreachable: bool) -> TransportResult<()> {
        self.update_endpoint(url, |endpoint| endpoint.unreachable = unreachable)
    }

    /// Makes tool calls on `url` fail with a server error.
    ///
    /// # Errors
    ///
    /// Returns a runtime error when lock acquisition fails.
    pub fn set_call_failure(&self, url: &str, failing: bool) -> TransportResult<()> {
        self.update_endpoint(url, |endpoint| endpoint.failing_calls = failing)
    }

    /// Makes tool listings on `url` fail, which fails health probes.
    ///
    /// # Errors
    ///
    /// Returns a runtime error when lock acquisition fails.
    pub fn set_probe_failure(&self, url: &str, failing: bool) -> TransportResult<()> {
        self.update_endpoint(url, |endpoint| endpoint.failing_probes = failing)
    }

    /// Makes tool listings on `url` never complete.
    ///
    /// # Errors
    ///
    /// Returns a runtime error when lock acquisition fails.
    pub fn set_probe_hang(&self, url: &str, hanging: bool) -> TransportResult<()> {
        self.update_endpoint(url, |endpoint| endpoint.hanging_probes = hanging)
    }

    /// Delays session opening on `url`.
    ///
    /// # Errors
    ///
    /// Returns a runtime error when lock acquisition fails.
    pub fn set_open_delay(&self, url: &str, delay: Duration) -> TransportResult<()> {
        self.update_endpoint(url, |endpoint| endpoint.open_delay = Some(delay))
    }

    /// Returns how many tool calls reached `url`, failed ones included.
    ///
    /// # Errors
    ///
    /// Returns a runtime error when lock acquisition fails.
    pub fn call_count(&self, url: &str) -> TransportResult<usize> {
        let state = self.state.read().map_err(lock_error)?;
        Ok(state.endpoints.get(url).map_or(0, |endpoint| endpoint.calls))
    }

    /// Returns how many sessions were opened against `url`.
    ///
    /// # Errors
    ///
    /// Returns a runtime error when lock acquisition fails.
    pub fn open_count(&self, url: &str) -> TransportResult<usize> {
        let state = self.state.read().map_err(lock_error)?;
        Ok(state.endpoints.get(url).map_or(0, |endpoint| endpoint.opens))
    }

    /// Returns how many sessions are open and not yet closed.
    ///
    /// # Errors
    ///
    /// Returns a runtime error when lock acquisition fails.
    pub fn open_sessions(&self) -> TransportResult<usize> {
        let state = self.state.read().map_err(lock_error)?;
        Ok(state.open_sessions)
    }

    fn update_endpoint(&self, url: &str, update: impl FnOnce(&mut Endpoint)) -> TransportResult<()> {
        let mut state = self.state.write().map_err(lock_error)?;
        update(state.endpoints.entry(url.to_owned()).or_default());
        Ok(())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn open(&self, url: &str) -> TransportResult<Box<dyn TransportSession>> {
        let delay = {
            let state = self.state.read().map_err(lock_error)?;
            state
                .endpoints
                .get(url)
                .and_then(|endpoint| endpoint.open_delay)
        };
        if let Some(duration) = delay {
            tokio::time::sleep(duration).await;
        }

        let mut state = self.state.write().map_err(lock_error)?;
        let endpoint = state
            .endpoints
            .get_mut(url)
            .filter(|endpoint| !endpoint.unreachable)
            .ok_or_else(|| TransportError::Unreachable {
                url: url.to_owned(),
                reason: "connection refused".to_owned(),
            })?;
        endpoint.opens += 1;
        state.open_sessions += 1;

        Ok(Box::new(InMemorySession {
            url: url.to_owned(),
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

struct InMemorySession {
    url: String,
    state: Arc<RwLock<InMemoryTransportState>>,
    closed: AtomicBool,
}

enum ListOutcome {
    Tools(Vec<ToolDescriptor>),
    Hang,
}

impl InMemorySession {
    fn ensure_open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn unreachable(&self) -> TransportError {
        TransportError::Unreachable {
            url: self.url.clone(),
            reason: "connection reset".to_owned(),
        }
    }

    fn list_outcome(&self) -> TransportResult<ListOutcome> {
        let state = self.state.read().map_err(lock_error)?;
        let endpoint = state
            .endpoints
            .get(&self.url)
            .ok_or_else(|| self.unreachable())?;
        if endpoint.unreachable || endpoint.failing_probes {
            return Err(self.unreachable());
        }
        if endpoint.hanging_probes {
            return Ok(ListOutcome::Hang);
        }
        Ok(ListOutcome::Tools(endpoint.tools.clone()))
    }
}

#[async_trait]
impl TransportSession for InMemorySession {
    async fn list_tools(&self) -> TransportResult<Vec<ToolDescriptor>> {
        self.ensure_open()?;
        match self.list_outcome()? {
            ListOutcome::Tools(tools) => Ok(tools),
            ListOutcome::Hang => {
                std::future::pending::<()>().await;
                Err(TransportError::Closed)
            }
        }
    }

    async fn call(
        &self,
        tool_name: &str,
        arguments: Value,
        _timeout: Duration,
    ) -> TransportResult<Value> {
        self.ensure_open()?;
        let mut state = self.state.write().map_err(lock_error)?;
        let endpoint = state
            .endpoints
            .get_mut(&self.url)
            .ok_or_else(|| self.unreachable())?;
        endpoint.calls += 1;
        if endpoint.unreachable {
            return Err(self.unreachable());
        }
        if endpoint.failing_calls {
            return Err(TransportError::Remote {
                code: -32000,
                message: format!("tool '{tool_name}' failed"),
            });
        }
        if !endpoint.tools.iter().any(|tool| tool.name() == tool_name) {
            return Err(TransportError::Remote {
                code: -32601,
                message: format!("unknown tool '{tool_name}'"),
            });
        }

        Ok(json!({
            "url": self.url,
            "tool": tool_name,
            "arguments": arguments,
        }))
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.state.write().map_err(lock_error)?;
        state.open_sessions = state.open_sessions.saturating_sub(1);
        Ok(())
    }
}
