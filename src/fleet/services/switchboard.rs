//! Operator-facing facade wiring registry, connections, health, discovery
//! and routing together.

use super::connections::{Connection, ConnectionError, ConnectionManager};
use super::discovery::{DiscoveryEngine, SourceReport};
use super::health::{HealthMonitor, HealthPolicy, ProbeOutcome};
use super::registry::{
    DEFAULT_EVENTS_CAPACITY, RegistrationOutcome, RegistryError, ServerQuery, ServiceRegistry,
};
use super::router::{RouteError, RoutedCall, ToolRouter};
use crate::fleet::{
    domain::{
        FleetDomainError, RegistryEvent, ServerDescriptor, ServerName, ServerRegistration,
        ToolCatalog,
    },
    ports::{DiscoverySource, HealthCheck, RegistryStore, Transport},
};
use mockable::Clock;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Errors surfaced by the facade.
#[derive(Debug, Clone, Error)]
pub enum SwitchboardError {
    /// Input validation failed.
    #[error(transparent)]
    Domain(#[from] FleetDomainError),
    /// Registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Connection operation failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// Tool call could not be routed.
    #[error(transparent)]
    Route(#[from] RouteError),
}

/// Result type for facade operations.
pub type SwitchboardResult<T> = Result<T, SwitchboardError>;

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Tag written into every registry snapshot.
    pub registry_source: String,
    /// Bound for opening a session and listing its tools.
    pub connect_timeout: Duration,
    /// Bound for one tool call.
    pub call_timeout: Duration,
    /// Registry event buffer size.
    pub events_capacity: usize,
    /// Health monitor policy.
    pub health: HealthPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            registry_source: env!("CARGO_PKG_NAME").to_owned(),
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            health: HealthPolicy::default(),
        }
    }
}

/// Adapters the engine runs on.
pub struct EngineParts<S, T, H, C> {
    /// Registry snapshot storage.
    pub store: Arc<S>,
    /// Server transport.
    pub transport: Arc<T>,
    /// HTTP health endpoint checker.
    pub health_check: Arc<H>,
    /// Time source.
    pub clock: Arc<C>,
    /// Discovery sources.
    pub sources: Vec<Arc<dyn DiscoverySource>>,
}

/// The tool-server switchboard.
pub struct Switchboard<S, T, H, C>
where
    S: RegistryStore,
    T: Transport,
    H: HealthCheck,
    C: Clock + Send + Sync,
{
    registry: Arc<ServiceRegistry<S, C>>,
    connections: Arc<ConnectionManager<S, T, C>>,
    health: Arc<HealthMonitor<S, T, H, C>>,
    discovery: Arc<DiscoveryEngine<S, T, C>>,
    router: ToolRouter<S, T, C>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S, T, H, C> Switchboard<S, T, H, C>
where
    S: RegistryStore,
    T: Transport,
    H: HealthCheck,
    C: Clock + Send + Sync,
{
    /// Opens the registry and wires every component.
    ///
    /// Nothing connects and no background task runs until
    /// [`Switchboard::start`].
    pub async fn open(parts: EngineParts<S, T, H, C>, settings: EngineSettings) -> Self {
        let EngineParts {
            store,
            transport,
            health_check,
            clock,
            sources,
        } = parts;
        let registry = Arc::new(
            ServiceRegistry::open(
                store,
                Arc::clone(&clock),
                settings.registry_source,
                settings.events_capacity,
            )
            .await,
        );
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&registry),
            transport,
            clock,
            settings.connect_timeout,
        ));

        Self {
            health: Arc::new(HealthMonitor::new(
                Arc::clone(&connections),
                health_check,
                settings.health,
            )),
            discovery: Arc::new(DiscoveryEngine::new(Arc::clone(&connections), sources)),
            router: ToolRouter::new(Arc::clone(&connections), settings.call_timeout),
            registry,
            connections,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Returns matching registrations, highest priority first.
    pub async fn list(&self, query: &ServerQuery) -> Vec<ServerRegistration> {
        self.registry.list(query).await
    }

    /// Returns one registration.
    ///
    /// # Errors
    ///
    /// Returns [`SwitchboardError::Domain`] for an invalid name.
    pub async fn get(&self, name: &str) -> SwitchboardResult<Option<ServerRegistration>> {
        let server = ServerName::new(name)?;
        Ok(self.registry.get(&server).await)
    }

    /// Registers or updates a server.
    ///
    /// # Errors
    ///
    /// Returns [`SwitchboardError::Registry`] when the change cannot be
    /// persisted.
    pub async fn register(
        &self,
        descriptor: ServerDescriptor,
    ) -> SwitchboardResult<(ServerRegistration, RegistrationOutcome)> {
        Ok(self.registry.register(descriptor).await?)
    }

    /// Registers a server, refusing to overwrite different settings.
    ///
    /// # Errors
    ///
    /// Returns [`SwitchboardError::Registry`] on conflicts or persistence
    /// failures.
    pub async fn register_exclusive(
        &self,
        descriptor: ServerDescriptor,
    ) -> SwitchboardResult<(ServerRegistration, RegistrationOutcome)> {
        Ok(self.registry.register_exclusive(descriptor).await?)
    }

    /// Disconnects a server, then removes its registration.
    ///
    /// Both steps run under the server's lock, so a concurrent connect
    /// either finishes first and is torn down or finds no record.
    ///
    /// # Errors
    ///
    /// Returns domain, connection or registry errors.
    pub async fn unregister(&self, name: &str) -> SwitchboardResult<Option<ServerRegistration>> {
        let server = ServerName::new(name)?;
        let _guard = self.connections.lock_server(&server).await;
        match self.connections.disconnect_locked(&server).await {
            Ok(()) | Err(ConnectionError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        Ok(self.registry.unregister(&server).await?)
    }

    /// Connects one server.
    ///
    /// # Errors
    ///
    /// Returns domain or connection errors.
    pub async fn connect(&self, name: &str) -> SwitchboardResult<Connection> {
        let server = ServerName::new(name)?;
        Ok(self.connections.connect(&server).await?)
    }

    /// Disconnects one server.
    ///
    /// # Errors
    ///
    /// Returns domain or connection errors.
    pub async fn disconnect(&self, name: &str) -> SwitchboardResult<()> {
        let server = ServerName::new(name)?;
        Ok(self.connections.disconnect(&server).await?)
    }

    /// Reconnects one server, applying a changed URL.
    ///
    /// # Errors
    ///
    /// Returns domain or connection errors.
    pub async fn reconnect(&self, name: &str) -> SwitchboardResult<Connection> {
        let server = ServerName::new(name)?;
        Ok(self.connections.reconnect(&server).await?)
    }

    /// Connects every matching auto-connect server.
    pub async fn connect_all(
        &self,
        query: &ServerQuery,
    ) -> Vec<(ServerName, Result<Connection, ConnectionError>)> {
        self.connections.connect_all(query).await
    }

    /// Runs one discovery cycle across every source.
    pub async fn discover_now(&self) -> Vec<SourceReport> {
        self.discovery.run_cycle().await
    }

    /// Runs one probe round.
    pub async fn probe_now(&self) -> Vec<(ServerName, ProbeOutcome)> {
        self.health.probe_all().await
    }

    /// Returns the aggregate tool catalog.
    #[must_use]
    pub fn catalog(&self) -> Arc<ToolCatalog> {
        self.connections.catalog()
    }

    /// Routes a tool call.
    ///
    /// # Errors
    ///
    /// Returns [`SwitchboardError::Domain`] for an invalid server hint and
    /// [`SwitchboardError::Route`] when routing fails.
    pub async fn route(
        &self,
        tool_name: &str,
        arguments: Value,
        preferred: Option<&str>,
    ) -> SwitchboardResult<RoutedCall> {
        let hint = preferred.map(ServerName::new).transpose()?;
        Ok(self.router.route(tool_name, arguments, hint.as_ref()).await?)
    }

    /// Routes a tool call unless `token` is cancelled first.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Switchboard::route`], or
    /// [`RouteError::Cancelled`].
    pub async fn route_cancellable(
        &self,
        tool_name: &str,
        arguments: Value,
        preferred: Option<&str>,
        token: &CancellationToken,
    ) -> SwitchboardResult<RoutedCall> {
        let hint = preferred.map(ServerName::new).transpose()?;
        Ok(self
            .router
            .route_cancellable(tool_name, arguments, hint.as_ref(), token)
            .await?)
    }

    /// Returns registrations not seen within `max_age`.
    pub async fn stale(&self, max_age: chrono::Duration) -> Vec<ServerRegistration> {
        self.registry.stale(max_age).await
    }

    /// Subscribes to registry change events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    /// Returns the connection manager.
    #[must_use]
    pub const fn connections(&self) -> &Arc<ConnectionManager<S, T, C>> {
        &self.connections
    }

    /// Returns the health monitor.
    #[must_use]
    pub const fn health(&self) -> &Arc<HealthMonitor<S, T, H, C>> {
        &self.health
    }

    /// Stops background tasks and closes every connection.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
        self.connections.disconnect_all().await;
        info!("switchboard stopped");
    }
}

impl<S, T, H, C> Switchboard<S, T, H, C>
where
    S: RegistryStore + 'static,
    T: Transport + 'static,
    H: HealthCheck + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Connects registered auto-connect servers, then starts the discovery
    /// and health background tasks.
    ///
    /// Calling `start` again after it has started does nothing.
    pub async fn start(&self) {
        if !self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
        {
            return;
        }

        for (server, outcome) in self.connections.connect_all(&ServerQuery::all()).await {
            if let Err(err) = outcome {
                warn!(server = %server, error = %err, "startup connect failed");
            }
        }

        let discovery = tokio::spawn(Arc::clone(&self.discovery).run(self.shutdown.child_token()));
        let health = tokio::spawn(Arc::clone(&self.health).run(self.shutdown.child_token()));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([discovery, health]);
        info!("switchboard started");
    }
}
