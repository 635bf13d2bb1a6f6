//! Connection manager: live transport sessions and the aggregate catalog.

use super::registry::{RegistryError, ServerQuery, ServiceRegistry};
use crate::fleet::{
    domain::{ConnectionId, ServerName, ServerStatus, ToolCatalog, ToolDescriptor},
    ports::{RegistryStore, Transport, TransportError, TransportResult, TransportSession},
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use mockable::Clock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Service-level errors for connection operations.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// No record exists with the given name.
    #[error("server '{0}' is not registered")]
    NotFound(ServerName),

    /// The transport could not open a session or list tools.
    #[error("could not connect to server '{server}': {reason}")]
    ConnectionFailure {
        /// Server being connected.
        server: ServerName,
        /// Underlying transport failure.
        #[source]
        reason: TransportError,
    },

    /// The attempt was cancelled before it completed.
    #[error("connection attempt to server '{0}' was cancelled")]
    Cancelled(ServerName),

    /// Registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// A live session to one server together with its tool list.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    server: ServerName,
    url: String,
    opened_at: DateTime<Utc>,
    tools: Vec<ToolDescriptor>,
    session: Arc<dyn TransportSession>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("url", &self.url)
            .field("opened_at", &self.opened_at)
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Returns the connection identifier.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the connected server.
    #[must_use]
    pub const fn server(&self) -> &ServerName {
        &self.server
    }

    /// Returns the URL the session was opened against.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns when the session was opened.
    #[must_use]
    pub const fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Returns the tools listed when the session was opened.
    #[must_use]
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// Invokes a tool, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the call fails or times out.
    pub async fn call(
        &self,
        tool_name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> TransportResult<Value> {
        tokio::time::timeout(timeout, self.session.call(tool_name, arguments, timeout))
            .await
            .map_err(|_elapsed| TransportError::Timeout(timeout))?
    }

    /// Lists the server's tools, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the request fails or times out.
    pub async fn list_tools(&self, timeout: Duration) -> TransportResult<Vec<ToolDescriptor>> {
        tokio::time::timeout(timeout, self.session.list_tools())
            .await
            .map_err(|_elapsed| TransportError::Timeout(timeout))?
    }

    async fn close(&self) {
        if let Err(err) = self.session.close().await {
            debug!(server = %self.server, error = %err, "session close failed");
        }
    }
}

/// Closes an opened session unless it is handed over to the table.
///
/// A connect future dropped between opening and storing the session
/// releases it from `Drop`.
struct SessionGuard {
    server: ServerName,
    session: Option<Arc<dyn TransportSession>>,
}

impl SessionGuard {
    fn new(server: ServerName, session: Arc<dyn TransportSession>) -> Self {
        Self {
            server,
            session: Some(session),
        }
    }

    fn session(&self) -> Option<&Arc<dyn TransportSession>> {
        self.session.as_ref()
    }

    fn disarm(mut self) -> Option<Arc<dyn TransportSession>> {
        self.session.take()
    }

    async fn release(mut self) {
        if let Some(session) = self.session.take()
            && let Err(err) = session.close().await
        {
            debug!(server = %self.server, error = %err, "partial session close failed");
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let server = self.server.clone();
        handle.spawn(async move {
            if let Err(err) = session.close().await {
                debug!(server = %server, error = %err, "abandoned session close failed");
            }
        });
    }
}

/// Owns every live [`Connection`] and the catalog derived from them.
///
/// Operations on one server are serialised by a per-server async mutex;
/// different servers proceed in parallel. The connection table and the
/// catalog use short synchronous locks that are never held across an
/// await, so [`ConnectionManager::catalog`] never waits on a connect.
pub struct ConnectionManager<S, T, C>
where
    S: RegistryStore,
    T: Transport,
    C: Clock + Send + Sync,
{
    registry: Arc<ServiceRegistry<S, C>>,
    transport: Arc<T>,
    clock: Arc<C>,
    connect_timeout: Duration,
    connections: RwLock<HashMap<ServerName, Connection>>,
    catalog: RwLock<Arc<ToolCatalog>>,
    server_locks: Mutex<HashMap<ServerName, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S, T, C> ConnectionManager<S, T, C>
where
    S: RegistryStore,
    T: Transport,
    C: Clock + Send + Sync,
{
    /// Creates a manager with no open connections.
    #[must_use]
    pub fn new(
        registry: Arc<ServiceRegistry<S, C>>,
        transport: Arc<T>,
        clock: Arc<C>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            clock,
            connect_timeout,
            connections: RwLock::new(HashMap::new()),
            catalog: RwLock::new(Arc::new(ToolCatalog::new())),
            server_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the registry this manager reports status changes to.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ServiceRegistry<S, C>> {
        &self.registry
    }

    /// Connects a registered server.
    ///
    /// Connecting an already connected server returns the existing
    /// connection. On failure any partially opened session is closed and
    /// the record moves to `failed`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotFound`] for unknown names,
    /// [`ConnectionError::ConnectionFailure`] when the transport fails, or
    /// registry errors for illegal transitions.
    pub async fn connect(&self, name: &ServerName) -> ConnectionResult<Connection> {
        let _guard = self.lock_server(name).await;
        self.connect_locked(name).await
    }

    /// Connects a server unless `token` is cancelled first.
    ///
    /// A cancelled attempt releases any partially opened session and marks
    /// the record `failed`. An attempt cancelled after it fully connected
    /// keeps and returns its connection.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Cancelled`] when the token fires, or any
    /// error of [`ConnectionManager::connect`].
    pub async fn connect_cancellable(
        &self,
        name: &ServerName,
        token: &CancellationToken,
    ) -> ConnectionResult<Connection> {
        tokio::select! {
            biased;
            () = token.cancelled() => {
                let _guard = self.lock_server(name).await;
                if let Some(connection) = self.settle_cancelled(name).await? {
                    return Ok(connection);
                }
                info!(server = %name, "connection attempt cancelled");
                Err(ConnectionError::Cancelled(name.clone()))
            }
            result = self.connect(name) => result,
        }
    }

    /// Reconciles the table with the record after a connect future was
    /// dropped at an arbitrary await. Callers hold the server lock.
    async fn settle_cancelled(&self, name: &ServerName) -> ConnectionResult<Option<Connection>> {
        let status = self.status_of(name).await;
        let live = self.connection(name);
        let connected = matches!(
            status,
            Some(ServerStatus::Connected | ServerStatus::Unhealthy)
        );
        if connected && live.is_some() {
            return Ok(live);
        }

        if live.is_some() {
            self.teardown(name).await;
        }
        match status {
            Some(ServerStatus::Connecting) => self.transition(name, ServerStatus::Failed).await?,
            Some(ServerStatus::Connected | ServerStatus::Unhealthy) => {
                self.transition(name, ServerStatus::Disconnected).await?;
            }
            _ => {}
        }
        Ok(None)
    }

    async fn connect_locked(&self, name: &ServerName) -> ConnectionResult<Connection> {
        if let Some(existing) = self.connection(name) {
            let status = self.status_of(name).await;
            if matches!(status, Some(ServerStatus::Connected | ServerStatus::Unhealthy)) {
                return Ok(existing);
            }
            warn!(server = %name, "connection outlived its record status, replacing it");
            self.teardown(name).await;
        }

        let registration = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| ConnectionError::NotFound(name.clone()))?;
        self.transition(name, ServerStatus::Connecting).await?;
        debug!(server = %name, url = registration.url(), "opening session");

        match self.open_session(name, registration.url()).await {
            Ok((guard, tools)) => {
                let Some(session) = guard.disarm() else {
                    return Err(ConnectionError::Cancelled(name.clone()));
                };
                let connection = Connection {
                    id: ConnectionId::new(),
                    server: name.clone(),
                    url: registration.url().to_owned(),
                    opened_at: self.clock.utc(),
                    tools,
                    session,
                };
                self.update_table(|table| {
                    table.insert(name.clone(), connection.clone());
                });
                if let Err(err) = self.transition(name, ServerStatus::Connected).await {
                    self.teardown(name).await;
                    return Err(err);
                }
                self.stamp_contact(name).await;
                info!(
                    server = %name,
                    connection = %connection.id(),
                    tools = connection.tools().len(),
                    "server connected"
                );
                Ok(connection)
            }
            Err(reason) => {
                warn!(server = %name, error = %reason, "connection attempt failed");
                self.transition(name, ServerStatus::Failed).await?;
                Err(ConnectionError::ConnectionFailure {
                    server: name.clone(),
                    reason,
                })
            }
        }
    }

    async fn open_session(
        &self,
        name: &ServerName,
        url: &str,
    ) -> TransportResult<(SessionGuard, Vec<ToolDescriptor>)> {
        let opened = tokio::time::timeout(self.connect_timeout, self.transport.open(url))
            .await
            .map_err(|_elapsed| TransportError::Timeout(self.connect_timeout))??;
        let guard = SessionGuard::new(name.clone(), Arc::from(opened));
        let Some(session) = guard.session().cloned() else {
            return Err(TransportError::Closed);
        };

        match tokio::time::timeout(self.connect_timeout, session.list_tools()).await {
            Ok(Ok(tools)) => Ok((guard, tools)),
            Ok(Err(err)) => {
                guard.release().await;
                Err(err)
            }
            Err(_elapsed) => {
                guard.release().await;
                Err(TransportError::Timeout(self.connect_timeout))
            }
        }
    }

    /// Closes a server's connection and marks it `disconnected`.
    ///
    /// Disconnecting a server that is not connected is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotFound`] when the name is neither
    /// registered nor connected, or registry errors.
    pub async fn disconnect(&self, name: &ServerName) -> ConnectionResult<()> {
        let _guard = self.lock_server(name).await;
        self.disconnect_locked(name).await
    }

    /// Disconnects while the caller holds the server lock.
    pub(crate) async fn disconnect_locked(&self, name: &ServerName) -> ConnectionResult<()> {
        let closed = self.teardown(name).await;

        let Some(status) = self.status_of(name).await else {
            return if closed {
                Ok(())
            } else {
                Err(ConnectionError::NotFound(name.clone()))
            };
        };
        if status.can_disconnect() {
            self.transition(name, ServerStatus::Disconnected).await?;
            info!(server = %name, "server disconnected");
        }
        Ok(())
    }

    /// Disconnects and connects again, picking up a changed URL.
    ///
    /// # Errors
    ///
    /// Returns any error of [`ConnectionManager::disconnect`] or
    /// [`ConnectionManager::connect`].
    pub async fn reconnect(&self, name: &ServerName) -> ConnectionResult<Connection> {
        self.disconnect(name).await?;
        self.connect(name).await
    }

    /// Connects every matching `auto_connect` record that has no live
    /// connection. All attempts run concurrently; failures do not stop the
    /// others.
    pub async fn connect_all(
        &self,
        query: &ServerQuery,
    ) -> Vec<(ServerName, ConnectionResult<Connection>)> {
        let candidates: Vec<ServerName> = self
            .registry
            .list(query)
            .await
            .into_iter()
            .filter(|registration| registration.auto_connect())
            .map(|registration| registration.name().clone())
            .filter(|name| self.connection(name).is_none())
            .collect();

        let attempts = candidates.iter().map(|name| async move {
            let outcome = self.connect(name).await;
            (name.clone(), outcome)
        });
        join_all(attempts).await
    }

    /// Disconnects every connected server.
    pub async fn disconnect_all(&self) {
        let names = self.connected_servers();
        let outcomes = join_all(names.iter().map(|name| self.disconnect(name))).await;
        for (name, outcome) in names.iter().zip(outcomes) {
            if let Err(err) = outcome {
                warn!(server = %name, error = %err, "disconnect during shutdown failed");
            }
        }
    }

    /// Returns the current aggregate catalog.
    #[must_use]
    pub fn catalog(&self) -> Arc<ToolCatalog> {
        Arc::clone(
            &self
                .catalog
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Returns the live connection of a server.
    #[must_use]
    pub fn connection(&self, name: &ServerName) -> Option<Connection> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Returns the names of every connected server, sorted.
    #[must_use]
    pub fn connected_servers(&self) -> Vec<ServerName> {
        let mut names: Vec<ServerName> = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Acquires the per-server operation lock.
    pub(crate) async fn lock_server(&self, name: &ServerName) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .server_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(name.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Removes and closes a server's connection without touching its
    /// status. Returns whether a connection existed. Callers hold the
    /// server lock.
    pub(crate) async fn teardown(&self, name: &ServerName) -> bool {
        let removed = self.update_table(|table| table.remove(name));
        match removed {
            Some(connection) => {
                connection.close().await;
                true
            }
            None => false,
        }
    }

    /// Moves a record to `status`, tolerating save failures.
    pub(crate) async fn transition(
        &self,
        name: &ServerName,
        status: ServerStatus,
    ) -> ConnectionResult<()> {
        match self.registry.update_status(name, status).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(ConnectionError::NotFound(name.clone())),
            Err(RegistryError::Persistence(err)) => {
                warn!(server = %name, status = %status, error = %err, "status change not persisted");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) async fn stamp_contact(&self, name: &ServerName) {
        if let Err(err) = self.registry.record_contact(name).await {
            warn!(server = %name, error = %err, "last_seen not persisted");
        }
    }

    async fn status_of(&self, name: &ServerName) -> Option<ServerStatus> {
        self.registry
            .get(name)
            .await
            .map(|registration| registration.status())
    }

    fn update_table<R>(&self, apply: impl FnOnce(&mut HashMap<ServerName, Connection>) -> R) -> R {
        let mut table = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let result = apply(&mut table);
        let catalog = ToolCatalog::from_servers(
            table
                .iter()
                .map(|(name, connection)| (name.clone(), connection.tools.clone())),
        );
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(catalog);
        result
    }
}
