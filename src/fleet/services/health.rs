//! Health monitor: periodic probes, escalation and reconnect backoff.

use super::connections::{Connection, ConnectionManager};
use super::registry::ServerQuery;
use crate::fleet::{
    domain::{ConnectionId, ServerName, ServerStatus},
    ports::{HealthCheck, HealthCheckError, RegistryStore, Transport, TransportError},
};
use futures::future::join_all;
use mockable::Clock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Probe, escalation and reconnect settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    /// Time between probe rounds.
    pub probe_interval_ms: u64,
    /// Upper bound for one probe.
    pub probe_timeout_ms: u64,
    /// Consecutive failures, counted from the first, that escalate to
    /// `failed`.
    pub failure_threshold: u32,
    /// Reconnect attempts made from `failed` before giving up.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt.
    pub backoff_base_ms: u64,
    /// Ceiling for the doubling reconnect delay.
    pub backoff_max_ms: u64,
    /// Connected servers not seen for this long are disconnected each
    /// round. Their registrations stay. Unset disables the sweep.
    pub stale_after_secs: Option<u64>,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            probe_interval_ms: 60_000,
            probe_timeout_ms: 10_000,
            failure_threshold: 3,
            max_reconnect_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            stale_after_secs: None,
        }
    }
}

impl HealthPolicy {
    /// Returns the probe interval.
    #[must_use]
    pub const fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Returns the probe timeout.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Returns the stale-sweep age, if the sweep is enabled.
    #[must_use]
    pub fn stale_after(&self) -> Option<chrono::Duration> {
        self.stale_after_secs
            .and_then(|secs| chrono::Duration::from_std(Duration::from_secs(secs)).ok())
    }

    /// Returns the delay before reconnect attempt `attempt` (1-based):
    /// `backoff_base * 2^(attempt - 1)`, capped at `backoff_max`.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1_u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        Duration::from_millis(self.backoff_base_ms)
            .saturating_mul(factor)
            .min(Duration::from_millis(self.backoff_max_ms))
    }
}

/// Why a probe failed. Drives status changes only; never returned to
/// callers of the engine.
#[derive(Debug, Clone, Error)]
pub enum ProbeFailure {
    /// The explicit health endpoint reported a problem.
    #[error(transparent)]
    Endpoint(#[from] HealthCheckError),
    /// The protocol-native probe failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The probe did not finish in time.
    #[error("probe timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

/// Result of probing one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The probe succeeded.
    Healthy,
    /// The probe failed; `failures` consecutive failures so far.
    Unhealthy {
        /// Consecutive failures including this one.
        failures: u32,
    },
    /// The failure threshold was reached and the connection torn down.
    Failed,
    /// The server had no connection, or it changed while probing.
    Skipped,
}

#[derive(Debug, Default)]
struct ReconnectBook {
    active: HashSet<ServerName>,
    exhausted: HashSet<ServerName>,
}

/// Probes connected servers and drives the health state machine.
pub struct HealthMonitor<S, T, H, C>
where
    S: RegistryStore,
    T: Transport,
    H: HealthCheck,
    C: Clock + Send + Sync,
{
    connections: Arc<ConnectionManager<S, T, C>>,
    health_check: Arc<H>,
    policy: HealthPolicy,
    failures: Mutex<HashMap<ServerName, (ConnectionId, u32)>>,
    reconnects: Mutex<ReconnectBook>,
}

impl<S, T, H, C> HealthMonitor<S, T, H, C>
where
    S: RegistryStore,
    T: Transport,
    H: HealthCheck,
    C: Clock + Send + Sync,
{
    /// Creates a monitor over `connections`.
    #[must_use]
    pub fn new(
        connections: Arc<ConnectionManager<S, T, C>>,
        health_check: Arc<H>,
        policy: HealthPolicy,
    ) -> Self {
        Self {
            connections,
            health_check,
            policy,
            failures: Mutex::new(HashMap::new()),
            reconnects: Mutex::new(ReconnectBook::default()),
        }
    }

    /// Returns the active policy.
    #[must_use]
    pub const fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Probes every connected server concurrently.
    pub async fn probe_all(&self) -> Vec<(ServerName, ProbeOutcome)> {
        let names = self.connections.connected_servers();
        let outcomes = join_all(names.iter().map(|name| self.probe(name))).await;
        names.into_iter().zip(outcomes).collect()
    }

    /// Probes one server and applies the result to its status.
    ///
    /// A probe uses the registration's `health_check_url` when present and
    /// the session's tool listing otherwise. Every probe stamps
    /// `last_checked`; a success also stamps `last_seen`.
    pub async fn probe(&self, name: &ServerName) -> ProbeOutcome {
        let Some(connection) = self.connections.connection(name) else {
            return ProbeOutcome::Skipped;
        };
        let health_url = self
            .connections
            .registry()
            .get(name)
            .await
            .and_then(|registration| registration.health_check_url().map(str::to_owned));
        let result = self.run_probe(&connection, health_url.as_deref()).await;

        let _guard = self.connections.lock_server(name).await;
        let current = self.connections.connection(name).map(|live| live.id());
        if current != Some(connection.id()) {
            debug!(server = %name, "connection changed during probe, result dropped");
            return ProbeOutcome::Skipped;
        }

        if let Err(err) = self.connections.registry().record_check(name).await {
            warn!(server = %name, error = %err, "last_checked not persisted");
        }
        match result {
            Ok(()) => self.on_success(name).await,
            Err(failure) => self.on_failure(name, connection.id(), &failure).await,
        }
    }

    async fn run_probe(
        &self,
        connection: &Connection,
        health_url: Option<&str>,
    ) -> Result<(), ProbeFailure> {
        let timeout = self.policy.probe_timeout();
        let probe = async {
            match health_url {
                Some(url) => self
                    .health_check
                    .check(url, timeout)
                    .await
                    .map_err(ProbeFailure::from),
                None => connection
                    .list_tools(timeout)
                    .await
                    .map(|_tools| ())
                    .map_err(ProbeFailure::from),
            }
        };
        tokio::time::timeout(timeout, probe)
            .await
            .map_err(|_elapsed| ProbeFailure::Timeout(timeout))?
    }

    async fn on_success(&self, name: &ServerName) -> ProbeOutcome {
        self.failure_counts().remove(name);
        let recovering = self
            .connections
            .registry()
            .get(name)
            .await
            .is_some_and(|registration| registration.status() == ServerStatus::Unhealthy);
        if recovering {
            self.set_status(name, ServerStatus::Connected).await;
            info!(server = %name, "server recovered");
        }
        self.connections.stamp_contact(name).await;
        ProbeOutcome::Healthy
    }

    async fn on_failure(
        &self,
        name: &ServerName,
        connection: ConnectionId,
        failure: &ProbeFailure,
    ) -> ProbeOutcome {
        // A replaced connection starts counting from zero.
        let failures = {
            let mut counts = self.failure_counts();
            let entry = counts.entry(name.clone()).or_insert((connection, 0));
            if entry.0 != connection {
                *entry = (connection, 0);
            }
            entry.1 = entry.1.saturating_add(1);
            entry.1
        };
        warn!(server = %name, failures, error = %failure, "health probe failed");
        self.set_status(name, ServerStatus::Unhealthy).await;

        if failures < self.policy.failure_threshold {
            return ProbeOutcome::Unhealthy { failures };
        }

        self.failure_counts().remove(name);
        self.connections.teardown(name).await;
        self.set_status(name, ServerStatus::Failed).await;
        warn!(server = %name, failures, "failure threshold reached, connection torn down");
        ProbeOutcome::Failed
    }

    async fn set_status(&self, name: &ServerName, status: ServerStatus) {
        if let Err(err) = self.connections.transition(name, status).await {
            warn!(server = %name, status = %status, error = %err, "status change rejected");
        }
    }

    /// Disconnects connected servers whose `last_seen` is older than the
    /// policy's stale age and returns their names. Registrations are kept
    /// so a later connect or discovery pass can bring them back.
    pub async fn sweep_stale(&self) -> Vec<ServerName> {
        let Some(max_age) = self.policy.stale_after() else {
            return Vec::new();
        };
        let stale: Vec<ServerName> = self
            .connections
            .registry()
            .stale(max_age)
            .await
            .into_iter()
            .map(|registration| registration.name().clone())
            .filter(|name| self.connections.connection(name).is_some())
            .collect();

        let mut swept = Vec::with_capacity(stale.len());
        for name in stale {
            match self.connections.disconnect(&name).await {
                Ok(()) => {
                    info!(server = %name, "stale server disconnected");
                    swept.push(name);
                }
                Err(err) => warn!(server = %name, error = %err, "stale disconnect failed"),
            }
        }
        swept
    }

    /// Retries a `failed` server with exponential backoff.
    ///
    /// Stops early when the server leaves `failed` by other means or the
    /// token is cancelled. Returns whether a reconnect succeeded.
    pub async fn reconnect_with_backoff(&self, name: &ServerName, token: &CancellationToken) -> bool {
        for attempt in 1..=self.policy.max_reconnect_attempts {
            let delay = self.policy.backoff_delay(attempt);
            tokio::select! {
                () = token.cancelled() => {
                    self.finish_reconnect(name, false);
                    return false;
                }
                () = tokio::time::sleep(delay) => {}
            }

            let still_failed = self
                .connections
                .registry()
                .get(name)
                .await
                .is_some_and(|registration| registration.status() == ServerStatus::Failed);
            if !still_failed {
                self.finish_reconnect(name, false);
                return false;
            }

            match self.connections.connect_cancellable(name, token).await {
                Ok(connection) => {
                    info!(server = %name, attempt, connection = %connection.id(), "server reconnected");
                    self.finish_reconnect(name, false);
                    return true;
                }
                Err(err) => {
                    warn!(server = %name, attempt, error = %err, "reconnect attempt failed");
                }
            }
        }

        warn!(
            server = %name,
            attempts = self.policy.max_reconnect_attempts,
            "reconnect attempts exhausted, server stays failed"
        );
        self.finish_reconnect(name, true);
        false
    }

    /// Claims `failed` auto-connect servers that have no reconnect in
    /// progress and have not exhausted their attempts.
    pub async fn reconnect_candidates(&self) -> Vec<ServerName> {
        let failed: Vec<ServerName> = self
            .connections
            .registry()
            .list(&ServerQuery::all().with_status(ServerStatus::Failed))
            .await
            .into_iter()
            .filter(|registration| registration.auto_connect())
            .map(|registration| registration.name().clone())
            .collect();

        let mut book = self
            .reconnects
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let ReconnectBook { active, exhausted } = &mut *book;
        exhausted.retain(|name| failed.contains(name));
        failed
            .into_iter()
            .filter(|name| !exhausted.contains(name))
            .filter(|name| active.insert(name.clone()))
            .collect()
    }

    fn finish_reconnect(&self, name: &ServerName, exhausted: bool) {
        let mut book = self
            .reconnects
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        book.active.remove(name);
        if exhausted {
            book.exhausted.insert(name.clone());
        }
    }

    fn failure_counts(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ServerName, (ConnectionId, u32)>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S, T, H, C> HealthMonitor<S, T, H, C>
where
    S: RegistryStore + 'static,
    T: Transport + 'static,
    H: HealthCheck + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Runs probe rounds every interval until `token` is cancelled.
    ///
    /// Each round probes every connected server, sweeps stale ones when
    /// enabled, then starts a backoff reconnect task for every newly
    /// claimed `failed` server.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let period = self.policy.probe_interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reconnects = JoinSet::new();
        info!(interval_ms = self.policy.probe_interval_ms, "health monitor started");

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.probe_all().await;
                    self.sweep_stale().await;
                    for name in self.reconnect_candidates().await {
                        let monitor = Arc::clone(&self);
                        let child = token.child_token();
                        reconnects.spawn(async move {
                            monitor.reconnect_with_backoff(&name, &child).await
                        });
                    }
                }
                Some(joined) = reconnects.join_next(), if !reconnects.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = %err, "reconnect task ended abnormally");
                    }
                }
            }
        }

        reconnects.shutdown().await;
        info!("health monitor stopped");
    }
}
