//! Discovery engine: ingests discovery documents into the registry.

use super::connections::ConnectionManager;
use super::registry::{RegistrationOutcome, RegistryError};
use crate::fleet::{
    domain::{DiscoveryDocument, ServerDescriptor, ServerName, ServerRegistration, ServerStatus},
    ports::{DiscoverySource, DiscoverySourceError, RegistryStore, Transport},
};
use futures::FutureExt;
use futures::future::join_all;
use mockable::Clock;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters for one ingested document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Whether the source produced a new document this cycle.
    pub document_changed: bool,
    /// Valid records in the document.
    pub seen: usize,
    /// Records skipped because of invalid fields.
    pub rejected: usize,
    /// Records that created a registration.
    pub created: usize,
    /// Records that changed an existing registration.
    pub updated: usize,
    /// Connect attempts triggered by the document.
    pub connect_attempts: usize,
    /// Connect attempts that succeeded.
    pub connected: usize,
}

/// Outcome of one cycle of one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReport {
    /// Source name.
    pub source: String,
    /// Counters, or the error that skipped the cycle.
    pub outcome: Result<IngestSummary, DiscoverySourceError>,
}

/// Runs discovery sources and merges what they find into the registry.
///
/// Discovery is additive: records missing from a document are never
/// removed. Records with `auto_connect` whose status is `unknown`,
/// `registered` or `failed` are connected after ingestion; records an
/// operator disconnected are left alone.
pub struct DiscoveryEngine<S, T, C>
where
    S: RegistryStore,
    T: Transport,
    C: Clock + Send + Sync,
{
    connections: Arc<ConnectionManager<S, T, C>>,
    sources: Vec<Arc<dyn DiscoverySource>>,
}

impl<S, T, C> DiscoveryEngine<S, T, C>
where
    S: RegistryStore,
    T: Transport,
    C: Clock + Send + Sync,
{
    /// Creates an engine over `sources`.
    #[must_use]
    pub const fn new(
        connections: Arc<ConnectionManager<S, T, C>>,
        sources: Vec<Arc<dyn DiscoverySource>>,
    ) -> Self {
        Self {
            connections,
            sources,
        }
    }

    /// Returns the configured source names.
    #[must_use]
    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|source| source.name()).collect()
    }

    /// Forces one cycle across every source.
    pub async fn run_cycle(&self) -> Vec<SourceReport> {
        join_all(
            self.sources
                .iter()
                .map(|source| self.poll_source(source.as_ref())),
        )
        .await
    }

    async fn poll_source(&self, source: &dyn DiscoverySource) -> SourceReport {
        let polled = tokio::time::timeout(source.interval(), source.poll())
            .await
            .unwrap_or_else(|_elapsed| {
                Err(DiscoverySourceError::Timeout {
                    source_name: source.name().to_owned(),
                })
            });

        let outcome = match polled {
            Ok(Some(document)) => Ok(self.ingest(source.name(), document).await),
            Ok(None) => {
                debug!(source = source.name(), "discovery document unchanged");
                Ok(IngestSummary::default())
            }
            Err(err) => {
                warn!(source = source.name(), error = %err, "discovery cycle skipped");
                Err(err)
            }
        };
        SourceReport {
            source: source.name().to_owned(),
            outcome,
        }
    }

    /// Merges a document into the registry and connects eligible records.
    pub async fn ingest(&self, source_name: &str, document: DiscoveryDocument) -> IngestSummary {
        let mut summary = IngestSummary {
            document_changed: true,
            rejected: document.rejected().len(),
            ..IngestSummary::default()
        };
        for rejected in document.rejected() {
            warn!(
                source = source_name,
                index = rejected.index,
                reason = %rejected.reason,
                "discovery record skipped"
            );
        }

        let mut to_connect = Vec::new();
        for descriptor in document.into_servers() {
            summary.seen += 1;
            let Some((registration, outcome)) = self.merge(source_name, descriptor).await else {
                continue;
            };
            match outcome {
                RegistrationOutcome::Created => summary.created += 1,
                RegistrationOutcome::Updated => summary.updated += 1,
                RegistrationOutcome::Unchanged => {}
            }
            self.warn_if_endpoint_stale(&registration);
            if wants_connect(&registration) {
                to_connect.push(registration.name().clone());
            }
        }

        summary.connect_attempts = to_connect.len();
        summary.connected = self.connect_discovered(&to_connect).await;
        info!(
            source = source_name,
            seen = summary.seen,
            created = summary.created,
            updated = summary.updated,
            connected = summary.connected,
            "discovery document ingested"
        );
        summary
    }

    async fn merge(
        &self,
        source_name: &str,
        descriptor: ServerDescriptor,
    ) -> Option<(ServerRegistration, RegistrationOutcome)> {
        let name = descriptor.name().clone();
        let registry = self.connections.registry();
        match registry.register(descriptor).await {
            Ok(registered) => Some(registered),
            Err(RegistryError::Persistence(err)) => {
                warn!(source = source_name, server = %name, error = %err, "discovered record not persisted");
                registry
                    .get(&name)
                    .await
                    .map(|registration| (registration, RegistrationOutcome::Updated))
            }
            Err(err) => {
                warn!(source = source_name, server = %name, error = %err, "discovered record rejected");
                None
            }
        }
    }

    fn warn_if_endpoint_stale(&self, registration: &ServerRegistration) {
        if let Some(connection) = self.connections.connection(registration.name())
            && connection.url() != registration.url()
        {
            warn!(
                server = %registration.name(),
                connected_url = connection.url(),
                registered_url = registration.url(),
                "connected endpoint is stale, reconnect to apply the new url"
            );
        }
    }

    async fn connect_discovered(&self, names: &[ServerName]) -> usize {
        let outcomes = join_all(names.iter().map(|name| self.connections.connect(name))).await;
        names
            .iter()
            .zip(outcomes)
            .filter(|(name, outcome)| match outcome {
                Ok(_) => true,
                Err(err) => {
                    warn!(server = %name, error = %err, "discovered server could not be connected");
                    false
                }
            })
            .count()
    }
}

fn wants_connect(registration: &ServerRegistration) -> bool {
    registration.auto_connect()
        && matches!(
            registration.status(),
            ServerStatus::Unknown | ServerStatus::Registered | ServerStatus::Failed
        )
}

impl<S, T, C> DiscoveryEngine<S, T, C>
where
    S: RegistryStore + 'static,
    T: Transport + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Runs every source on its own interval until `token` is cancelled.
    ///
    /// Each source is an independent task. A cycle that panics is logged
    /// and the source continues with its next interval.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut tasks = JoinSet::new();
        for index in 0..self.sources.len() {
            let engine = Arc::clone(&self);
            let child = token.child_token();
            tasks.spawn(async move { engine.run_source(index, child).await });
        }
        info!(sources = self.sources.len(), "discovery engine started");

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "discovery source task ended abnormally");
            }
        }
        info!("discovery engine stopped");
    }

    async fn run_source(&self, index: usize, token: CancellationToken) {
        let Some(source) = self.sources.get(index).map(Arc::clone) else {
            return;
        };
        let mut ticker = tokio::time::interval(source.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    let cycle = AssertUnwindSafe(self.poll_source(source.as_ref()))
                        .catch_unwind()
                        .await;
                    if cycle.is_err() {
                        error!(source = source.name(), "discovery cycle panicked, restarting source");
                    }
                }
            }
        }
        debug!(source = source.name(), "discovery source stopped");
    }
}
