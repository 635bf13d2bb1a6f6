//! Service registry: the authoritative, durable set of server registrations.

use crate::fleet::{
    domain::{
        FleetDomainError, RegistryEvent, ServerDescriptor, ServerName, ServerRegistration,
        ServerStatus,
    },
    ports::{RegistrySnapshot, RegistryStore, RegistryStoreError},
};
use mockable::Clock;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

/// Default broadcast buffer for registry events.
pub const DEFAULT_EVENTS_CAPACITY: usize = 256;

/// Service-level errors for registry operations.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// A strict registration met an existing record with different data.
    #[error("server '{0}' is already registered with different settings")]
    RegistrationConflict(ServerName),

    /// The change was applied in memory but could not be saved.
    #[error("registry change applied but not persisted: {0}")]
    Persistence(#[from] RegistryStoreError),

    /// Domain validation failed.
    #[error(transparent)]
    Domain(#[from] FleetDomainError),
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// What a registration call did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// A new record was inserted.
    Created,
    /// Descriptive fields of an existing record changed.
    Updated,
    /// The submitted data matched the stored record.
    Unchanged,
}

/// Filter for [`ServiceRegistry::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerQuery {
    tags: Vec<String>,
    min_priority: Option<i32>,
    status: Option<ServerStatus>,
}

impl ServerQuery {
    /// Matches every record.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Keeps records carrying any of `tags`.
    #[must_use]
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    /// Keeps records with at least `priority`.
    #[must_use]
    pub const fn with_min_priority(mut self, priority: i32) -> Self {
        self.min_priority = Some(priority);
        self
    }

    /// Keeps records in `status`.
    #[must_use]
    pub const fn with_status(mut self, status: ServerStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Returns the tag filter.
    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Returns whether `registration` passes every filter.
    #[must_use]
    pub fn matches(&self, registration: &ServerRegistration) -> bool {
        registration.matches_any_tag(&self.tags)
            && self
                .min_priority
                .is_none_or(|minimum| registration.priority() >= minimum)
            && self
                .status
                .is_none_or(|status| registration.status() == status)
    }
}

/// Durable registry of tool servers.
///
/// Every mutation is saved through the [`RegistryStore`] while the write
/// lock is held, so readers never observe a record that has not been
/// flushed. A failed save is reported to the caller but the in-memory
/// change stays.
pub struct ServiceRegistry<S, C>
where
    S: RegistryStore,
    C: Clock + Send + Sync,
{
    store: Arc<S>,
    clock: Arc<C>,
    source_tag: String,
    records: RwLock<BTreeMap<ServerName, ServerRegistration>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl<S, C> ServiceRegistry<S, C>
where
    S: RegistryStore,
    C: Clock + Send + Sync,
{
    /// Opens the registry, restoring the last saved snapshot.
    ///
    /// A missing or unreadable snapshot yields an empty registry. Records
    /// that claimed a live connection are restored as `registered`.
    pub async fn open(
        store: Arc<S>,
        clock: Arc<C>,
        source_tag: impl Into<String>,
        events_capacity: usize,
    ) -> Self {
        let records = match store.load().await {
            Ok(Some(snapshot)) => restore(snapshot),
            Ok(None) => BTreeMap::new(),
            Err(err) => {
                warn!(error = %err, "registry snapshot unusable, starting empty");
                BTreeMap::new()
            }
        };
        info!(servers = records.len(), "service registry opened");
        let (events, _) = broadcast::channel(events_capacity.max(1));

        Self {
            store,
            clock,
            source_tag: source_tag.into(),
            records: RwLock::new(records),
            events,
        }
    }

    /// Inserts a new record or merges descriptive fields into an existing
    /// one. Status is never reset by a re-registration.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Persistence`] when the change cannot be
    /// saved.
    pub async fn register(
        &self,
        descriptor: ServerDescriptor,
    ) -> RegistryResult<(ServerRegistration, RegistrationOutcome)> {
        self.upsert(descriptor, false).await
    }

    /// Inserts a record, refusing to overwrite different existing data.
    ///
    /// Registering identical data again succeeds with
    /// [`RegistrationOutcome::Unchanged`].
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::RegistrationConflict`] when the name exists
    /// with different settings, or [`RegistryError::Persistence`].
    pub async fn register_exclusive(
        &self,
        descriptor: ServerDescriptor,
    ) -> RegistryResult<(ServerRegistration, RegistrationOutcome)> {
        self.upsert(descriptor, true).await
    }

    async fn upsert(
        &self,
        descriptor: ServerDescriptor,
        exclusive: bool,
    ) -> RegistryResult<(ServerRegistration, RegistrationOutcome)> {
        let mut records = self.records.write().await;
        let name = descriptor.name().clone();
        let (registration, outcome) = match records.entry(name.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                if exclusive && existing.descriptor() != descriptor {
                    return Err(RegistryError::RegistrationConflict(name));
                }
                let outcome = if existing.merge(descriptor, &*self.clock) {
                    RegistrationOutcome::Updated
                } else {
                    RegistrationOutcome::Unchanged
                };
                (existing.clone(), outcome)
            }
            Entry::Vacant(entry) => {
                let created = ServerRegistration::new(descriptor, &*self.clock);
                entry.insert(created.clone());
                (created, RegistrationOutcome::Created)
            }
        };

        let at = self.clock.utc();
        match outcome {
            RegistrationOutcome::Created => {
                info!(server = %name, url = registration.url(), "server registered");
                self.publish(RegistryEvent::Registered { server: name, at });
            }
            RegistrationOutcome::Updated => {
                info!(server = %name, url = registration.url(), "server registration updated");
                self.publish(RegistryEvent::Updated { server: name, at });
            }
            RegistrationOutcome::Unchanged => return Ok((registration, outcome)),
        }

        self.persist(&records).await?;
        Ok((registration, outcome))
    }

    /// Removes a record. Returns the removed record, or `None` when the
    /// name was not registered.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Persistence`] when the change cannot be
    /// saved.
    pub async fn unregister(&self, name: &ServerName) -> RegistryResult<Option<ServerRegistration>> {
        let mut records = self.records.write().await;
        let Some(removed) = records.remove(name) else {
            return Ok(None);
        };

        info!(server = %name, "server unregistered");
        self.publish(RegistryEvent::Unregistered {
            server: name.clone(),
            at: self.clock.utc(),
        });
        self.persist(&records).await?;
        Ok(Some(removed))
    }

    /// Returns one record by name.
    pub async fn get(&self, name: &ServerName) -> Option<ServerRegistration> {
        self.records.read().await.get(name).cloned()
    }

    /// Returns matching records, highest priority first, ties by name.
    pub async fn list(&self, query: &ServerQuery) -> Vec<ServerRegistration> {
        let records = self.records.read().await;
        let mut matching: Vec<ServerRegistration> = records
            .values()
            .filter(|registration| query.matches(registration))
            .cloned()
            .collect();
        matching.sort_by(|left, right| {
            right
                .priority()
                .cmp(&left.priority())
                .then_with(|| left.name().cmp(right.name()))
        });
        matching
    }

    /// Moves a record to `status`.
    ///
    /// Setting the current status again is a no-op. Returns `None` when the
    /// record no longer exists.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Domain`] for an illegal transition, or
    /// [`RegistryError::Persistence`].
    pub async fn update_status(
        &self,
        name: &ServerName,
        status: ServerStatus,
    ) -> RegistryResult<Option<ServerRegistration>> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(name) else {
            return Ok(None);
        };
        let Some(previous) = record.transition_to(status, &*self.clock)? else {
            return Ok(Some(record.clone()));
        };

        let updated = record.clone();
        debug!(server = %name, from = %previous, to = %status, "server status changed");
        self.publish(RegistryEvent::StatusChanged {
            server: name.clone(),
            from: previous,
            to: status,
            at: updated.updated_at(),
        });
        self.persist(&records).await?;
        Ok(Some(updated))
    }

    /// Stamps a successful contact with the server.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Persistence`] when the change cannot be
    /// saved.
    pub async fn record_contact(
        &self,
        name: &ServerName,
    ) -> RegistryResult<Option<ServerRegistration>> {
        self.stamp(name, |record, clock| record.record_contact(clock))
            .await
    }

    /// Stamps a probe attempt.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Persistence`] when the change cannot be
    /// saved.
    pub async fn record_check(
        &self,
        name: &ServerName,
    ) -> RegistryResult<Option<ServerRegistration>> {
        self.stamp(name, |record, clock| record.record_check(clock))
            .await
    }

    async fn stamp(
        &self,
        name: &ServerName,
        apply: impl FnOnce(&mut ServerRegistration, &C) + Send,
    ) -> RegistryResult<Option<ServerRegistration>> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(name) else {
            return Ok(None);
        };
        apply(record, &*self.clock);
        let stamped = record.clone();
        self.persist(&records).await?;
        Ok(Some(stamped))
    }

    /// Returns records not seen within `max_age`.
    pub async fn stale(&self, max_age: chrono::Duration) -> Vec<ServerRegistration> {
        let now = self.clock.utc();
        self.records
            .read()
            .await
            .values()
            .filter(|registration| registration.is_stale(now, max_age))
            .cloned()
            .collect()
    }

    /// Subscribes to registry change events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: RegistryEvent) {
        if self.events.send(event).is_err() {
            debug!("registry event dropped: no subscribers");
        }
    }

    async fn persist(
        &self,
        records: &BTreeMap<ServerName, ServerRegistration>,
    ) -> RegistryResult<()> {
        let snapshot = RegistrySnapshot::new(
            records.values().cloned().collect(),
            self.source_tag.clone(),
            self.clock.utc(),
        );
        self.store.save(&snapshot).await.map_err(|err| {
            warn!(error = %err, "registry snapshot save failed");
            RegistryError::Persistence(err)
        })
    }
}

fn restore(snapshot: RegistrySnapshot) -> BTreeMap<ServerName, ServerRegistration> {
    snapshot
        .servers
        .into_iter()
        .map(|mut registration| {
            registration.restore_after_restart();
            (registration.name().clone(), registration)
        })
        .collect()
}
