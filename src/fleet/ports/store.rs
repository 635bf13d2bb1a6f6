//! Storage port for durable registry snapshots.

use crate::fleet::domain::ServerRegistration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Layout version written into every snapshot.
pub const SNAPSHOT_VERSION: &str = "1";

/// Result type for registry store operations.
pub type RegistryStoreResult<T> = Result<T, RegistryStoreError>;

/// Bookkeeping written alongside the registrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// When the snapshot was taken.
    pub last_updated: DateTime<Utc>,
    /// Tag naming the process or deployment that wrote the snapshot.
    pub source: String,
    /// Snapshot layout version.
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    SNAPSHOT_VERSION.to_owned()
}

/// Full persisted registry state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Every registration, including status and timestamps.
    pub servers: Vec<ServerRegistration>,
    /// Snapshot bookkeeping.
    pub metadata: SnapshotMetadata,
}

impl RegistrySnapshot {
    /// Creates a snapshot stamped with `last_updated`.
    #[must_use]
    pub fn new(
        servers: Vec<ServerRegistration>,
        source: impl Into<String>,
        last_updated: DateTime<Utc>,
    ) -> Self {
        Self {
            servers,
            metadata: SnapshotMetadata {
                last_updated,
                source: source.into(),
                version: default_version(),
            },
        }
    }
}

/// Durable snapshot storage for the service registry.
///
/// Implementations must replace the stored snapshot atomically: a crash
/// during [`RegistryStore::save`] leaves either the previous or the new
/// snapshot, never a truncated one.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Loads the last saved snapshot, or `None` when nothing was saved yet.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryStoreError::Corrupt`] when stored data cannot be
    /// decoded and [`RegistryStoreError::Io`] on storage failures.
    async fn load(&self) -> RegistryStoreResult<Option<RegistrySnapshot>>;

    /// Replaces the stored snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryStoreError::Io`] when the snapshot cannot be
    /// written.
    async fn save(&self, snapshot: &RegistrySnapshot) -> RegistryStoreResult<()>;
}

/// Errors returned by registry store implementations.
#[derive(Debug, Clone, Error)]
pub enum RegistryStoreError {
    /// Stored data exists but cannot be decoded.
    #[error("corrupt registry snapshot: {0}")]
    Corrupt(Arc<dyn std::error::Error + Send + Sync>),

    /// Storage-layer failure.
    #[error("registry storage error: {0}")]
    Io(Arc<dyn std::error::Error + Send + Sync>),
}

impl RegistryStoreError {
    /// Wraps a decoding failure.
    pub fn corrupt(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Corrupt(Arc::new(err))
    }

    /// Wraps a storage failure.
    pub fn io(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Io(Arc::new(err))
    }
}
