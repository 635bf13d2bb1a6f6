//! Port contracts for registry storage, server transport, health checks and
//! discovery sources.

mod health;
mod source;
mod store;
mod transport;

#[cfg(test)]
pub use health::MockHealthCheck;
pub use health::{HealthCheck, HealthCheckError};
pub use source::{DiscoverySource, DiscoverySourceError};
pub use store::{
    RegistrySnapshot, RegistryStore, RegistryStoreError, RegistryStoreResult, SNAPSHOT_VERSION,
    SnapshotMetadata,
};
pub use transport::{Transport, TransportError, TransportResult, TransportSession};
