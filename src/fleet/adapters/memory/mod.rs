//! In-memory adapters for tests and embedded use.

mod store;
mod transport;

pub use store::InMemoryRegistryStore;
pub use transport::InMemoryTransport;
