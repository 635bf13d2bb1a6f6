//! Domain model for tool-server registration, status and tool catalogs.
//!
//! The fleet domain models server identity, descriptive registration data,
//! the status state machine, tool descriptors and the aggregate catalog.
//! Infrastructure concerns remain outside this boundary.

mod catalog;
mod document;
mod error;
mod event;
mod ids;
mod registration;
mod status;
mod tool;

pub use catalog::ToolCatalog;
pub use document::{DiscoveredServer, DiscoveryDocument, RejectedEntry};
pub use error::{FleetDomainError, ParseServerStatusError};
pub use event::RegistryEvent;
pub use ids::{ConnectionId, ServerName};
pub use registration::{DEFAULT_PRIORITY, ServerDescriptor, ServerRegistration};
pub use status::ServerStatus;
pub use tool::ToolDescriptor;
