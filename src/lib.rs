//! Switchboard: registry, discovery, health monitoring and routing for
//! remote tool servers.
//!
//! Switchboard keeps track of which tool servers exist, which of them are
//! reachable, and which tools they offer, and forwards tool calls to a
//! suitable server.
//!
//! # Architecture
//!
//! Switchboard follows hexagonal architecture principles:
//!
//! - **Domain**: Registrations, the lifecycle state machine, tool catalogs
//! - **Ports**: Abstract traits for storage, transport, health checks and
//!   discovery sources
//! - **Adapters**: In-memory, JSON file and HTTP implementations of ports
//!
//! # Modules
//!
//! - [`fleet`]: Registry, connection, health, discovery and routing services
//! - [`config`]: File-based configuration and engine assembly

pub mod config;
pub mod fleet;
