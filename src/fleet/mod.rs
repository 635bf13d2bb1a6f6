//! Tool-server fleet management for Switchboard.
//!
//! This module keeps a durable registry of remote tool servers, discovers
//! new servers from declarative documents and discovery services, holds
//! live sessions with a health state machine, and routes tool calls to the
//! best capable server. The module follows hexagonal architecture:
//!
//! - Domain types in [`domain`]
//! - Port contracts in [`ports`]
//! - Adapter implementations in [`adapters`]
//! - Orchestration services in [`services`]

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod services;

#[cfg(test)]
mod tests;
