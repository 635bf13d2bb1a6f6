//! Adapter implementations for registry storage, server transport, health
//! checks and discovery sources.

pub mod memory;
pub mod sources;

mod file_store;
mod http_health;
mod jsonrpc_http;

pub use file_store::JsonFileRegistryStore;
pub use http_health::HttpHealthCheck;
pub use jsonrpc_http::HttpJsonRpcTransport;
