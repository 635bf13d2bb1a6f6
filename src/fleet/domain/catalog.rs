//! Aggregate tool catalog across connected servers.

use super::{ServerName, ToolDescriptor};
use serde::Serialize;
use std::collections::BTreeMap;

/// Read-only union of every connected server's tools.
///
/// A catalog is built once and never mutated; the connection manager
/// publishes a fresh one whenever a connection opens or closes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolCatalog {
    servers: BTreeMap<ServerName, Vec<ToolDescriptor>>,
    #[serde(skip)]
    providers: BTreeMap<String, Vec<ServerName>>,
}

impl ToolCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a catalog from per-server tool lists.
    ///
    /// A tool listed twice by the same server is recorded once.
    #[must_use]
    pub fn from_servers(
        entries: impl IntoIterator<Item = (ServerName, Vec<ToolDescriptor>)>,
    ) -> Self {
        let mut catalog = Self::new();
        for (server, tools) in entries {
            for tool in &tools {
                let providers = catalog.providers.entry(tool.name().to_owned()).or_default();
                if !providers.contains(&server) {
                    providers.push(server.clone());
                }
            }
            catalog.servers.insert(server, tools);
        }
        for providers in catalog.providers.values_mut() {
            providers.sort();
        }
        catalog
    }

    /// Returns whether no server contributes any tool.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Returns the number of distinct tool names.
    #[must_use]
    pub fn tool_count(&self) -> usize {
        self.providers.len()
    }

    /// Returns the servers offering `tool_name`, sorted by name.
    #[must_use]
    pub fn providers(&self, tool_name: &str) -> &[ServerName] {
        self.providers
            .get(tool_name)
            .map_or(&[][..], Vec::as_slice)
    }

    /// Returns whether `server` offers `tool_name`.
    #[must_use]
    pub fn offers(&self, server: &ServerName, tool_name: &str) -> bool {
        self.providers(tool_name).contains(server)
    }

    /// Returns the tools of one server, if it is in the catalog.
    #[must_use]
    pub fn tools_for(&self, server: &ServerName) -> Option<&[ToolDescriptor]> {
        self.servers.get(server).map(Vec::as_slice)
    }

    /// Iterates distinct tool names with their providers.
    pub fn tools(&self) -> impl Iterator<Item = (&str, &[ServerName])> {
        self.providers
            .iter()
            .map(|(name, servers)| (name.as_str(), servers.as_slice()))
    }

    /// Iterates servers contributing to the catalog.
    pub fn servers(&self) -> impl Iterator<Item = &ServerName> {
        self.servers.keys()
    }
}
