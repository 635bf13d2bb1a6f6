//! Discovery document schema shared by every discovery source.
//!
//! Two shapes are accepted: a bare JSON array of server records, or an
//! object with a `servers` array. Other top-level fields (such as the
//! `success`, `total` and `timestamp` fields of a discovery service reply)
//! are ignored.

use super::{DEFAULT_PRIORITY, FleetDomainError, ServerDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One server record as published by a discovery source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredServer {
    /// Unique server name.
    pub name: String,
    /// Connection endpoint.
    pub url: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Grouping tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Routing priority.
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Whether the engine may connect autonomously.
    #[serde(default = "default_auto_connect")]
    pub auto_connect: bool,
    /// Optional HTTP health endpoint.
    #[serde(default)]
    pub health_check_url: Option<String>,
    /// Opaque metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

const fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

const fn default_auto_connect() -> bool {
    true
}

impl DiscoveredServer {
    /// Validates the record into a registration descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`FleetDomainError`] when the name, URL or health check URL
    /// is invalid.
    pub fn into_descriptor(self) -> Result<ServerDescriptor, FleetDomainError> {
        let descriptor = ServerDescriptor::new(self.name, self.url)?
            .with_description(self.description)
            .with_tags(self.tags)
            .with_priority(self.priority)
            .with_auto_connect(self.auto_connect)
            .with_metadata(self.metadata);

        match self.health_check_url {
            Some(url) => descriptor.with_health_check_url(url),
            None => Ok(descriptor),
        }
    }
}

/// A record that could not be read from a discovery document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedEntry {
    /// Position of the record in the document.
    pub index: usize,
    /// Why the record was rejected.
    pub reason: String,
}

/// Parsed discovery document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryDocument {
    servers: Vec<ServerDescriptor>,
    rejected: Vec<RejectedEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DocumentShape {
    Wrapped { servers: Vec<Value> },
    Bare(Vec<Value>),
}

impl DiscoveryDocument {
    /// Parses a document from raw bytes.
    ///
    /// The document as a whole must be valid JSON in one of the accepted
    /// shapes; individual records that fail validation are collected in
    /// [`DiscoveryDocument::rejected`] instead of failing the parse.
    ///
    /// # Errors
    ///
    /// Returns the JSON error when the document itself is malformed.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let records = match serde_json::from_slice::<DocumentShape>(bytes)? {
            DocumentShape::Wrapped { servers } | DocumentShape::Bare(servers) => servers,
        };
        Ok(Self::from_records(records))
    }

    /// Builds a document from already validated descriptors.
    #[must_use]
    pub fn from_descriptors(servers: impl IntoIterator<Item = ServerDescriptor>) -> Self {
        Self {
            servers: servers.into_iter().collect(),
            rejected: Vec::new(),
        }
    }

    fn from_records(records: Vec<Value>) -> Self {
        let mut document = Self::default();
        for (index, record) in records.into_iter().enumerate() {
            let parsed = serde_json::from_value::<DiscoveredServer>(record)
                .map_err(|err| err.to_string())
                .and_then(|server| server.into_descriptor().map_err(|err| err.to_string()));
            match parsed {
                Ok(descriptor) => document.servers.push(descriptor),
                Err(reason) => document.rejected.push(RejectedEntry { index, reason }),
            }
        }
        document
    }

    /// Returns the valid server descriptors in document order.
    #[must_use]
    pub fn servers(&self) -> &[ServerDescriptor] {
        &self.servers
    }

    /// Returns the records that failed validation.
    #[must_use]
    pub fn rejected(&self) -> &[RejectedEntry] {
        &self.rejected
    }

    /// Consumes the document, returning the valid descriptors.
    #[must_use]
    pub fn into_servers(self) -> Vec<ServerDescriptor> {
        self.servers
    }
}
