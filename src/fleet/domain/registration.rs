//! Server registration aggregate root and its descriptive input.

use super::{FleetDomainError, ServerName, ServerStatus};
use chrono::{DateTime, Utc};
use mockable::Clock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Priority assigned when neither the operator nor a discovery source
/// declares one.
pub const DEFAULT_PRIORITY: i32 = 10;

/// Descriptive data submitted when registering a server.
///
/// Everything here may be overwritten by a later registration of the same
/// name; status and timestamps live only on [`ServerRegistration`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    name: ServerName,
    url: String,
    description: String,
    tags: BTreeSet<String>,
    priority: i32,
    auto_connect: bool,
    health_check_url: Option<String>,
    metadata: Map<String, Value>,
}

impl ServerDescriptor {
    /// Creates a descriptor with required fields and defaults for the rest.
    ///
    /// # Errors
    ///
    /// Returns [`FleetDomainError`] when the name is invalid or the URL is
    /// empty.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
    ) -> Result<Self, FleetDomainError> {
        let server_name = ServerName::new(name)?;
        let normalized_url = url.into().trim().to_owned();
        if normalized_url.is_empty() {
            return Err(FleetDomainError::EmptyServerUrl);
        }

        Ok(Self {
            name: server_name,
            url: normalized_url,
            description: String::new(),
            tags: BTreeSet::new(),
            priority: DEFAULT_PRIORITY,
            auto_connect: true,
            health_check_url: None,
            metadata: Map::new(),
        })
    }

    /// Sets the human-readable description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into().trim().to_owned();
        self
    }

    /// Replaces the tag set. Blank tags are dropped.
    #[must_use]
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags
            .into_iter()
            .map(|tag| tag.trim().to_owned())
            .filter(|tag| !tag.is_empty())
            .collect();
        self
    }

    /// Sets the routing priority (higher is preferred).
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets whether the engine may connect autonomously.
    #[must_use]
    pub const fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Sets an explicit HTTP health check endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`FleetDomainError::InvalidHealthCheckUrl`] when the URL does
    /// not use an HTTP scheme.
    pub fn with_health_check_url(mut self, url: impl Into<String>) -> Result<Self, FleetDomainError> {
        let normalized = url.into().trim().to_owned();
        let has_valid_prefix =
            normalized.starts_with("http://") || normalized.starts_with("https://");
        if !has_valid_prefix {
            return Err(FleetDomainError::InvalidHealthCheckUrl(normalized));
        }

        self.health_check_url = Some(normalized);
        Ok(self)
    }

    /// Replaces the opaque metadata mapping.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Returns the server name.
    #[must_use]
    pub const fn name(&self) -> &ServerName {
        &self.name
    }

    /// Returns the connection endpoint.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the tag set.
    #[must_use]
    pub const fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Returns the routing priority.
    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    /// Returns whether autonomous connects are allowed.
    #[must_use]
    pub const fn auto_connect(&self) -> bool {
        self.auto_connect
    }

    /// Returns the explicit health check endpoint, if any.
    #[must_use]
    pub fn health_check_url(&self) -> Option<&str> {
        self.health_check_url.as_deref()
    }

    /// Returns the opaque metadata.
    #[must_use]
    pub const fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }
}

/// Registration record for one remote tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRegistration {
    name: ServerName,
    url: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: BTreeSet<String>,
    #[serde(default = "default_priority")]
    priority: i32,
    #[serde(default = "default_auto_connect")]
    auto_connect: bool,
    #[serde(default)]
    health_check_url: Option<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default = "default_status")]
    status: ServerStatus,
    #[serde(default = "Utc::now")]
    registered_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    updated_at: DateTime<Utc>,
    #[serde(default)]
    last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    last_checked: Option<DateTime<Utc>>,
}

const fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

const fn default_auto_connect() -> bool {
    true
}

const fn default_status() -> ServerStatus {
    ServerStatus::Unknown
}

impl ServerRegistration {
    /// Creates a registration in the `registered` status.
    #[must_use]
    pub fn new(descriptor: ServerDescriptor, clock: &impl Clock) -> Self {
        let timestamp = clock.utc();
        let ServerDescriptor {
            name,
            url,
            description,
            tags,
            priority,
            auto_connect,
            health_check_url,
            metadata,
        } = descriptor;

        Self {
            name,
            url,
            description,
            tags,
            priority,
            auto_connect,
            health_check_url,
            metadata,
            status: ServerStatus::Registered,
            registered_at: timestamp,
            updated_at: timestamp,
            last_seen: None,
            last_checked: None,
        }
    }

    /// Returns the server name.
    #[must_use]
    pub const fn name(&self) -> &ServerName {
        &self.name
    }

    /// Returns the connection endpoint.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the tag set.
    #[must_use]
    pub const fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Returns the routing priority.
    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    /// Returns whether autonomous connects are allowed.
    #[must_use]
    pub const fn auto_connect(&self) -> bool {
        self.auto_connect
    }

    /// Returns the explicit health check endpoint, if any.
    #[must_use]
    pub fn health_check_url(&self) -> Option<&str> {
        self.health_check_url.as_deref()
    }

    /// Returns the opaque metadata.
    #[must_use]
    pub const fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Returns the lifecycle status.
    #[must_use]
    pub const fn status(&self) -> ServerStatus {
        self.status
    }

    /// Returns when the name was first registered.
    #[must_use]
    pub const fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Returns the latest mutation timestamp.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns the last successful contact with the server.
    #[must_use]
    pub const fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    /// Returns the last probe attempt.
    #[must_use]
    pub const fn last_checked(&self) -> Option<DateTime<Utc>> {
        self.last_checked
    }

    /// Returns the descriptive part of this record.
    #[must_use]
    pub fn descriptor(&self) -> ServerDescriptor {
        ServerDescriptor {
            name: self.name.clone(),
            url: self.url.clone(),
            description: self.description.clone(),
            tags: self.tags.clone(),
            priority: self.priority,
            auto_connect: self.auto_connect,
            health_check_url: self.health_check_url.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Returns whether any of `tags` is carried by this record.
    ///
    /// An empty filter matches every record.
    #[must_use]
    pub fn matches_any_tag(&self, tags: &[String]) -> bool {
        tags.is_empty() || tags.iter().any(|tag| self.tags.contains(tag))
    }

    /// Overwrites descriptive fields from a re-registration.
    ///
    /// Status and timestamps other than `updated_at` are kept. Returns
    /// whether any descriptive field changed.
    pub fn merge(&mut self, descriptor: ServerDescriptor, clock: &impl Clock) -> bool {
        if self.descriptor() == descriptor {
            return false;
        }

        let ServerDescriptor {
            name: _,
            url,
            description,
            tags,
            priority,
            auto_connect,
            health_check_url,
            metadata,
        } = descriptor;
        self.url = url;
        self.description = description;
        self.tags = tags;
        self.priority = priority;
        self.auto_connect = auto_connect;
        self.health_check_url = health_check_url;
        self.metadata = metadata;
        self.touch(clock);
        true
    }

    /// Moves the record to `target` if the lifecycle allows it.
    ///
    /// Returns the previous status when it changed and `None` when the
    /// record was already in `target`.
    ///
    /// # Errors
    ///
    /// Returns [`FleetDomainError::InvalidStatusTransition`] when the
    /// transition is not allowed.
    pub fn transition_to(
        &mut self,
        target: ServerStatus,
        clock: &impl Clock,
    ) -> Result<Option<ServerStatus>, FleetDomainError> {
        if self.status == target {
            return Ok(None);
        }

        if !self.status.can_transition_to(target) {
            return Err(FleetDomainError::InvalidStatusTransition {
                server: self.name.clone(),
                from: self.status,
                to: target,
            });
        }

        let previous = self.status;
        self.status = target;
        self.touch(clock);
        Ok(Some(previous))
    }

    /// Applies restart normalisation to a record loaded from storage.
    pub fn restore_after_restart(&mut self) {
        self.status = self.status.restored();
    }

    /// Stamps a successful contact with the server.
    pub fn record_contact(&mut self, clock: &impl Clock) {
        self.last_seen = Some(clock.utc());
    }

    /// Stamps a probe attempt.
    pub fn record_check(&mut self, clock: &impl Clock) {
        self.last_checked = Some(clock.utc());
    }

    /// Returns whether the server has not been seen within `max_age` of
    /// `now`. Servers never seen are measured from `registered_at`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        let reference = self.last_seen.unwrap_or(self.registered_at);
        now.signed_duration_since(reference) > max_age
    }

    fn touch(&mut self, clock: &impl Clock) {
        self.updated_at = clock.utc();
    }
}
