//! Registry change notifications.

use super::{ServerName, ServerStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Change published by the service registry after each mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum RegistryEvent {
    /// A new name was registered.
    Registered {
        /// Registered server.
        server: ServerName,
        /// Time of the change.
        at: DateTime<Utc>,
    },
    /// Descriptive fields of an existing registration changed.
    Updated {
        /// Updated server.
        server: ServerName,
        /// Time of the change.
        at: DateTime<Utc>,
    },
    /// A registration was removed.
    Unregistered {
        /// Removed server.
        server: ServerName,
        /// Time of the change.
        at: DateTime<Utc>,
    },
    /// A server moved between lifecycle statuses.
    StatusChanged {
        /// Affected server.
        server: ServerName,
        /// Previous status.
        from: ServerStatus,
        /// New status.
        to: ServerStatus,
        /// Time of the change.
        at: DateTime<Utc>,
    },
}

impl RegistryEvent {
    /// Returns the server the event is about.
    #[must_use]
    pub const fn server(&self) -> &ServerName {
        match self {
            Self::Registered { server, .. }
            | Self::Updated { server, .. }
            | Self::Unregistered { server, .. }
            | Self::StatusChanged { server, .. } => server,
        }
    }
}
