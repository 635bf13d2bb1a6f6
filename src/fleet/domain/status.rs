//! Server status and its lifecycle state machine.

use super::ParseServerStatusError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a registered tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// Status has not been established yet.
    Unknown,
    /// Server is registered but no connection has been attempted.
    Registered,
    /// A connection attempt is in flight.
    Connecting,
    /// Server has a live connection and answers probes.
    Connected,
    /// Server still has a live connection but its last probe failed.
    Unhealthy,
    /// Connection was closed on request.
    Disconnected,
    /// Connection attempt or health escalation failed.
    Failed,
}

impl ServerStatus {
    /// Returns the canonical storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Registered => "registered",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Unhealthy => "unhealthy",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        }
    }

    /// Returns whether a live connection is expected in this status.
    #[must_use]
    pub const fn has_connection(self) -> bool {
        matches!(self, Self::Connected | Self::Unhealthy)
    }

    /// Returns whether an explicit disconnect moves this status to
    /// `disconnected`.
    #[must_use]
    pub const fn can_disconnect(self) -> bool {
        matches!(self, Self::Connected | Self::Unhealthy | Self::Failed)
    }

    /// Returns whether transition to `target` is allowed.
    ///
    /// Staying in the same status is always allowed.
    #[must_use]
    pub const fn can_transition_to(self, target: Self) -> bool {
        if self as u8 == target as u8 {
            return true;
        }

        matches!(
            (self, target),
            (Self::Unknown, Self::Registered | Self::Connecting)
                | (
                    Self::Registered | Self::Disconnected | Self::Failed,
                    Self::Connecting
                )
                | (Self::Connecting, Self::Connected | Self::Failed)
                | (Self::Connected, Self::Unhealthy)
                | (Self::Unhealthy, Self::Connected | Self::Failed)
                | (
                    Self::Connected | Self::Unhealthy | Self::Failed,
                    Self::Disconnected
                )
        )
    }

    /// Returns the status a record is restored with after a restart.
    ///
    /// No live connection survives a restart, so statuses implying one are
    /// reset to `registered`.
    #[must_use]
    pub const fn restored(self) -> Self {
        match self {
            Self::Connecting | Self::Connected | Self::Unhealthy => Self::Registered,
            other => other,
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ServerStatus {
    type Error = ParseServerStatusError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "unknown" => Ok(Self::Unknown),
            "registered" => Ok(Self::Registered),
            "connecting" => Ok(Self::Connecting),
            "connected" => Ok(Self::Connected),
            "unhealthy" => Ok(Self::Unhealthy),
            "disconnected" => Ok(Self::Disconnected),
            "failed" => Ok(Self::Failed),
            _ => Err(ParseServerStatusError(value.to_owned())),
        }
    }
}
