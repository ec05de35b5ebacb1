//! Connection lifecycle state and its legal transitions.
//!
//! The supervisor is the only writer of [`ConnectionState`]; everything else
//! observes it through snapshots. [`ConnectionState::can_transition_to`]
//! encodes the complete edge set, so any transition the supervisor attempts
//! outside of it is rejected rather than published.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of the real-time connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Created but never started.
    #[default]
    Idle,
    /// A connect attempt is in flight.
    Connecting,
    /// The transport is open.
    Connected,
    /// Waiting for the backoff timer before the next attempt.
    Reconnecting,
    /// Attempts exhausted; waits for a manual restart.
    Failed,
    /// Stopped by the owner; no automatic transitions.
    Disconnected,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal edge.
    ///
    /// Any state may move to [`ConnectionState::Disconnected`] (stop).
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{Connected, Connecting, Disconnected, Failed, Idle, Reconnecting};
        matches!(
            (self, next),
            (_, Disconnected)
                | (Idle | Reconnecting | Failed | Disconnected, Connecting)
                | (Connecting, Connected | Reconnecting | Failed)
                | (Connected, Reconnecting)
        )
    }

    /// Whether the supervisor is working towards, or holding, a connection.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }

    /// Short status label for a connection indicator.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "Offline",
            Self::Connecting => "Connecting…",
            Self::Connected => "Connected",
            Self::Reconnecting => "Reconnecting",
            Self::Failed => "Connection failed",
            Self::Disconnected => "Disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// One accepted state change, as recorded in the supervisor's trace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTransition {
    /// State before the change.
    pub from: ConnectionState,
    /// State after the change.
    pub to: ConnectionState,
    /// Reconnect attempt counter after the change.
    pub attempt: u32,
    /// When the change happened.
    pub at: DateTime<Utc>,
}
