//! Error hierarchy for campuslink.
//!
//! Provides a structured error type system built on [`thiserror`]:
//!
//! - [`TransportError`]: Connect, handshake, timeout and send failures
//! - [`QueueError`]: Outbound queue rejections
//! - [`HandlerError`]: Failures raised by event subscribers
//!
//! [`ConnectionError`] is not an error type in the `std::error::Error` sense:
//! it is the last-known failure as shown to the UI, with a timestamp and an
//! optional cause chain rendered to text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// TransportError
// ─────────────────────────────────────────────────────────────────────────────

/// Failure of the underlying bidirectional channel.
///
/// Every variant is recoverable: the supervisor routes it into the
/// reconnection path and surfaces it as a [`ConnectionError`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The network connection could not be established.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The server rejected the handshake.
    #[error("handshake rejected{}: {message}", status_suffix(.status))]
    Handshake {
        /// HTTP status returned by the server, when known.
        status: Option<u16>,
        /// Human-readable reason.
        message: String,
    },

    /// The connect attempt did not complete in time.
    #[error("connect timed out after {after_ms}ms")]
    Timeout {
        /// Configured connect timeout in milliseconds.
        after_ms: u64,
    },

    /// The channel dropped before or during a write.
    #[error("connection closed")]
    Closed,

    /// A write failed on an open channel.
    #[error("send failed: {0}")]
    Send(String),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An open connection went silent past the liveness timeout.
    #[error("no traffic for {silent_ms}ms")]
    Unresponsive {
        /// Configured liveness timeout in milliseconds.
        silent_ms: u64,
    },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

// ─────────────────────────────────────────────────────────────────────────────
// QueueError
// ─────────────────────────────────────────────────────────────────────────────

/// Rejection from the outbound queue.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is at capacity and configured to reject new messages.
    #[error("outbound queue is full (capacity {capacity})")]
    Full {
        /// Configured capacity.
        capacity: usize,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// HandlerError
// ─────────────────────────────────────────────────────────────────────────────

/// Failure reported by (or caught from) an event subscriber.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("handler for '{event}' failed: {message}")]
pub struct HandlerError {
    /// Event the handler was invoked for.
    pub event: String,
    /// Human-readable message.
    pub message: String,
    /// Whether the handler panicked rather than returning an error.
    pub panicked: bool,
}

impl HandlerError {
    /// Create a handler error for an event.
    #[must_use]
    pub fn new(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            message: message.into(),
            panicked: false,
        }
    }

    /// Create a handler error from a caught panic payload.
    #[must_use]
    pub fn from_panic(event: impl Into<String>, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_owned());
        Self {
            event: event.into(),
            message,
            panicked: true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionError: UI-facing last error
// ─────────────────────────────────────────────────────────────────────────────

/// Last-known connection failure, cleared on successful connect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionError {
    /// Human-readable message.
    pub message: String,
    /// When the failure was observed.
    pub occurred_at: DateTime<Utc>,
    /// Underlying cause, rendered to text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ConnectionError {
    /// Record a connection error observed now.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            occurred_at: Utc::now(),
            cause: None,
        }
    }

    /// Attach a cause.
    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

impl From<&TransportError> for ConnectionError {
    fn from(err: &TransportError) -> Self {
        let message = match err {
            TransportError::Connect(_) => "Unable to reach the server",
            TransportError::Handshake { .. } => "The server refused the connection",
            TransportError::Timeout { .. } => "Connection attempt timed out",
            TransportError::Closed => "Connection lost",
            TransportError::Send(_) => "Failed to deliver a message",
            TransportError::Protocol(_) => "Received an unreadable message",
            TransportError::Unresponsive { .. } => "The server stopped responding",
        };
        Self::new(message).with_cause(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    // -- TransportError --

    #[test]
    fn transport_timeout_display() {
        let err = TransportError::Timeout { after_ms: 20_000 };
        assert_eq!(err.to_string(), "connect timed out after 20000ms");
    }

    #[test]
    fn handshake_display_with_status() {
        let err = TransportError::Handshake {
            status: Some(401),
            message: "bad token".into(),
        };
        assert_eq!(err.to_string(), "handshake rejected (401): bad token");
    }

    #[test]
    fn handshake_display_without_status() {
        let err = TransportError::Handshake {
            status: None,
            message: "bad token".into(),
        };
        assert_eq!(err.to_string(), "handshake rejected: bad token");
    }

    #[test]
    fn unresponsive_maps_to_friendly_message() {
        let err = TransportError::Unresponsive { silent_ms: 60_000 };
        let record = ConnectionError::from(&err);
        assert_eq!(record.message, "The server stopped responding");
        assert_eq!(record.cause.as_deref(), Some("no traffic for 60000ms"));
    }

    // -- QueueError --

    #[test]
    fn queue_full_display() {
        let err = QueueError::Full { capacity: 3 };
        assert_eq!(err.to_string(), "outbound queue is full (capacity 3)");
    }

    #[test]
    fn send_failure_keeps_cause() {
        let record = ConnectionError::from(&TransportError::Send("broken pipe".into()));
        assert_matches!(
            record,
            ConnectionError { ref message, cause: Some(ref cause), .. }
                if message == "Failed to deliver a message" && cause.contains("broken pipe")
        );
    }

    // -- HandlerError --

    #[test]
    fn handler_error_display() {
        let err = HandlerError::new("notification:new", "boom");
        assert_eq!(err.to_string(), "handler for 'notification:new' failed: boom");
        assert!(!err.panicked);
    }

    #[test]
    fn handler_error_from_str_panic() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("exploded");
        let err = HandlerError::from_panic("e", payload.as_ref());
        assert_eq!(err.message, "exploded");
        assert!(err.panicked);
    }

    #[test]
    fn handler_error_from_string_panic() {
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("formatted 7"));
        let err = HandlerError::from_panic("e", payload.as_ref());
        assert_eq!(err.message, "formatted 7");
    }

    #[test]
    fn handler_error_from_opaque_panic() {
        let payload: Box<dyn std::any::Any + Send> = Box::new(42_u8);
        let err = HandlerError::from_panic("e", payload.as_ref());
        assert_eq!(err.message, "handler panicked");
    }

    // -- ConnectionError --

    #[test]
    fn connection_error_from_transport() {
        let err = ConnectionError::from(&TransportError::Timeout { after_ms: 5 });
        assert_eq!(err.message, "Connection attempt timed out");
        assert_eq!(err.cause.as_deref(), Some("connect timed out after 5ms"));
    }

    #[test]
    fn connection_error_serializes_camel_case() {
        let err = ConnectionError::new("Connection lost");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["message"], "Connection lost");
        assert!(json.get("occurredAt").is_some());
        assert!(json.get("cause").is_none());
    }
}
