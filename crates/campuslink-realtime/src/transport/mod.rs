//! Transport abstraction between the supervisor and the wire.
//!
//! A [`Transport`] opens one bidirectional channel at a time. A successful
//! [`Transport::connect`] hands back an [`InboundReceiver`] that yields
//! decoded server events until the channel ends; the end of the stream (or an
//! explicit [`TransportEvent::Closed`]) is how the supervisor learns about an
//! unexpected drop.
//!
//! Two implementations ship with the crate:
//!
//! - [`WebSocketTransport`]: JSON envelopes over `tokio-tungstenite`
//! - [`ScriptedTransport`]: in-memory double with programmable outcomes

mod scripted;
mod websocket;

pub use scripted::{ConnectScript, ScriptedTransport, SentMessage};
pub use websocket::{WebSocketTransport, decode_frame, encode_frame};

use std::fmt;

use async_trait::async_trait;
use campuslink_core::TransportError;
use serde_json::Value;
use tokio::sync::mpsc;

/// Buffer between a transport's reader and the supervisor's inbound pump.
pub const INBOUND_BUFFER: usize = 256;

/// Stream of events from one open connection.
pub type InboundReceiver = mpsc::Receiver<TransportEvent>;

/// Something the open channel reported.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// A named server event with its JSON payload.
    Message {
        /// Event name, e.g. `"order:updated"`.
        event: String,
        /// Event payload.
        payload: Value,
    },
    /// Control traffic that proves the peer is alive (ping/pong).
    Heartbeat,
    /// The channel ended. No further events follow.
    Closed {
        /// Close reason from the peer or the I/O layer, if any.
        reason: Option<String>,
    },
}

/// Bearer credentials presented during the handshake.
///
/// Supplied by the owner; the connection manager never refreshes them.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    /// Wrap an access token.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// The raw access token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// `Authorization` header value.
    pub fn authorization(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .finish()
    }
}

/// A bidirectional, event-named message channel.
///
/// Implementations must tolerate `connect` being called while a previous
/// connection is still open by replacing it, and `disconnect` being called
/// when nothing is open.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the channel, presenting `credentials` in the handshake.
    async fn connect(&self, credentials: &Credentials) -> Result<InboundReceiver, TransportError>;

    /// Close the channel if open. Idempotent.
    async fn disconnect(&self);

    /// Write one named event. Fails with [`TransportError::Closed`] when no
    /// channel is open.
    async fn send(&self, event: &str, payload: &Value) -> Result<(), TransportError>;
}
