//! WebSocket transport over `tokio-tungstenite`.
//!
//! Every frame is a JSON text envelope `{"event": "...", "data": ...}`. The
//! access token travels in the handshake's `Authorization` header. Once
//! connected, one socket task owns the stream: it writes outgoing frames,
//! sends keep-alive pings and forwards decoded inbound frames to the
//! supervisor.

use std::time::Duration;

use async_trait::async_trait;
use campuslink_core::TransportError;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use super::{Credentials, INBOUND_BUFFER, InboundReceiver, Transport, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default interval between keep-alive pings.
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);

// ─── Frame codec ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct OutgoingEnvelope<'a> {
    event: &'a str,
    data: &'a Value,
}

#[derive(Deserialize)]
struct IncomingEnvelope {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Encode one named event as a text frame body.
pub fn encode_frame(event: &str, payload: &Value) -> Result<String, TransportError> {
    serde_json::to_string(&OutgoingEnvelope {
        event,
        data: payload,
    })
    .map_err(|e| TransportError::Protocol(e.to_string()))
}

/// Decode a text frame body into `(event, payload)`.
///
/// A missing `data` field decodes as `null`.
pub fn decode_frame(text: &str) -> Result<(String, Value), TransportError> {
    let envelope: IncomingEnvelope =
        serde_json::from_str(text).map_err(|e| TransportError::Protocol(e.to_string()))?;
    if envelope.event.is_empty() {
        return Err(TransportError::Protocol("empty event name".into()));
    }
    Ok((envelope.event, envelope.data))
}

// ─── Transport ──────────────────────────────────────────────────────────────

struct Outgoing {
    text: String,
    ack: oneshot::Sender<Result<(), TransportError>>,
}

struct ActiveSocket {
    outgoing: mpsc::Sender<Outgoing>,
    task: JoinHandle<()>,
}

/// WebSocket client transport.
pub struct WebSocketTransport {
    url: String,
    ping_interval: Duration,
    active: Mutex<Option<ActiveSocket>>,
}

impl WebSocketTransport {
    /// Transport for the given `ws://` or `wss://` endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ping_interval: DEFAULT_PING_INTERVAL,
            active: Mutex::new(None),
        }
    }

    /// Override the keep-alive ping interval.
    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn close_active(&self) {
        if let Some(socket) = self.active.lock().take() {
            socket.task.abort();
        }
    }
}

fn map_connect_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            TransportError::Handshake {
                status: Some(status.as_u16()),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_owned(),
            }
        }
        tungstenite::Error::Url(e) => TransportError::Connect(format!("invalid url: {e}")),
        other => TransportError::Connect(other.to_string()),
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, credentials: &Credentials) -> Result<InboundReceiver, TransportError> {
        self.close_active();

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(map_connect_error)?;
        let auth = HeaderValue::from_str(&credentials.authorization()).map_err(|_| {
            TransportError::Handshake {
                status: None,
                message: "access token is not a valid header value".into(),
            }
        })?;
        let _ = request.headers_mut().insert(AUTHORIZATION, auth);

        let (ws, _) = connect_async(request).await.map_err(map_connect_error)?;
        debug!(url = %self.url, "websocket connected");

        let (outgoing_tx, outgoing_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let task = tokio::spawn(socket_loop(ws, outgoing_rx, inbound_tx, self.ping_interval));

        *self.active.lock() = Some(ActiveSocket {
            outgoing: outgoing_tx,
            task,
        });
        Ok(inbound_rx)
    }

    async fn disconnect(&self) {
        // Dropping the sender lets the socket loop send a close frame.
        let Some(socket) = self.active.lock().take() else {
            return;
        };
        drop(socket.outgoing);
        let abort = socket.task.abort_handle();
        if tokio::time::timeout(Duration::from_secs(1), socket.task)
            .await
            .is_err()
        {
            debug!("socket task did not finish closing in time");
            abort.abort();
        }
    }

    async fn send(&self, event: &str, payload: &Value) -> Result<(), TransportError> {
        let text = encode_frame(event, payload)?;
        let outgoing = self
            .active
            .lock()
            .as_ref()
            .map(|s| s.outgoing.clone())
            .ok_or(TransportError::Closed)?;

        let (ack, done) = oneshot::channel();
        outgoing
            .send(Outgoing { text, ack })
            .await
            .map_err(|_| TransportError::Closed)?;
        done.await.map_err(|_| TransportError::Closed)?
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.close_active();
    }
}

/// Owns the socket until either side closes it.
async fn socket_loop(
    ws: WsStream,
    mut outgoing: mpsc::Receiver<Outgoing>,
    inbound: mpsc::Sender<TransportEvent>,
    ping_interval: Duration,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut ping = tokio::time::interval(ping_interval);
    // First tick completes immediately.
    let _ = ping.tick().await;

    let reason = loop {
        tokio::select! {
            out = outgoing.recv() => {
                let Some(out) = out else {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break None;
                };
                let result = ws_tx
                    .send(Message::Text(out.text.into()))
                    .await
                    .map_err(|e| TransportError::Send(e.to_string()));
                let failed = result.is_err();
                let _ = out.ack.send(result);
                if failed {
                    break Some("write failed".to_owned());
                }
            }
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::<u8>::new().into())).await.is_err() {
                    break Some("ping failed".to_owned());
                }
            }
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match decode_frame(&text) {
                        Ok((event, payload)) => {
                            if inbound.send(TransportEvent::Message { event, payload }).await.is_err() {
                                break None;
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping undecodable frame"),
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        let _ = inbound.try_send(TransportEvent::Heartbeat);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| String::from(&*f.reason));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            }
        }
    };

    debug!(reason = ?reason, "websocket closed");
    let _ = inbound.send(TransportEvent::Closed { reason }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn encode_wraps_event_and_data() {
        let text = encode_frame("chat:message", &json!({"text": "hi"})).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"event": "chat:message", "data": {"text": "hi"}}));
    }

    #[test]
    fn decode_extracts_event_and_data() {
        let (event, payload) =
            decode_frame(r#"{"event":"order:updated","data":{"orderId":"o-1"}}"#).unwrap();
        assert_eq!(event, "order:updated");
        assert_eq!(payload["orderId"], "o-1");
    }

    #[test]
    fn decode_missing_data_is_null() {
        let (event, payload) = decode_frame(r#"{"event":"inventory:sync"}"#).unwrap();
        assert_eq!(event, "inventory:sync");
        assert!(payload.is_null());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_matches!(decode_frame("not json"), Err(TransportError::Protocol(_)));
        assert_matches!(decode_frame(r#"{"data":1}"#), Err(TransportError::Protocol(_)));
        assert_matches!(
            decode_frame(r#"{"event":"","data":1}"#),
            Err(TransportError::Protocol(msg)) if msg.contains("empty")
        );
    }

    #[tokio::test]
    async fn send_without_connection_is_closed() {
        let transport = WebSocketTransport::new("ws://127.0.0.1:1/realtime");
        assert_matches!(
            transport.send("chat:message", &json!({})).await,
            Err(TransportError::Closed)
        );
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn invalid_url_fails_connect() {
        let transport = WebSocketTransport::new("not a url");
        let result = transport.connect(&Credentials::bearer("t")).await;
        assert_matches!(result, Err(TransportError::Connect(_)));
    }

    #[test]
    fn ping_interval_override() {
        let transport =
            WebSocketTransport::new("ws://localhost/rt").with_ping_interval(Duration::from_secs(5));
        assert_eq!(transport.ping_interval, Duration::from_secs(5));
        assert_eq!(transport.url(), "ws://localhost/rt");
    }
}
