//! In-memory transport with programmable connect outcomes.
//!
//! Drives the supervisor in tests and demos without a server: queue up
//! connect results, push inbound events, force drops and inspect what was
//! sent.

use std::collections::VecDeque;

use async_trait::async_trait;
use campuslink_core::TransportError;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Credentials, INBOUND_BUFFER, InboundReceiver, Transport, TransportEvent};

/// Result of one scripted `connect` call.
#[derive(Clone, Debug)]
pub enum ConnectScript {
    /// Open a channel.
    Succeed,
    /// Fail with the given error.
    Fail(TransportError),
    /// Never complete; the caller's timeout decides.
    Hang,
}

/// One message accepted by [`ScriptedTransport::send`].
#[derive(Clone, Debug, PartialEq)]
pub struct SentMessage {
    /// Event name.
    pub event: String,
    /// Payload.
    pub payload: Value,
}

#[derive(Default)]
struct ScriptState {
    outcomes: VecDeque<ConnectScript>,
    connect_tokens: Vec<String>,
    inbound: Option<mpsc::Sender<TransportEvent>>,
    sent: Vec<SentMessage>,
    send_failures: VecDeque<TransportError>,
    stalled_sends: usize,
    disconnects: usize,
}

/// Transport double. Connects succeed unless an outcome was scripted.
#[derive(Default)]
pub struct ScriptedTransport {
    state: Mutex<ScriptState>,
}

impl ScriptedTransport {
    /// Transport whose every connect succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that plays `outcomes` in order, then succeeds.
    pub fn with_outcomes(outcomes: impl IntoIterator<Item = ConnectScript>) -> Self {
        let transport = Self::default();
        transport.state.lock().outcomes.extend(outcomes);
        transport
    }

    /// Append an outcome for a future connect call.
    pub fn push_outcome(&self, outcome: ConnectScript) {
        self.state.lock().outcomes.push_back(outcome);
    }

    /// Make the next `count` sends fail with `error`.
    pub fn fail_next_sends(&self, count: usize, error: &TransportError) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.send_failures.push_back(error.clone());
        }
    }

    /// Make the next `count` sends never complete, like a socket whose
    /// write buffer never drains.
    pub fn stall_next_sends(&self, count: usize) {
        self.state.lock().stalled_sends += count;
    }

    /// Deliver a server event on the open channel.
    ///
    /// Returns `false` when nothing is connected.
    pub fn inject(&self, event: &str, payload: Value) -> bool {
        self.push(TransportEvent::Message {
            event: event.to_owned(),
            payload,
        })
    }

    /// Deliver a liveness signal on the open channel.
    pub fn heartbeat(&self) -> bool {
        self.push(TransportEvent::Heartbeat)
    }

    /// Simulate the server dropping the channel.
    pub fn drop_connection(&self, reason: &str) -> bool {
        let Some(tx) = self.state.lock().inbound.take() else {
            return false;
        };
        tx.try_send(TransportEvent::Closed {
            reason: Some(reason.to_owned()),
        })
        .is_ok()
    }

    /// Number of connect calls so far.
    pub fn connect_count(&self) -> usize {
        self.state.lock().connect_tokens.len()
    }

    /// Tokens presented on each connect call, in order.
    pub fn connect_tokens(&self) -> Vec<String> {
        self.state.lock().connect_tokens.clone()
    }

    /// Number of disconnect calls so far.
    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnects
    }

    /// Whether a channel is currently open.
    pub fn is_connected(&self) -> bool {
        self.state.lock().inbound.is_some()
    }

    /// Every message sent so far, in send order.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().sent.clone()
    }

    /// Event names of every message sent so far.
    pub fn sent_events(&self) -> Vec<String> {
        self.state
            .lock()
            .sent
            .iter()
            .map(|m| m.event.clone())
            .collect()
    }

    fn push(&self, event: TransportEvent) -> bool {
        self.state
            .lock()
            .inbound
            .as_ref()
            .is_some_and(|tx| tx.try_send(event).is_ok())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, credentials: &Credentials) -> Result<InboundReceiver, TransportError> {
        let outcome = {
            let mut state = self.state.lock();
            state.connect_tokens.push(credentials.token().to_owned());
            state.outcomes.pop_front().unwrap_or(ConnectScript::Succeed)
        };

        match outcome {
            ConnectScript::Succeed => {
                let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
                self.state.lock().inbound = Some(tx);
                Ok(rx)
            }
            ConnectScript::Fail(err) => Err(err),
            ConnectScript::Hang => std::future::pending().await,
        }
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock();
        state.disconnects += 1;
        state.inbound = None;
    }

    async fn send(&self, event: &str, payload: &Value) -> Result<(), TransportError> {
        // Let other tasks run between writes, as a real socket would.
        tokio::task::yield_now().await;

        let stall = {
            let mut state = self.state.lock();
            let stall = state.inbound.is_some() && state.stalled_sends > 0;
            if stall {
                state.stalled_sends -= 1;
            }
            stall
        };
        if stall {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();
        if state.inbound.is_none() {
            return Err(TransportError::Closed);
        }
        if let Some(err) = state.send_failures.pop_front() {
            return Err(err);
        }
        state.sent.push(SentMessage {
            event: event.to_owned(),
            payload: payload.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn creds() -> Credentials {
        Credentials::bearer("t1")
    }

    #[tokio::test]
    async fn default_outcome_is_success() {
        let transport = ScriptedTransport::new();
        let rx = transport.connect(&creds()).await;
        assert!(rx.is_ok());
        assert!(transport.is_connected());
        assert_eq!(transport.connect_tokens(), vec!["t1".to_owned()]);
    }

    #[tokio::test]
    async fn scripted_failures_play_in_order() {
        let transport = ScriptedTransport::with_outcomes([
            ConnectScript::Fail(TransportError::Connect("refused".into())),
            ConnectScript::Fail(TransportError::Closed),
        ]);
        assert_matches!(
            transport.connect(&creds()).await,
            Err(TransportError::Connect(_))
        );
        assert_matches!(transport.connect(&creds()).await, Err(TransportError::Closed));
        assert!(transport.connect(&creds()).await.is_ok());
        assert_eq!(transport.connect_count(), 3);
    }

    #[tokio::test]
    async fn inject_reaches_receiver() {
        let transport = ScriptedTransport::new();
        let mut rx = transport.connect(&creds()).await.unwrap();
        assert!(transport.inject("order:updated", json!({"id": 7})));

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            TransportEvent::Message {
                event: "order:updated".into(),
                payload: json!({"id": 7}),
            }
        );
    }

    #[tokio::test]
    async fn drop_connection_sends_closed_then_ends() {
        let transport = ScriptedTransport::new();
        let mut rx = transport.connect(&creds()).await.unwrap();
        assert!(transport.drop_connection("server restart"));

        assert_matches!(rx.recv().await, Some(TransportEvent::Closed { reason: Some(r) }) if r == "server restart");
        assert!(rx.recv().await.is_none());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn send_requires_open_channel() {
        let transport = ScriptedTransport::new();
        assert_matches!(
            transport.send("chat:message", &json!({})).await,
            Err(TransportError::Closed)
        );

        let _rx = transport.connect(&creds()).await.unwrap();
        transport.send("chat:message", &json!({"text": "hi"})).await.unwrap();
        assert_eq!(transport.sent_events(), vec!["chat:message".to_owned()]);
    }

    #[tokio::test]
    async fn scripted_send_failures() {
        let transport = ScriptedTransport::new();
        let _rx = transport.connect(&creds()).await.unwrap();
        transport.fail_next_sends(1, &TransportError::Send("broken pipe".into()));

        assert!(transport.send("a", &json!(1)).await.is_err());
        assert!(transport.send("b", &json!(2)).await.is_ok());
        assert_eq!(transport.sent_events(), vec!["b".to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_send_never_completes() {
        let transport = ScriptedTransport::new();
        let _rx = transport.connect(&creds()).await.unwrap();
        transport.stall_next_sends(1);

        let stalled =
            tokio::time::timeout(std::time::Duration::from_secs(60), transport.send("a", &json!(1))).await;
        assert!(stalled.is_err());
        transport.send("b", &json!(2)).await.unwrap();
        assert_eq!(transport.sent_events(), vec!["b".to_owned()]);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let transport = ScriptedTransport::new();
        transport.disconnect().await;
        let _rx = transport.connect(&creds()).await.unwrap();
        transport.disconnect().await;
        transport.disconnect().await;
        assert_eq!(transport.disconnect_count(), 3);
        assert!(!transport.is_connected());
    }
}
