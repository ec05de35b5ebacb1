//! Session-scoped owner of a connection supervisor.
//!
//! Opening a session wires the queue, router, store and policy from
//! settings and starts connecting. Closing it (explicitly or by dropping it)
//! stops the connection and releases every subscriber.

use std::sync::Arc;

use campuslink_core::QueueError;
use campuslink_settings::LinkSettings;
use serde_json::Value;
use tracing::{debug, info};

use crate::queue::QueuedMessage;
use crate::router::{HandlerResult, Subscription};
use crate::store::{ConnectionSnapshot, ConnectionStateStore, StoreSubscription};
use crate::supervisor::{CommandOutcome, ConnectionSupervisor, EmitOutcome, SupervisorOptions};
use crate::transport::{Credentials, Transport};

/// A started real-time connection bound to a user session.
pub struct RealtimeSession {
    supervisor: ConnectionSupervisor,
    closed: bool,
}

impl RealtimeSession {
    /// Build a supervisor from `settings` and start connecting.
    pub async fn open(settings: &LinkSettings, transport: Arc<dyn Transport>, credentials: Credentials) -> Self {
        let session = Self::build(settings, transport, credentials);
        let _ = session.start().await;
        session
    }

    /// [`open`](Self::open) with explicit options.
    pub async fn open_with(
        options: SupervisorOptions,
        transport: Arc<dyn Transport>,
        credentials: Credentials,
    ) -> Self {
        let session = Self::build_with(options, transport, credentials);
        let _ = session.start().await;
        session
    }

    /// Wire a session from `settings` without connecting. The session sits
    /// in `Idle` until [`start`](Self::start), so listeners and handlers
    /// registered in between observe the first attempt.
    pub fn build(settings: &LinkSettings, transport: Arc<dyn Transport>, credentials: Credentials) -> Self {
        Self::build_with(SupervisorOptions::from_settings(settings), transport, credentials)
    }

    /// [`build`](Self::build) with explicit options.
    pub fn build_with(options: SupervisorOptions, transport: Arc<dyn Transport>, credentials: Credentials) -> Self {
        Self {
            supervisor: ConnectionSupervisor::spawn(transport, credentials, options),
            closed: false,
        }
    }

    /// Begin connecting from `Idle`, `Failed` or `Disconnected`.
    pub async fn start(&self) -> CommandOutcome {
        let outcome = self.supervisor.start().await;
        debug!(?outcome, "realtime session started");
        outcome
    }

    /// The underlying supervisor.
    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    /// Observable connection snapshot store.
    pub fn store(&self) -> &ConnectionStateStore {
        self.supervisor.store()
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.supervisor.snapshot()
    }

    /// Register a handler for one inbound event.
    pub fn subscribe<F>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.supervisor.router().subscribe(event, handler)
    }

    /// Register a handler for every inbound event.
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&str, &Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.supervisor.router().subscribe_all(handler)
    }

    /// Register a snapshot listener.
    pub fn on_state_change(
        &self,
        listener: impl Fn(&ConnectionSnapshot) + Send + Sync + 'static,
    ) -> StoreSubscription {
        self.supervisor.store().subscribe(listener)
    }

    /// Send, or queue until connected.
    pub async fn emit(&self, event: impl Into<String>, payload: Value) -> Result<EmitOutcome, QueueError> {
        self.supervisor.emit(event, payload).await
    }

    /// The "Reconnect now" action.
    pub async fn reconnect_now(&self) -> CommandOutcome {
        self.supervisor.manual_reconnect().await
    }

    /// Stop the connection, release subscribers and return the messages
    /// still queued.
    ///
    /// With `retainOnStop` the queue survives the stop and its contents are
    /// returned here; otherwise the queue is cleared and the cleared
    /// messages are returned.
    pub async fn close(mut self) -> Vec<QueuedMessage> {
        self.closed = true;
        let mut leftover = self.supervisor.stop().await;
        leftover.extend(self.supervisor.pending());
        self.supervisor.router().clear();
        self.supervisor.shutdown().await;
        info!(leftover = leftover.len(), "realtime session closed");
        leftover
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        debug!("realtime session dropped without close");
        self.supervisor.router().clear();
        self.supervisor.request_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campuslink_core::ConnectionState;
    use campuslink_settings::QueueSettings;
    use serde_json::json;

    use crate::transport::ScriptedTransport;

    fn settings() -> LinkSettings {
        LinkSettings {
            heartbeat_timeout_ms: 0,
            ..LinkSettings::default()
        }
    }

    async fn connected(session: &RealtimeSession) {
        let mut rx = session.store().watch();
        let _ = rx
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn open_starts_connecting() {
        let transport = Arc::new(ScriptedTransport::new());
        let session = RealtimeSession::open(&settings(), transport.clone(), Credentials::bearer("t")).await;
        connected(&session).await;
        assert_eq!(transport.connect_count(), 1);
        let _ = session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn listeners_registered_before_start_see_first_attempt() {
        let transport = Arc::new(ScriptedTransport::new());
        let session = RealtimeSession::build(&settings(), transport.clone(), Credentials::bearer("t"));
        assert_eq!(session.snapshot().state, ConnectionState::Idle);
        assert_eq!(transport.connect_count(), 0);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _state = session.on_state_change(move |snapshot| sink.lock().push(snapshot.state));

        let _ = session.start().await;
        connected(&session).await;
        let seen = seen.lock().clone();
        assert_eq!(seen.first(), Some(&ConnectionState::Connecting));
        assert!(seen.contains(&ConnectionState::Connected));
        let _ = session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_releases_subscribers_and_disconnects() {
        let transport = Arc::new(ScriptedTransport::new());
        let session = RealtimeSession::open(&settings(), transport.clone(), Credentials::bearer("t")).await;
        let _sub = session.subscribe("order:updated", |_| Ok(()));
        connected(&session).await;
        let router = session.supervisor().router().clone();
        assert_eq!(router.len(), 1);

        let leftover = session.close().await;
        assert!(leftover.is_empty());
        assert!(router.is_empty());
        assert!(!transport.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn close_returns_retained_messages() {
        let transport = Arc::new(ScriptedTransport::with_outcomes([
            crate::transport::ConnectScript::Hang,
        ]));
        let settings = LinkSettings {
            queue: QueueSettings {
                retain_on_stop: true,
                ..QueueSettings::default()
            },
            ..settings()
        };
        let session = RealtimeSession::open(&settings, transport, Credentials::bearer("t")).await;
        let _ = session.emit("cart:update", json!({"sku": 9})).await.unwrap();

        let leftover = session.close().await;
        assert_eq!(leftover.len(), 1);
        assert_eq!(leftover[0].event, "cart:update");
    }

    #[tokio::test(start_paused = true)]
    async fn drop_tears_down() {
        let transport = Arc::new(ScriptedTransport::new());
        let session = RealtimeSession::open(&settings(), transport.clone(), Credentials::bearer("t")).await;
        connected(&session).await;
        let store = session.store().clone();
        let router = session.supervisor().router().clone();
        let _sub = router.subscribe("x", |_| Ok(()));

        drop(session);
        assert!(router.is_empty());
        let mut rx = store.watch();
        let _ = rx
            .wait_for(|s| s.state == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert!(!transport.is_connected());
    }
}
