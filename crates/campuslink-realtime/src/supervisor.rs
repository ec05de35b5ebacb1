//! Connection supervisor: the lifecycle state machine.
//!
//! A single driver task owns the state, the attempt counter and the
//! connection generation. Public calls and background completions (connect
//! results, retry timers, inbound drops, flush results) all arrive on one
//! command channel and are handled one at a time, so every transition is
//! applied and published in order. Background work is tied to a per-epoch
//! [`CancellationToken`]; starting a new epoch cancels the old one, and any
//! completion that still slips through carries a stale generation and is
//! ignored.
//!
//! ```text
//!   Idle ──start──▶ Connecting ──ok──▶ Connected
//!                     │    ▲              │
//!                fail │    │ timer/manual │ drop
//!                     ▼    │              ▼
//!                  Reconnecting ◀─────────┘
//!                     │
//!          exhausted  ▼
//!                   Failed        (any) ──stop──▶ Disconnected
//! ```

use std::sync::Arc;
use std::time::Duration;

use campuslink_core::{
    ConnectionError, ConnectionState, MessageId, QueueError, StateTransition, TransportError,
};
use campuslink_settings::{LinkSettings, QueueSettings};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::heartbeat::{HeartbeatResult, Liveness, run_heartbeat};
use crate::policy::ReconnectionPolicy;
use crate::queue::{OutboundQueue, QueuedMessage};
use crate::router::EventRouter;
use crate::store::{ConnectionSnapshot, ConnectionStateStore};
use crate::transport::{Credentials, InboundReceiver, Transport, TransportEvent};

/// Buffered transitions per `transitions()` receiver before it lags.
const TRANSITION_BUFFER: usize = 64;

// ─── Public types ───────────────────────────────────────────────────────────

/// Tunables for a supervisor.
#[derive(Clone, Debug)]
pub struct SupervisorOptions {
    /// Backoff and attempt limit.
    pub policy: ReconnectionPolicy,
    /// Bound on each connect attempt.
    pub connect_timeout: Duration,
    /// Silence after which an open connection counts as dropped.
    pub heartbeat_timeout: Option<Duration>,
    /// Outbound queue bound, overflow and stop behaviour.
    pub queue: QueueSettings,
}

impl SupervisorOptions {
    /// Options from loaded settings.
    pub fn from_settings(settings: &LinkSettings) -> Self {
        Self {
            policy: ReconnectionPolicy::from_settings(settings),
            connect_timeout: settings.connect_timeout(),
            heartbeat_timeout: settings.heartbeat_timeout(),
            queue: settings.queue.clone(),
        }
    }
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::from_settings(&LinkSettings::default())
    }
}

/// Result of a lifecycle command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The command started a connect attempt.
    Accepted,
    /// The command is not valid in the current state and changed nothing.
    Ignored(ConnectionState),
    /// The supervisor has shut down.
    Closed,
}

/// Result of [`ConnectionSupervisor::emit`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmitOutcome {
    /// Handed to the transport.
    Sent(MessageId),
    /// Waiting in the outbound queue for a connection.
    Queued(MessageId),
}

impl EmitOutcome {
    /// Identity of the emitted message.
    pub fn id(&self) -> &MessageId {
        match self {
            Self::Sent(id) | Self::Queued(id) => id,
        }
    }

    /// Whether the message already left the queue.
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent(_))
    }
}

// ─── Commands ───────────────────────────────────────────────────────────────

enum Command {
    Start {
        reply: oneshot::Sender<CommandOutcome>,
    },
    Stop {
        reply: oneshot::Sender<Vec<QueuedMessage>>,
    },
    ManualReconnect {
        reply: oneshot::Sender<CommandOutcome>,
    },
    /// Flush if connected; reply once the queue drained or cannot drain.
    Drain {
        reply: oneshot::Sender<()>,
    },
    SetCredentials(Credentials),
    QueueChanged,
    ConnectFinished {
        generation: u64,
        result: Result<InboundReceiver, TransportError>,
    },
    RetryDue {
        generation: u64,
    },
    ConnectionLost {
        generation: u64,
        error: TransportError,
    },
    FlushFinished {
        generation: u64,
        result: Result<usize, TransportError>,
    },
}

// ─── Handle ─────────────────────────────────────────────────────────────────

/// Handle to a running supervisor. Cloning shares the same connection.
///
/// When the last handle is dropped the driver stops the connection and
/// exits.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    commands: mpsc::UnboundedSender<Command>,
    store: ConnectionStateStore,
    router: EventRouter,
    queue: Arc<OutboundQueue>,
    transitions: broadcast::Sender<StateTransition>,
    shutdown: CancellationToken,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
    _lifeline: Arc<DropGuard>,
}

impl ConnectionSupervisor {
    /// Spawn the driver task in `Idle`. Nothing connects until
    /// [`start`](Self::start).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(transport: Arc<dyn Transport>, credentials: Credentials, options: SupervisorOptions) -> Self {
        let (commands, inbox) = mpsc::unbounded_channel();

        let observer = commands.clone();
        let queue = Arc::new(OutboundQueue::from_settings(&options.queue).with_observer(move || {
            let _ = observer.send(Command::QueueChanged);
        }));
        let store = ConnectionStateStore::new();
        let router = EventRouter::new();
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);
        let shutdown = CancellationToken::new();

        let driver = Driver {
            transport,
            credentials,
            policy: options.policy,
            connect_timeout: options.connect_timeout,
            heartbeat_timeout: options.heartbeat_timeout,
            retain_on_stop: options.queue.retain_on_stop,
            queue: queue.clone(),
            router: router.clone(),
            store: store.clone(),
            transitions: transitions.clone(),
            commands: commands.clone(),
            state: ConnectionState::Idle,
            attempt: 0,
            last_error: None,
            generation: 0,
            epoch: CancellationToken::new(),
            flushing: None,
            flush_waiters: Vec::new(),
        };
        let handle = tokio::spawn(driver.run(inbox, shutdown.clone()));

        Self {
            commands,
            store,
            router,
            queue,
            transitions,
            driver: Arc::new(Mutex::new(Some(handle))),
            _lifeline: Arc::new(shutdown.clone().drop_guard()),
            shutdown,
        }
    }

    /// Begin connecting from `Idle`, `Failed` or `Disconnected`.
    pub async fn start(&self) -> CommandOutcome {
        self.request(|reply| Command::Start { reply })
            .await
            .unwrap_or(CommandOutcome::Closed)
    }

    /// Stop and disconnect. Cancels the retry timer and all connection work.
    ///
    /// Returns the messages cleared from the outbound queue (empty when the
    /// queue is retained across stops).
    pub async fn stop(&self) -> Vec<QueuedMessage> {
        self.request(|reply| Command::Stop { reply })
            .await
            .unwrap_or_default()
    }

    /// Connect now, from `Reconnecting` (skipping the pending delay) or
    /// `Failed` (with a fresh attempt budget).
    pub async fn manual_reconnect(&self) -> CommandOutcome {
        self.request(|reply| Command::ManualReconnect { reply })
            .await
            .unwrap_or(CommandOutcome::Closed)
    }

    /// Queue a message and, if connected, drain the queue.
    ///
    /// Resolves once the message was handed to the transport or is known to
    /// be waiting for a connection.
    pub async fn emit(&self, event: impl Into<String>, payload: Value) -> Result<EmitOutcome, QueueError> {
        let id = self.queue.enqueue(event, payload)?;
        let _ = self.request(|reply| Command::Drain { reply }).await;

        if self.queue.contains(&id) {
            Ok(EmitOutcome::Queued(id))
        } else {
            Ok(EmitOutcome::Sent(id))
        }
    }

    /// Credentials to present on the next connect attempt.
    pub fn set_credentials(&self, credentials: Credentials) {
        let _ = self.commands.send(Command::SetCredentials(credentials));
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.store.state()
    }

    /// Current published snapshot.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.store.snapshot()
    }

    /// Observable snapshot store.
    pub fn store(&self) -> &ConnectionStateStore {
        &self.store
    }

    /// Inbound event router.
    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    /// Copy of the queued outbound messages, head first.
    pub fn pending(&self) -> Vec<QueuedMessage> {
        self.queue.pending()
    }

    /// Messages evicted from a full queue so far.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Receiver for every accepted transition from now on.
    pub fn transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// Stop the connection and wait for the driver task to exit.
    pub async fn shutdown(&self) {
        self.request_shutdown();
        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Signal the driver to stop the connection and exit, without waiting.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether [`shutdown`](Self::shutdown) was requested.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, response) = oneshot::channel();
        self.commands.send(command(reply)).ok()?;
        response.await.ok()
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("snapshot", &self.store.snapshot())
            .finish_non_exhaustive()
    }
}

// ─── Driver ─────────────────────────────────────────────────────────────────

struct Driver {
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    policy: ReconnectionPolicy,
    connect_timeout: Duration,
    heartbeat_timeout: Option<Duration>,
    retain_on_stop: bool,
    queue: Arc<OutboundQueue>,
    router: EventRouter,
    store: ConnectionStateStore,
    transitions: broadcast::Sender<StateTransition>,
    commands: mpsc::UnboundedSender<Command>,

    state: ConnectionState,
    attempt: u32,
    last_error: Option<ConnectionError>,
    generation: u64,
    /// Cancels the connect attempt, retry timer, inbound pump, heartbeat and
    /// flush belonging to the current generation.
    epoch: CancellationToken,
    /// Generation of the flush task currently running, if any.
    flushing: Option<u64>,
    flush_waiters: Vec<oneshot::Sender<()>>,
}

impl Driver {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>, shutdown: CancellationToken) {
        loop {
            let command = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                command = inbox.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle(command).await;
            self.publish();
        }

        let _ = self.stop().await;
        self.publish();
        debug!("connection supervisor exited");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start { reply } => {
                let outcome = self.start();
                let _ = reply.send(outcome);
            }
            Command::Stop { reply } => {
                let cleared = self.stop().await;
                let _ = reply.send(cleared);
            }
            Command::ManualReconnect { reply } => {
                let outcome = self.manual_reconnect();
                let _ = reply.send(outcome);
            }
            Command::Drain { reply } => self.drain(reply),
            Command::SetCredentials(credentials) => self.credentials = credentials,
            // Published after every command.
            Command::QueueChanged => {}
            Command::ConnectFinished { generation, result } => {
                self.connect_finished(generation, result).await;
            }
            Command::RetryDue { generation } => {
                if generation == self.generation && self.state == ConnectionState::Reconnecting {
                    self.begin_connect();
                }
            }
            Command::ConnectionLost { generation, error } => {
                if generation == self.generation {
                    self.connection_lost(error).await;
                }
            }
            Command::FlushFinished { generation, result } => {
                self.flush_finished(generation, result).await;
            }
        }
    }

    // ─── Commands ───────────────────────────────────────────────────────

    fn start(&mut self) -> CommandOutcome {
        match self.state {
            ConnectionState::Idle => {}
            ConnectionState::Failed | ConnectionState::Disconnected => self.attempt = 0,
            state => {
                debug!(%state, "start ignored");
                return CommandOutcome::Ignored(state);
            }
        }
        info!(from = %self.state, "starting connection");
        self.begin_connect();
        CommandOutcome::Accepted
    }

    fn manual_reconnect(&mut self) -> CommandOutcome {
        match self.state {
            ConnectionState::Reconnecting => {}
            ConnectionState::Failed => self.attempt = 0,
            state => {
                debug!(%state, "manual reconnect ignored");
                return CommandOutcome::Ignored(state);
            }
        }
        info!(attempt = self.attempt, from = %self.state, "manual reconnect");
        self.begin_connect();
        CommandOutcome::Accepted
    }

    async fn stop(&mut self) -> Vec<QueuedMessage> {
        let was = self.state;
        self.new_epoch();
        if was.is_active() {
            self.transport.disconnect().await;
        }
        if was != ConnectionState::Disconnected && self.transition(ConnectionState::Disconnected) {
            info!(from = %was, "connection stopped");
        }

        if self.retain_on_stop {
            Vec::new()
        } else {
            let cleared = self.queue.clear();
            if !cleared.is_empty() {
                debug!(count = cleared.len(), "cleared outbound queue on stop");
            }
            cleared
        }
    }

    fn drain(&mut self, reply: oneshot::Sender<()>) {
        if self.state != ConnectionState::Connected || self.queue.is_empty() {
            let _ = reply.send(());
            return;
        }
        self.flush_waiters.push(reply);
        self.ensure_flush();
    }

    // ─── Connection lifecycle ───────────────────────────────────────────

    /// Cancel everything tied to the current generation and open a new one.
    fn new_epoch(&mut self) {
        self.epoch.cancel();
        self.epoch = CancellationToken::new();
        self.generation += 1;
        self.flushing = None;
        self.release_flush_waiters();
    }

    fn begin_connect(&mut self) {
        self.new_epoch();
        if !self.transition(ConnectionState::Connecting) {
            return;
        }

        let generation = self.generation;
        let cancel = self.epoch.clone();
        let transport = self.transport.clone();
        let credentials = self.credentials.clone();
        let timeout = self.connect_timeout;
        let commands = self.commands.clone();

        drop(tokio::spawn(async move {
            let attempt = tokio::time::timeout(timeout, transport.connect(&credentials));
            let result = tokio::select! {
                () = cancel.cancelled() => return,
                outcome = attempt => outcome.unwrap_or_else(|_| {
                    Err(TransportError::Timeout {
                        after_ms: millis(timeout),
                    })
                }),
            };
            let _ = commands.send(Command::ConnectFinished { generation, result });
        }));
    }

    async fn connect_finished(&mut self, generation: u64, result: Result<InboundReceiver, TransportError>) {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            debug!(generation, current = self.generation, "discarding stale connect result");
            // A late success may have left a channel open that nothing owns.
            if result.is_ok()
                && !matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected)
            {
                self.transport.disconnect().await;
            }
            return;
        }

        match result {
            Ok(inbound) => {
                self.attempt = 0;
                self.last_error = None;
                if self.transition(ConnectionState::Connected) {
                    info!(generation, queued = self.queue.len(), "connected");
                    self.spawn_pump(inbound);
                    if !self.queue.is_empty() {
                        self.ensure_flush();
                    }
                }
            }
            Err(error) => {
                warn!(attempt = self.attempt + 1, error = %error, "connect attempt failed");
                self.attempt_failed(&error);
            }
        }
    }

    async fn connection_lost(&mut self, error: TransportError) {
        if self.state != ConnectionState::Connected {
            return;
        }
        warn!(error = %error, "connection lost");
        self.new_epoch();
        self.transport.disconnect().await;
        // A drop always earns one scheduled attempt; the budget is checked
        // when that attempt fails.
        self.record_failure(&error);
        self.enter_reconnecting();
    }

    /// Count a failed connect attempt and move to `Reconnecting` or `Failed`.
    fn attempt_failed(&mut self, error: &TransportError) {
        self.record_failure(error);
        if self.policy.should_retry(self.attempt) {
            self.enter_reconnecting();
        } else if self.transition(ConnectionState::Failed) {
            info!(
                attempts = self.attempt,
                max = %self.policy.max_attempts(),
                error = %error,
                "reconnect attempts exhausted"
            );
        }
    }

    fn record_failure(&mut self, error: &TransportError) {
        self.attempt = self.attempt.saturating_add(1);
        self.last_error = Some(ConnectionError::from(error));
    }

    fn enter_reconnecting(&mut self) {
        let delay = self.policy.next_delay(self.attempt);
        if self.transition(ConnectionState::Reconnecting) {
            debug!(attempt = self.attempt, delay_ms = millis(delay), "scheduling reconnect");
            self.schedule_retry(delay);
        }
    }

    fn schedule_retry(&self, delay: Duration) {
        let generation = self.generation;
        let cancel = self.epoch.clone();
        let commands = self.commands.clone();

        drop(tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = commands.send(Command::RetryDue { generation });
                }
            }
        }));
    }

    fn spawn_pump(&self, inbound: InboundReceiver) {
        let generation = self.generation;
        let cancel = self.epoch.clone();
        let router = self.router.clone();
        let commands = self.commands.clone();
        let heartbeat = self.heartbeat_timeout;

        drop(tokio::spawn(async move {
            let liveness = Liveness::default();
            let lost = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                error = pump_inbound(inbound, &router, &liveness) => Some(error),
                error = watch_liveness(&liveness, heartbeat, cancel.clone()) => error,
            };
            if let Some(error) = lost {
                let _ = commands.send(Command::ConnectionLost { generation, error });
            }
        }));
    }

    // ─── Flush ──────────────────────────────────────────────────────────

    fn ensure_flush(&mut self) {
        if self.flushing == Some(self.generation) {
            return;
        }
        self.flushing = Some(self.generation);

        let generation = self.generation;
        let cancel = self.epoch.clone();
        let queue = self.queue.clone();
        let transport = self.transport.clone();
        let commands = self.commands.clone();

        drop(tokio::spawn(async move {
            let result = queue.flush_until(transport.as_ref(), &cancel).await;
            let _ = commands.send(Command::FlushFinished { generation, result });
        }));
    }

    async fn flush_finished(&mut self, generation: u64, result: Result<usize, TransportError>) {
        if self.flushing == Some(generation) {
            self.flushing = None;
        }
        if generation != self.generation {
            return;
        }

        match result {
            Ok(_) if self.state == ConnectionState::Connected && !self.queue.is_empty() => {
                // Messages arrived after the flush saw an empty queue.
                self.ensure_flush();
            }
            Ok(_) => self.release_flush_waiters(),
            Err(error) => {
                warn!(error = %error, remaining = self.queue.len(), "flush failed");
                self.connection_lost(error).await;
            }
        }
    }

    fn release_flush_waiters(&mut self) {
        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    // ─── State ──────────────────────────────────────────────────────────

    /// Apply `to` if it is a legal edge and record it on the trace.
    fn transition(&mut self, to: ConnectionState) -> bool {
        let from = self.state;
        if !from.can_transition_to(to) {
            warn!(%from, %to, "refusing illegal transition");
            return false;
        }
        self.state = to;
        debug!(%from, %to, attempt = self.attempt, "state transition");
        let _ = self.transitions.send(StateTransition {
            from,
            to,
            attempt: self.attempt,
            at: Utc::now(),
        });
        true
    }

    fn publish(&self) {
        let _ = self.store.update(|snapshot| {
            snapshot.state = self.state;
            snapshot.error.clone_from(&self.last_error);
            snapshot.reconnect_attempt = self.attempt;
            snapshot.queued_count = self.queue.len();
        });
    }
}

// ─── Connection tasks ───────────────────────────────────────────────────────

/// Dispatch inbound events until the channel ends.
async fn pump_inbound(mut inbound: InboundReceiver, router: &EventRouter, liveness: &Liveness) -> TransportError {
    while let Some(event) = inbound.recv().await {
        liveness.mark_alive();
        match event {
            TransportEvent::Message { event, payload } => {
                let _ = router.dispatch(&event, &payload);
            }
            TransportEvent::Heartbeat => {}
            TransportEvent::Closed { reason } => {
                debug!(reason = ?reason, "transport closed");
                break;
            }
        }
    }
    TransportError::Closed
}

/// Resolve with an error once the connection goes silent; never resolve when
/// liveness checks are disabled.
async fn watch_liveness(
    liveness: &Liveness,
    timeout: Option<Duration>,
    cancel: CancellationToken,
) -> Option<TransportError> {
    let Some(timeout) = timeout else {
        cancel.cancelled().await;
        return None;
    };
    match run_heartbeat(liveness, timeout, cancel).await {
        HeartbeatResult::TimedOut => Some(TransportError::Unresponsive {
            silent_ms: millis(timeout),
        }),
        HeartbeatResult::Cancelled => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
