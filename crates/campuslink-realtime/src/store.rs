//! Observable snapshot of the connection for UI consumers.
//!
//! Only the supervisor writes to the store. Readers either poll
//! [`ConnectionStateStore::snapshot`], register a synchronous listener with
//! [`ConnectionStateStore::subscribe`], or await changes through a
//! [`tokio::sync::watch`] receiver.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use campuslink_core::{ConnectionError, ConnectionState};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::warn;

/// Everything a connection indicator needs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Last failure, cleared on a successful connect.
    pub error: Option<ConnectionError>,
    /// Current reconnect attempt; zero while connected.
    pub reconnect_attempt: u32,
    /// Outbound messages waiting for a connection.
    pub queued_count: usize,
}

impl ConnectionSnapshot {
    /// Whether the transport is open.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

type Listener = dyn Fn(&ConnectionSnapshot) + Send + Sync;

struct ListenerEntry {
    id: u64,
    callback: Box<Listener>,
    active: AtomicBool,
}

struct StoreInner {
    current: Mutex<ConnectionSnapshot>,
    listeners: Mutex<Vec<Arc<ListenerEntry>>>,
    next_id: AtomicU64,
    watch: watch::Sender<ConnectionSnapshot>,
}

/// Shared, observable [`ConnectionSnapshot`]. Cloning shares the store.
#[derive(Clone)]
pub struct ConnectionStateStore {
    inner: Arc<StoreInner>,
}

impl Default for ConnectionStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateStore {
    /// Store holding the initial (idle, empty) snapshot.
    pub fn new() -> Self {
        let (watch, _) = watch::channel(ConnectionSnapshot::default());
        Self {
            inner: Arc::new(StoreInner {
                current: Mutex::new(ConnectionSnapshot::default()),
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                watch,
            }),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.current.lock().clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.current.lock().state
    }

    /// Call `listener` with every new snapshot until the returned handle is
    /// dropped.
    ///
    /// Listeners run synchronously on the writer's task, in registration
    /// order, and only when the snapshot actually changed.
    pub fn subscribe(
        &self,
        listener: impl Fn(&ConnectionSnapshot) + Send + Sync + 'static,
    ) -> StoreSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push(Arc::new(ListenerEntry {
            id,
            callback: Box::new(listener),
            active: AtomicBool::new(true),
        }));
        StoreSubscription {
            id,
            store: Arc::downgrade(&self.inner),
        }
    }

    /// Receiver that observes every published snapshot.
    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.inner.watch.subscribe()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Apply `change` and notify observers if the snapshot differs.
    ///
    /// Returns whether anything changed.
    pub(crate) fn update(&self, change: impl FnOnce(&mut ConnectionSnapshot)) -> bool {
        let published = {
            let mut current = self.inner.current.lock();
            let mut next = current.clone();
            change(&mut next);
            if next == *current {
                return false;
            }
            current.clone_from(&next);
            next
        };

        let _ = self.inner.watch.send_replace(published.clone());
        self.notify(&published);
        true
    }

    fn notify(&self, snapshot: &ConnectionSnapshot) {
        let listeners: Vec<Arc<ListenerEntry>> = self.inner.listeners.lock().clone();
        for entry in listeners {
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| (entry.callback)(snapshot))).is_err() {
                warn!(listener = entry.id, state = %snapshot.state, "state listener panicked");
            }
        }
    }
}

/// Listener registration; dropping it stops notifications.
#[must_use = "dropping a StoreSubscription unregisters its listener"]
pub struct StoreSubscription {
    id: u64,
    store: Weak<StoreInner>,
}

impl StoreSubscription {
    /// Stop notifications now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for StoreSubscription {
    fn drop(&mut self) {
        let Some(inner) = self.store.upgrade() else {
            return;
        };
        let removed = {
            let mut listeners = inner.listeners.lock();
            let Some(pos) = listeners.iter().position(|l| l.id == self.id) else {
                return;
            };
            listeners.remove(pos)
        };
        removed.active.store(false, Ordering::Release);
    }
}
