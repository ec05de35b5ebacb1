//! Fan-out of inbound server events to registered handlers.
//!
//! Handlers are invoked synchronously, in registration order, on a snapshot
//! of the subscriber list taken when dispatch starts. A handler added during
//! dispatch therefore waits for the next event, while a handler removed
//! during dispatch is skipped if it has not run yet. A handler that returns
//! an error or panics is logged and does not stop delivery to the rest.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use campuslink_core::{HandlerError, SubscriberId};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{trace, warn};

/// Return type of event handlers.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type HandlerFn = dyn Fn(&str, &Value) -> HandlerResult + Send + Sync;

struct Subscriber {
    id: SubscriberId,
    /// `None` receives every event.
    event: Option<String>,
    handler: Box<HandlerFn>,
    active: AtomicBool,
}

impl Subscriber {
    fn matches(&self, event: &str) -> bool {
        self.event.as_deref().is_none_or(|name| name == event)
    }
}

#[derive(Default)]
struct RouterInner {
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
}

impl RouterInner {
    fn remove(&self, id: &SubscriberId) -> bool {
        // The handler may own other subscriptions; drop it outside the lock.
        let removed = {
            let mut subscribers = self.subscribers.write();
            let Some(pos) = subscribers.iter().position(|s| &s.id == id) else {
                return false;
            };
            subscribers.remove(pos)
        };
        removed.active.store(false, Ordering::Release);
        true
    }
}

/// Outcome of dispatching one event.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that completed successfully.
    pub delivered: usize,
    /// Handlers that returned an error or panicked.
    pub failed: Vec<HandlerError>,
}

impl DispatchReport {
    /// Whether no handler was registered for the event.
    pub fn is_unhandled(&self) -> bool {
        self.delivered == 0 && self.failed.is_empty()
    }
}

/// Registry of event handlers. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct EventRouter {
    inner: Arc<RouterInner>,
}

impl EventRouter {
    /// Empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events named `event`.
    ///
    /// The handler stays registered until the returned [`Subscription`] is
    /// dropped or [`unsubscribe`](Subscription::unsubscribe)d.
    pub fn subscribe<F>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(Some(event.into()), Box::new(move |_, payload| handler(payload)))
    }

    /// Register `handler` for every event. It receives the event name too.
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&str, &Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(None, Box::new(handler))
    }

    fn register(&self, event: Option<String>, handler: Box<HandlerFn>) -> Subscription {
        let subscriber = Arc::new(Subscriber {
            id: SubscriberId::new(),
            event,
            handler,
            active: AtomicBool::new(true),
        });
        let id = subscriber.id.clone();
        self.inner.subscribers.write().push(subscriber);
        Subscription {
            id,
            router: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver one event to every matching handler.
    pub fn dispatch(&self, event: &str, payload: &Value) -> DispatchReport {
        let snapshot: Vec<Arc<Subscriber>> = self
            .inner
            .subscribers
            .read()
            .iter()
            .filter(|s| s.matches(event))
            .cloned()
            .collect();

        let mut report = DispatchReport::default();
        for subscriber in snapshot {
            if !subscriber.active.load(Ordering::Acquire) {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(event, payload)));
            let failure = match outcome {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    continue;
                }
                Ok(Err(e)) => HandlerError::new(event, e.to_string()),
                Err(panic) => HandlerError::from_panic(event, &*panic),
            };
            warn!(
                event,
                subscriber = %subscriber.id,
                panicked = failure.panicked,
                error = %failure.message,
                "event handler failed"
            );
            report.failed.push(failure);
        }

        if report.is_unhandled() {
            trace!(event, "no handlers for event");
        }
        report
    }

    /// Handlers currently registered for `event`, wildcards included.
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.inner
            .subscribers
            .read()
            .iter()
            .filter(|s| s.matches(event))
            .count()
    }

    /// Total registered handlers.
    pub fn len(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.subscribers.read().is_empty()
    }

    /// Unregister every handler.
    pub fn clear(&self) {
        let removed = std::mem::take(&mut *self.inner.subscribers.write());
        for subscriber in removed {
            subscriber.active.store(false, Ordering::Release);
        }
    }
}

/// Registration handle; dropping it unregisters the handler.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    id: SubscriberId,
    router: Weak<RouterInner>,
}

impl Subscription {
    /// Identity of this registration.
    pub fn id(&self) -> &SubscriberId {
        &self.id
    }

    /// Unregister now. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.release()
    }

    fn release(&self) -> bool {
        self.router
            .upgrade()
            .is_some_and(|inner| inner.remove(&self.id))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use campuslink_core::logging::capture_logs;
    use parking_lot::Mutex;
    use serde_json::json;
    use tracing::Level;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Value) -> HandlerResult + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move |_: &Value| {
            let _ = c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    // -- subscribe / dispatch --

    #[test]
    fn dispatch_reaches_named_handlers_in_order() {
        let router = EventRouter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        let _s1 = router.subscribe("order:updated", move |p| {
            o1.lock().push(format!("first:{}", p["id"]));
            Ok(())
        });
        let o2 = order.clone();
        let _s2 = router.subscribe("order:updated", move |p| {
            o2.lock().push(format!("second:{}", p["id"]));
            Ok(())
        });

        let report = router.dispatch("order:updated", &json!({"id": 1}));
        assert_eq!(report.delivered, 2);
        assert_eq!(*order.lock(), vec!["first:1", "second:1"]);
    }

    #[test]
    fn unrelated_events_are_ignored() {
        let router = EventRouter::new();
        let (count, handler) = counter();
        let _sub = router.subscribe("chat:message", handler);

        let report = router.dispatch("inventory:sync", &json!(null));
        assert!(report.is_unhandled());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn wildcard_sees_every_event() {
        let router = EventRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = router.subscribe_all(move |event, _| {
            s.lock().push(event.to_owned());
            Ok(())
        });

        let _ = router.dispatch("a", &json!(1));
        let _ = router.dispatch("b", &json!(2));
        assert_eq!(*seen.lock(), vec!["a", "b"]);
        assert_eq!(router.subscriber_count("anything"), 1);
    }

    // -- unsubscribe --

    #[test]
    fn drop_unsubscribes() {
        let router = EventRouter::new();
        let (count, handler) = counter();
        let sub = router.subscribe("chat:message", handler);
        assert_eq!(router.subscriber_count("chat:message"), 1);

        drop(sub);
        let _ = router.dispatch("chat:message", &json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(router.is_empty());
    }

    #[test]
    fn unsubscribe_twice_is_harmless() {
        let router = EventRouter::new();
        let (_count, handler) = counter();
        let sub = router.subscribe("x", handler);
        router.clear();
        assert!(!sub.unsubscribe());
    }

    #[test]
    fn subscription_outliving_router_is_harmless() {
        let router = EventRouter::new();
        let (_count, handler) = counter();
        let sub = router.subscribe("x", handler);
        drop(router);
        assert!(!sub.unsubscribe());
    }

    #[test]
    fn handler_removed_during_dispatch_is_skipped() {
        let router = EventRouter::new();
        let (second_count, second) = counter();
        let second_sub: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot = second_sub.clone();
        let _first = router.subscribe("e", move |_| {
            drop(slot.lock().take());
            Ok(())
        });
        *second_sub.lock() = Some(router.subscribe("e", second));

        let report = router.dispatch("e", &json!(null));
        assert_eq!(report.delivered, 1);
        assert_eq!(second_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_added_during_dispatch_waits_for_next_event() {
        let router = EventRouter::new();
        let (late_count, late) = counter();
        let late = Arc::new(Mutex::new(Some(late)));
        let added: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));

        let r = router.clone();
        let added_in = added.clone();
        let _first = router.subscribe("e", move |_| {
            if let Some(handler) = late.lock().take() {
                added_in.lock().push(r.subscribe("e", handler));
            }
            Ok(())
        });

        let _ = router.dispatch("e", &json!(null));
        assert_eq!(late_count.load(Ordering::SeqCst), 0);
        let _ = router.dispatch("e", &json!(null));
        assert_eq!(late_count.load(Ordering::SeqCst), 1);
    }

    // -- failure isolation --

    #[test]
    fn failing_handler_does_not_block_others() {
        let (logs, _guard) = capture_logs();
        let router = EventRouter::new();
        let _bad = router.subscribe("notification:new", |_| Err("malformed payload".into()));
        let (count, good) = counter();
        let _good = router.subscribe("notification:new", good);

        let report = router.dispatch("notification:new", &json!({}));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].message, "malformed payload");
        assert!(!report.failed[0].panicked);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(logs.has_event(Level::WARN, "event handler failed"));
    }

    #[test]
    fn panicking_handler_is_contained() {
        let router = EventRouter::new();
        let _bad = router.subscribe("e", |_| panic!("boom"));
        let (count, good) = counter();
        let _good = router.subscribe("e", good);

        let report = router.dispatch("e", &json!(null));
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].panicked);
        assert_eq!(report.failed[0].message, "boom");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
