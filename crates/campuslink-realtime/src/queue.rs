//! FIFO buffer of outbound messages awaiting an open connection.
//!
//! Messages leave the queue only after the transport accepted them, so a
//! send failure mid-flush leaves the failed message at the head for the next
//! flush. Flushes are serialized; an `enqueue` that lands during a flush is
//! picked up by the same pass.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use campuslink_core::{MessageId, QueueError, TransportError};
use campuslink_settings::{OverflowPolicy, QueueSettings};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::Transport;

/// Callback invoked after the queue length may have changed.
pub type LengthObserver = Box<dyn Fn() + Send + Sync>;

/// One pending outbound message.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    /// Identity used to confirm delivery.
    pub id: MessageId,
    /// Event name.
    pub event: String,
    /// Payload.
    pub payload: Value,
    /// When the message was accepted.
    pub enqueued_at: DateTime<Utc>,
}

/// Ordered outbound buffer with an optional capacity bound.
pub struct OutboundQueue {
    messages: Mutex<VecDeque<QueuedMessage>>,
    capacity: Option<usize>,
    overflow: OverflowPolicy,
    dropped: AtomicU64,
    flush_gate: tokio::sync::Mutex<()>,
    observer: Option<LengthObserver>,
}

impl OutboundQueue {
    /// Queue with the given bound (`None` = unbounded) and overflow policy.
    pub fn new(capacity: Option<usize>, overflow: OverflowPolicy) -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            capacity,
            overflow,
            dropped: AtomicU64::new(0),
            flush_gate: tokio::sync::Mutex::new(()),
            observer: None,
        }
    }

    /// Queue configured from settings.
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self::new(settings.bound(), settings.overflow)
    }

    /// Notify `observer` after every change in length.
    ///
    /// The observer runs without the queue lock held.
    #[must_use]
    pub fn with_observer(mut self, observer: impl Fn() + Send + Sync + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Append a message.
    ///
    /// At capacity, [`OverflowPolicy::Reject`] refuses the message and
    /// [`OverflowPolicy::DropOldest`] evicts the head to make room.
    pub fn enqueue(&self, event: impl Into<String>, payload: Value) -> Result<MessageId, QueueError> {
        let message = QueuedMessage {
            id: MessageId::new(),
            event: event.into(),
            payload,
            enqueued_at: Utc::now(),
        };
        let id = message.id.clone();

        {
            let mut messages = self.messages.lock();
            if let Some(capacity) = self.capacity {
                if messages.len() >= capacity {
                    match self.overflow {
                        OverflowPolicy::Reject => {
                            return Err(QueueError::Full { capacity });
                        }
                        OverflowPolicy::DropOldest => {
                            if let Some(evicted) = messages.pop_front() {
                                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                                warn!(
                                    event = %evicted.event,
                                    id = %evicted.id,
                                    capacity,
                                    "outbound queue full, dropped oldest message"
                                );
                            }
                        }
                    }
                }
            }
            messages.push_back(message);
        }

        self.notify();
        Ok(id)
    }

    /// Send every queued message in FIFO order.
    ///
    /// Stops at the first send failure, leaving that message and the rest in
    /// the queue. Returns the number of messages sent.
    pub async fn flush(&self, sender: &dyn Transport) -> Result<usize, TransportError> {
        self.flush_until(sender, &CancellationToken::new()).await
    }

    /// [`flush`](Self::flush) that stops quietly once `cancel` fires, even
    /// while a send is still in flight. An interrupted send leaves its
    /// message at the head.
    pub async fn flush_until(
        &self,
        sender: &dyn Transport,
        cancel: &CancellationToken,
    ) -> Result<usize, TransportError> {
        let _gate = tokio::select! {
            () = cancel.cancelled() => return Ok(0),
            gate = self.flush_gate.lock() => gate,
        };
        let mut sent = 0;

        while !cancel.is_cancelled() {
            let Some(head) = self.messages.lock().front().cloned() else {
                break;
            };

            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(id = %head.id, "flush cancelled mid-send");
                    break;
                }
                result = sender.send(&head.event, &head.payload) => result?,
            }

            let removed = {
                let mut messages = self.messages.lock();
                // Eviction may have replaced the head while the send was in flight.
                if messages.front().is_some_and(|m| m.id == head.id) {
                    messages.pop_front().is_some()
                } else {
                    false
                }
            };
            if removed {
                self.notify();
            }
            sent += 1;
        }

        if sent > 0 {
            debug!(sent, remaining = self.len(), "flushed outbound queue");
        }
        Ok(sent)
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Whether a message with this id is still queued.
    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.lock().iter().any(|m| &m.id == id)
    }

    /// Copy of the queued messages, head first.
    pub fn pending(&self) -> Vec<QueuedMessage> {
        self.messages.lock().iter().cloned().collect()
    }

    /// Remove and return every queued message.
    pub fn clear(&self) -> Vec<QueuedMessage> {
        let drained: Vec<QueuedMessage> = self.messages.lock().drain(..).collect();
        if !drained.is_empty() {
            self.notify();
        }
        drained
    }

    /// Messages evicted under [`OverflowPolicy::DropOldest`].
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Configured bound.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn notify(&self) {
        if let Some(observer) = &self.observer {
            observer();
        }
    }
}
