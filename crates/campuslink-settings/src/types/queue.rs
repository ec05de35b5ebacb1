//! Outbound queue settings.

use serde::{Deserialize, Serialize};

/// What happens when a message is emitted into a full queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverflowPolicy {
    /// Refuse the new message; the caller sees a `QueueError::Full`.
    #[default]
    Reject,
    /// Evict the oldest queued message to make room.
    DropOldest,
}

/// Outbound queue capacity and teardown behaviour.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSettings {
    /// Maximum number of queued messages. `0` means unbounded.
    pub capacity: usize,
    /// Policy applied at capacity.
    pub overflow: OverflowPolicy,
    /// Keep queued messages across `stop()` instead of clearing them.
    pub retain_on_stop: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            overflow: OverflowPolicy::Reject,
            retain_on_stop: false,
        }
    }
}

impl QueueSettings {
    /// Capacity bound, `None` when unbounded.
    pub fn bound(&self) -> Option<usize> {
        (self.capacity > 0).then_some(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let q = QueueSettings::default();
        assert_eq!(q.bound(), Some(1000));
        assert_eq!(q.overflow, OverflowPolicy::Reject);
        assert!(!q.retain_on_stop);
    }

    #[test]
    fn zero_capacity_is_unbounded() {
        let q = QueueSettings {
            capacity: 0,
            ..QueueSettings::default()
        };
        assert_eq!(q.bound(), None);
    }

    #[test]
    fn overflow_serde() {
        let q: QueueSettings =
            serde_json::from_str(r#"{"overflow": "dropOldest", "retainOnStop": true}"#).unwrap();
        assert_eq!(q.overflow, OverflowPolicy::DropOldest);
        assert!(q.retain_on_stop);
        assert_eq!(q.capacity, 1000);
    }
}
