//! Branded ID newtypes for type safety.
//!
//! Queued messages and router subscribers each get a distinct ID type
//! implemented as a newtype wrapper around `String`, so a subscriber ID can
//! never be handed to the outbound queue by mistake.
//!
//! All IDs are UUID v7 (time-ordered) generated via [`uuid::Uuid::now_v7`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

branded_id!(
    /// Identifier of a message held by the outbound queue.
    MessageId
);

branded_id!(
    /// Identifier of an event router or state store subscriber.
    SubscriberId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = MessageId::new();
        let b = MessageId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn v7_ids_sort_by_creation() {
        let first = MessageId::new();
        let second = MessageId::new();
        assert!(first.as_str() <= second.as_str());
    }

    #[test]
    fn serde_is_transparent() {
        let id = SubscriberId::from("sub_1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"sub_1\"");
        let back: SubscriberId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn display_matches_inner() {
        let id = MessageId::from("msg_42");
        assert_eq!(id.to_string(), "msg_42");
        assert_eq!(id.as_ref(), "msg_42");
    }
}
