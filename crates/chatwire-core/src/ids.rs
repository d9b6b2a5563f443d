//! Branded ID newtypes for type safety.
//!
//! Server-assigned entities (users, messages, conversations) carry integer
//! ids on the wire. Each gets its own newtype so a sender id can never be
//! passed where a message id is expected.
//!
//! Optimistic messages have no server id yet; they get a [`PendingId`]
//! (UUID v7, time-ordered) until a confirmed copy replaces them.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wrap a raw server id.
            #[must_use]
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            /// Return the raw server id.
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

numeric_id! {
    /// Identifier of a user account.
    UserId
}

numeric_id! {
    /// Server-assigned identifier of a delivered message.
    MessageId
}

numeric_id! {
    /// Server-assigned identifier of a conversation.
    ConversationId
}

/// Temporary identifier of an optimistic message awaiting confirmation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingId(String);

impl PendingId {
    /// Create a fresh pending id (`pending-<uuid v7>`).
    #[must_use]
    pub fn new() -> Self {
        Self(format!("pending-{}", Uuid::now_v7()))
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PendingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PendingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PendingId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
