//! Newtype identifiers.
//!
//! Every protocol concept that has an identity is represented as a distinct
//! newtype wrapping a primitive, so a message id can never be mistaken for a
//! connection id or a raw counter value.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for u32-wrapped newtypes (wire-level integers).
// Generates: struct (Copy), new(), as_u32(), Display.
// ---------------------------------------------------------------------------
macro_rules! u32_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(u32);

        impl $name {
            /// Creates a new identifier from a raw integer.
            pub fn new(value: u32) -> Self {
                Self(value)
            }

            /// Returns the underlying integer value.
            pub fn as_u32(self) -> u32 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Wire identifiers
// ---------------------------------------------------------------------------

u32_id! {
    /// Correlates a request with its response on one connection.
    ///
    /// Chosen by the caller, unique among that connection's outstanding
    /// requests, and echoed verbatim by the server.
    MsgId
}

// ---------------------------------------------------------------------------
// Locally generated identifiers
// ---------------------------------------------------------------------------

/// Identifies one accepted or established connection.
///
/// Never sent on the wire; attached to tracing spans and call records so all
/// activity on a single connection can be correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generates a new random connection identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a [`ConnectionId`] from an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
