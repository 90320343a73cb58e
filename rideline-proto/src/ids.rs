//! Identity and time primitives shared across the Rideline chat protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for a chat participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Creates a user identifier from a string representation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this user ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a chat participant.
///
/// `Support` peers staff the marketplace help desk; their aggregate
/// online state is surfaced to customers as "support is online".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// A marketplace customer.
    Customer,
    /// A support staff member.
    Support,
}

impl Role {
    /// Returns `true` for support staff.
    #[must_use]
    pub const fn is_support(self) -> bool {
        matches!(self, Self::Support)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Customer => write!(f, "customer"),
            Self::Support => write!(f, "support"),
        }
    }
}

/// Identity of a message: transient while optimistic, durable once persisted.
///
/// A message created by the send pipeline starts out `Local` (UUID v7,
/// time-ordered) and is replaced by the server-assigned `Persisted` id when
/// the persist call confirms. Durable-id equality is the primary duplicate
/// key on the receive path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageId {
    /// Transient client-side identity for a not-yet-persisted message.
    Local(Uuid),
    /// Durable server-assigned identity.
    Persisted(u64),
}

impl MessageId {
    /// Creates a fresh transient identity (UUID v7).
    #[must_use]
    pub fn new_local() -> Self {
        Self::Local(Uuid::now_v7())
    }

    /// Returns the durable id, if this message has been persisted.
    #[must_use]
    pub const fn as_persisted(&self) -> Option<u64> {
        match self {
            Self::Persisted(id) => Some(*id),
            Self::Local(_) => None,
        }
    }

    /// Returns `true` while the message only has a transient identity.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(uuid) => write!(f, "local:{uuid}"),
            Self::Persisted(id) => write!(f, "{id}"),
        }
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Absolute difference between two timestamps, in milliseconds.
    #[must_use]
    pub const fn abs_diff(&self, other: Self) -> u64 {
        self.0.abs_diff(other.0)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}
