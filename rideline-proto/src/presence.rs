//! Presence roster types for peer online/offline tracking.

use serde::{Deserialize, Serialize};

use crate::ids::{Role, UserId};

/// Display metadata for a chat participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProfile {
    /// The peer's identity.
    pub user_id: UserId,
    /// Human-readable display name.
    pub display_name: String,
    /// Customer or support staff.
    pub role: Role,
}

/// One entry in the presence roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// The peer's identity.
    pub user_id: UserId,
    /// Human-readable display name.
    pub display_name: String,
    /// Customer or support staff.
    pub role: Role,
    /// Whether the peer currently has a live event-channel session.
    pub is_online: bool,
    /// Transport-session identifier assigned by the server.
    pub session_id: String,
}

impl PresenceEntry {
    /// Extracts the display metadata from this roster entry.
    #[must_use]
    pub fn profile(&self) -> PeerProfile {
        PeerProfile {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
        }
    }
}
