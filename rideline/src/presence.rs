//! Presence roster tracking: who is online, and whether any support
//! staff member is.
//!
//! The roster is rebuilt wholesale on full-list frames and patched
//! incrementally on deltas; the `support_online` aggregate is recomputed
//! on every change.

use std::collections::HashMap;

use rideline_proto::ids::UserId;
use rideline_proto::presence::PresenceEntry;

/// The tracked set of currently known peers and the derived
/// support-online aggregate.
#[derive(Debug, Default)]
pub struct Roster {
    entries: HashMap<UserId, PresenceEntry>,
    support_online: bool,
}

impl Roster {
    /// Creates an empty roster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the roster wholesale with a full snapshot.
    ///
    /// Returns `true` if the `support_online` aggregate changed.
    pub fn replace(&mut self, entries: Vec<PresenceEntry>) -> bool {
        self.entries = entries
            .into_iter()
            .map(|e| (e.user_id.clone(), e))
            .collect();
        self.recompute()
    }

    /// Inserts or updates a single entry (peer-online delta).
    ///
    /// Returns `true` if the `support_online` aggregate changed.
    pub fn upsert(&mut self, entry: PresenceEntry) -> bool {
        self.entries.insert(entry.user_id.clone(), entry);
        self.recompute()
    }

    /// Removes a single entry (peer-offline delta).
    ///
    /// Returns `true` if the `support_online` aggregate changed.
    pub fn remove(&mut self, user_id: &UserId) -> bool {
        self.entries.remove(user_id);
        self.recompute()
    }

    /// Whether the given peer currently has a live session.
    #[must_use]
    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.entries.get(user_id).is_some_and(|e| e.is_online)
    }

    /// Whether at least one support staff member is online.
    #[must_use]
    pub const fn support_online(&self) -> bool {
        self.support_online
    }

    /// Snapshot of all known entries.
    #[must_use]
    pub fn entries(&self) -> Vec<PresenceEntry> {
        self.entries.values().cloned().collect()
    }

    /// Clears the roster (session teardown).
    pub fn clear(&mut self) {
        self.entries.clear();
        self.support_online = false;
    }

    fn recompute(&mut self) -> bool {
        let now = self
            .entries
            .values()
            .any(|e| e.role.is_support() && e.is_online);
        let changed = now != self.support_online;
        self.support_online = now;
        changed
    }
}
