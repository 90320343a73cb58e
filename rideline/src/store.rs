//! The single mutable model behind the chat client: conversation
//! summaries, the active conversation's message log, the typing view, and
//! unread counters.
//!
//! Every component mutates this store through typed command methods while
//! holding its mutex for a short synchronous section; nothing awaits while
//! holding the lock. Correctness across interleaved async completions
//! rests on idempotent inserts (duplicate detection) and re-sorting by
//! timestamp after every insertion.

use std::collections::{HashMap, HashSet};

use rideline_proto::ids::{MessageId, Role, UserId};
use rideline_proto::message::{ConversationSummary, Message};
use rideline_proto::presence::PeerProfile;
use uuid::Uuid;

/// Cap on the durable-id dedup set; when reached the set is cleared
/// wholesale rather than evicted piecemeal.
const MAX_SEEN_IDS: usize = 10_000;

/// Cloned view of the store for observers (UI layer, tests).
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    /// Conversation summaries ordered by recency.
    pub conversations: Vec<ConversationSummary>,
    /// The currently open conversation, if any.
    pub active: Option<UserId>,
    /// Message log of the active conversation, ascending by timestamp.
    pub log: Vec<Message>,
    /// Peers currently typing, with display names.
    pub typing: Vec<(UserId, String)>,
    /// Total unread count across all conversations.
    pub unread_total: u32,
}

/// The local state store.
#[derive(Debug)]
pub struct ChatStore {
    local_user: UserId,
    conversations: Vec<ConversationSummary>,
    active: Option<UserId>,
    log: Vec<Message>,
    typing: HashMap<UserId, String>,
    seen_ids: HashSet<u64>,
    unread_total: u32,
}

impl ChatStore {
    /// Creates an empty store for `local_user`.
    #[must_use]
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            conversations: Vec::new(),
            active: None,
            log: Vec::new(),
            typing: HashMap::new(),
            seen_ids: HashSet::new(),
            unread_total: 0,
        }
    }

    /// The currently open conversation, if any.
    #[must_use]
    pub const fn active(&self) -> Option<&UserId> {
        self.active.as_ref()
    }

    /// Opens the conversation with `peer`: clears the log (to be filled by
    /// the history fetch) and zeroes the peer's unread mirror.
    pub fn set_active(&mut self, peer: UserId) {
        self.active = Some(peer.clone());
        self.log.clear();
        self.clear_unread(&peer);
    }

    /// Closes the active conversation.
    pub fn clear_active(&mut self) {
        self.active = None;
        self.log.clear();
    }

    /// The active conversation's message log, ascending by timestamp.
    #[must_use]
    pub fn log(&self) -> &[Message] {
        &self.log
    }

    /// Conversation summaries ordered by recency.
    #[must_use]
    pub fn conversations(&self) -> &[ConversationSummary] {
        &self.conversations
    }

    /// Total unread count across all conversations.
    #[must_use]
    pub const fn unread_total(&self) -> u32 {
        self.unread_total
    }

    /// Inserts a message into the active log in sorted position.
    ///
    /// Sorting is by timestamp; equal timestamps keep insertion order.
    /// The durable id, if any, is recorded for duplicate detection.
    pub fn insert_sorted(&mut self, message: Message) {
        self.record_seen(&message);
        let idx = self
            .log
            .partition_point(|m| m.sent_at <= message.sent_at);
        self.log.insert(idx, message);
    }

    /// Removes the optimistic entry with the given transient id.
    pub fn remove_local(&mut self, local_id: Uuid) -> Option<Message> {
        let idx = self
            .log
            .iter()
            .position(|m| m.id == MessageId::Local(local_id))?;
        Some(self.log.remove(idx))
    }

    /// Removes a persisted message from the log and, if it was the latest
    /// summary message, from the sidebar.
    pub fn remove_persisted(&mut self, id: u64) -> bool {
        let before = self.log.len();
        self.log.retain(|m| m.id.as_persisted() != Some(id));
        for summary in &mut self.conversations {
            if summary
                .last_message
                .as_ref()
                .is_some_and(|m| m.id.as_persisted() == Some(id))
            {
                summary.last_message = None;
            }
        }
        before != self.log.len()
    }

    /// Reports whether `message` is a duplicate of something already held.
    ///
    /// Durable-id equality is the primary key. The content heuristic
    /// (same sender, same body, timestamps within `window_ms`) is a
    /// fallback for the dual-delivery race and never fires when both
    /// sides carry distinct durable ids. Summaries are consulted too so
    /// duplicates for inactive conversations are caught as well.
    #[must_use]
    pub fn is_duplicate(&self, message: &Message, window_ms: u64) -> bool {
        if let Some(id) = message.id.as_persisted()
            && self.seen_ids.contains(&id)
        {
            return true;
        }
        let content_match = |m: &Message| {
            if let (Some(a), Some(b)) = (m.id.as_persisted(), message.id.as_persisted())
                && a != b
            {
                return false;
            }
            m.sender_id == message.sender_id
                && m.body == message.body
                && m.sent_at.abs_diff(message.sent_at) <= window_ms
        };
        if self.log.iter().any(content_match) {
            return true;
        }
        self.conversations
            .iter()
            .filter_map(|s| s.last_message.as_ref())
            .any(content_match)
    }

    /// Folds a detected duplicate into existing state: records its durable
    /// id and upgrades a content-matched transient entry to that id, so a
    /// later authoritative fetch cannot re-deliver it.
    pub fn absorb_duplicate(&mut self, message: &Message, window_ms: u64) {
        let Some(id) = message.id.as_persisted() else {
            return;
        };
        self.record_seen(message);
        if let Some(existing) = self.log.iter_mut().find(|m| {
            m.id.is_local()
                && m.sender_id == message.sender_id
                && m.body == message.body
                && m.sent_at.abs_diff(message.sent_at) <= window_ms
        }) {
            existing.id = MessageId::Persisted(id);
        }
    }

    /// Updates the sidebar entry for `peer` with a newly seen message,
    /// creating the entry if this is the first message from an unknown
    /// peer. `profile` fills in display metadata when available; the next
    /// summary fetch corrects any fallback values.
    pub fn touch_summary(
        &mut self,
        peer: &UserId,
        message: &Message,
        profile: Option<PeerProfile>,
    ) {
        if let Some(summary) = self
            .conversations
            .iter_mut()
            .find(|s| s.peer.user_id == *peer)
        {
            if let Some(p) = profile {
                summary.peer = p;
            }
            let newer = summary
                .last_message
                .as_ref()
                .is_none_or(|m| m.sent_at <= message.sent_at);
            if newer {
                summary.last_message = Some(message.clone());
            }
        } else {
            let peer_profile = profile.unwrap_or_else(|| PeerProfile {
                user_id: peer.clone(),
                display_name: peer.as_str().to_string(),
                role: Role::Customer,
            });
            self.conversations.push(ConversationSummary {
                peer: peer_profile,
                last_message: Some(message.clone()),
                unread_count: 0,
            });
        }
        self.sort_conversations();
    }

    /// Increments the unread counter for `peer`, returning the new count.
    pub fn bump_unread(&mut self, peer: &UserId) -> u32 {
        self.unread_total = self.unread_total.saturating_add(1);
        if let Some(summary) = self
            .conversations
            .iter_mut()
            .find(|s| s.peer.user_id == *peer)
        {
            summary.unread_count = summary.unread_count.saturating_add(1);
            summary.unread_count
        } else {
            // touch_summary runs before bump_unread on the receive path,
            // so this only covers counters restored from a summary fetch.
            1
        }
    }

    /// Zeroes the unread counter for `peer`, keeping the total consistent.
    pub fn clear_unread(&mut self, peer: &UserId) {
        if let Some(summary) = self
            .conversations
            .iter_mut()
            .find(|s| s.peer.user_id == *peer)
        {
            self.unread_total = self.unread_total.saturating_sub(summary.unread_count);
            summary.unread_count = 0;
        }
    }

    /// Overwrites the unread total with an authoritative server value.
    pub fn set_unread_total(&mut self, total: u32) {
        self.unread_total = total;
    }

    /// Replaces all conversation summaries wholesale (reconciliation).
    ///
    /// The unread invariant is restored afterwards: the active
    /// conversation always shows zero unread, and the total equals the
    /// sum over all conversations.
    pub fn apply_summaries(&mut self, summaries: Vec<ConversationSummary>) {
        self.conversations = summaries;
        if let Some(active) = self.active.clone() {
            if let Some(summary) = self
                .conversations
                .iter_mut()
                .find(|s| s.peer.user_id == active)
            {
                summary.unread_count = 0;
            }
        }
        self.unread_total = self
            .conversations
            .iter()
            .map(|s| s.unread_count)
            .fold(0u32, u32::saturating_add);
        self.sort_conversations();
    }

    /// Overwrites the active conversation's log with a fetched history
    /// page (reconciliation). The input is re-sorted defensively.
    pub fn replace_log(&mut self, mut messages: Vec<Message>) {
        messages.sort_by_key(|m| m.sent_at);
        for message in &messages {
            self.record_seen(message);
        }
        self.log = messages;
    }

    /// Records a peer as typing. Returns `true` if the entry was inserted
    /// or its display name changed.
    pub fn set_typing(&mut self, peer: UserId, display_name: String) -> bool {
        self.typing.insert(peer, display_name.clone()) != Some(display_name)
    }

    /// Removes a peer's typing entry, returning its display name if one
    /// existed.
    pub fn remove_typing(&mut self, peer: &UserId) -> Option<String> {
        self.typing.remove(peer)
    }

    /// Clears every entity in the store (session teardown).
    pub fn clear_all(&mut self) {
        self.conversations.clear();
        self.active = None;
        self.log.clear();
        self.typing.clear();
        self.seen_ids.clear();
        self.unread_total = 0;
    }

    /// Produces a cloned view for observers.
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            conversations: self.conversations.clone(),
            active: self.active.clone(),
            log: self.log.clone(),
            typing: self
                .typing
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            unread_total: self.unread_total,
        }
    }

    /// The local user this store belongs to.
    #[must_use]
    pub const fn local_user(&self) -> &UserId {
        &self.local_user
    }

    fn record_seen(&mut self, message: &Message) {
        if let Some(id) = message.id.as_persisted() {
            if self.seen_ids.len() >= MAX_SEEN_IDS {
                // Wholesale eviction, same policy as duplicate tracking
                // elsewhere in the stack.
                self.seen_ids.clear();
            }
            self.seen_ids.insert(id);
        }
    }

    fn sort_conversations(&mut self) {
        self.conversations.sort_by(|a, b| {
            let a_at = a.last_message.as_ref().map(|m| m.sent_at);
            let b_at = b.last_message.as_ref().map(|m| m.sent_at);
            b_at.cmp(&a_at)
        });
    }
}
