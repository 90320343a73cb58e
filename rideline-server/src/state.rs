//! Shared server state: live session registry and in-memory storage.

use std::collections::{HashMap, HashSet};

use axum::extract::ws::Message as WsMessage;
use tokio::sync::{RwLock, mpsc};

use rideline_proto::codec;
use rideline_proto::event::ServerFrame;
use rideline_proto::ids::{MessageId, Role, Timestamp, UserId};
use rideline_proto::message::{self, ConversationSummary, DeliveryState, HistoryPage, Message};
use rideline_proto::presence::{PeerProfile, PresenceEntry};

/// A live event-channel session for one user.
struct Session {
    sender: mpsc::UnboundedSender<WsMessage>,
    entry: PresenceEntry,
}

/// Persisted chat data (in-memory).
#[derive(Default)]
struct Storage {
    next_id: u64,
    messages: Vec<Message>,
    profiles: HashMap<String, PeerProfile>,
    /// Unread counters keyed by (owner, peer).
    unread: HashMap<(String, String), u32>,
    /// Users whose credentials have been revoked (401 on every call).
    revoked: HashSet<String>,
    /// Test hook: reject all submit calls with a server error.
    fail_submissions: bool,
}

/// Shared state behind the WebSocket and HTTP handlers.
#[derive(Default)]
pub struct ServerState {
    sessions: RwLock<HashMap<String, Session>>,
    storage: RwLock<Storage>,
}

impl ServerState {
    /// Creates empty server state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // -- session registry ---------------------------------------------------

    /// Registers a live session, returning `true` if it replaced an
    /// existing one for the same user. Also records the user's profile.
    pub async fn register(
        &self,
        entry: PresenceEntry,
        sender: mpsc::UnboundedSender<WsMessage>,
    ) -> bool {
        let user_id = entry.user_id.as_str().to_string();
        self.storage.write().await.profiles.insert(
            user_id.clone(),
            entry.profile(),
        );
        let mut sessions = self.sessions.write().await;
        sessions
            .insert(user_id, Session { sender, entry })
            .is_some()
    }

    /// Removes a session only if it still belongs to `session_id`.
    ///
    /// A reconnect replaces the registry entry before the old socket's
    /// cleanup runs; the old cleanup must not unregister the new session.
    pub async fn unregister_session(&self, user_id: &str, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(user_id)
            .is_some_and(|s| s.entry.session_id == session_id)
        {
            sessions.remove(user_id);
            true
        } else {
            false
        }
    }

    /// Clone of the given user's frame sender, if online.
    pub async fn sender_for(&self, user_id: &str) -> Option<mpsc::UnboundedSender<WsMessage>> {
        let sessions = self.sessions.read().await;
        sessions.get(user_id).map(|s| s.sender.clone())
    }

    /// Sends a frame to one user, if online. Returns whether it was
    /// handed to a live session.
    pub async fn send_to(&self, user_id: &str, frame: &ServerFrame) -> bool {
        let Some(sender) = self.sender_for(user_id).await else {
            return false;
        };
        match codec::encode_server(frame) {
            Ok(bytes) => sender.send(WsMessage::Binary(bytes.into())).is_ok(),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode server frame");
                false
            }
        }
    }

    /// Broadcasts a frame to every session except `skip`.
    pub async fn broadcast_except(&self, skip: &str, frame: &ServerFrame) {
        let bytes = match codec::encode_server(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode broadcast frame");
                return;
            }
        };
        let sessions = self.sessions.read().await;
        for (user_id, session) in sessions.iter() {
            if user_id != skip {
                let _ = session.sender.send(WsMessage::Binary(bytes.clone().into()));
            }
        }
    }

    /// Current presence roster (online sessions only).
    pub async fn roster(&self) -> Vec<PresenceEntry> {
        let sessions = self.sessions.read().await;
        sessions.values().map(|s| s.entry.clone()).collect()
    }

    // -- persistence --------------------------------------------------------

    /// Whether the user's credentials have been revoked.
    pub async fn is_revoked(&self, user_id: &str) -> bool {
        self.storage.read().await.revoked.contains(user_id)
    }

    /// Revokes a user's credentials: every subsequent API call answers
    /// 401. Test hook for the auth-expiry path.
    pub async fn revoke(&self, user_id: &str) {
        self.storage
            .write()
            .await
            .revoked
            .insert(user_id.to_string());
    }

    /// Makes every subsequent submit call fail with a server error.
    /// Test hook for the rollback path.
    pub async fn set_fail_submissions(&self, fail: bool) {
        self.storage.write().await.fail_submissions = fail;
    }

    /// Whether submits are currently set to fail.
    pub async fn submissions_failing(&self) -> bool {
        self.storage.read().await.fail_submissions
    }

    /// Persists a message: assigns the durable id and timestamp and bumps
    /// the receiver's unread counter.
    pub async fn persist_message(&self, sender_id: &str, receiver_id: &str, body: &str) -> Message {
        let mut storage = self.storage.write().await;
        storage.next_id += 1;
        let message = Message {
            id: MessageId::Persisted(storage.next_id),
            sender_id: UserId::new(sender_id),
            receiver_id: UserId::new(receiver_id),
            body: body.to_string(),
            sent_at: Timestamp::now(),
            delivery: DeliveryState::Confirmed,
        };
        storage.messages.push(message.clone());
        *storage
            .unread
            .entry((receiver_id.to_string(), sender_id.to_string()))
            .or_insert(0) += 1;
        message
    }

    /// Conversation summaries for one user: one entry per counterpart,
    /// newest message and unread count included.
    pub async fn summaries_for(&self, user_id: &str) -> Vec<ConversationSummary> {
        let storage = self.storage.read().await;
        let me = UserId::new(user_id);
        let mut latest: HashMap<String, Message> = HashMap::new();
        for message in &storage.messages {
            if message.sender_id != me && message.receiver_id != me {
                continue;
            }
            let peer = message.conversation_peer(&me).as_str().to_string();
            let newer = latest
                .get(&peer)
                .is_none_or(|m| m.sent_at <= message.sent_at);
            if newer {
                latest.insert(peer, message.clone());
            }
        }

        let mut summaries: Vec<ConversationSummary> = latest
            .into_iter()
            .map(|(peer, last_message)| {
                let profile = storage.profiles.get(&peer).cloned().unwrap_or(PeerProfile {
                    user_id: UserId::new(peer.as_str()),
                    display_name: peer.clone(),
                    role: Role::Customer,
                });
                let unread_count = storage
                    .unread
                    .get(&(user_id.to_string(), peer))
                    .copied()
                    .unwrap_or(0);
                ConversationSummary {
                    peer: profile,
                    last_message: Some(last_message),
                    unread_count,
                }
            })
            .collect();
        summaries.sort_by(|a, b| {
            let a_at = a.last_message.as_ref().map(|m| m.sent_at);
            let b_at = b.last_message.as_ref().map(|m| m.sent_at);
            b_at.cmp(&a_at)
        });
        summaries
    }

    /// One page of the thread between `user_id` and `peer_id`.
    pub async fn history(&self, user_id: &str, peer_id: &str, page: u32, limit: u32) -> HistoryPage {
        let storage = self.storage.read().await;
        let me = UserId::new(user_id);
        let peer = UserId::new(peer_id);
        let mut thread: Vec<Message> = storage
            .messages
            .iter()
            .filter(|m| {
                (m.sender_id == me && m.receiver_id == peer)
                    || (m.sender_id == peer && m.receiver_id == me)
            })
            .cloned()
            .collect();
        thread.sort_by_key(|m| m.sent_at);
        message::page_back_from_newest(&thread, page, limit)
    }

    /// Total unread count for one user.
    pub async fn unread_total(&self, user_id: &str) -> u32 {
        let storage = self.storage.read().await;
        storage
            .unread
            .iter()
            .filter(|((owner, _), _)| owner == user_id)
            .map(|(_, count)| *count)
            .fold(0u32, u32::saturating_add)
    }

    /// Zeroes the unread counter `user_id` holds for `peer_id`.
    pub async fn mark_read(&self, user_id: &str, peer_id: &str) {
        self.storage
            .write()
            .await
            .unread
            .remove(&(user_id.to_string(), peer_id.to_string()));
    }

    /// Deletes a persisted message. Returns whether it existed.
    pub async fn delete_message(&self, id: u64) -> bool {
        let mut storage = self.storage.write().await;
        let before = storage.messages.len();
        storage
            .messages
            .retain(|m| m.id.as_persisted() != Some(id));
        before != storage.messages.len()
    }

    /// Directory of all known support staff.
    pub async fn support_directory(&self) -> Vec<PeerProfile> {
        let storage = self.storage.read().await;
        storage
            .profiles
            .values()
            .filter(|p| p.role.is_support())
            .cloned()
            .collect()
    }
}
