//! Receive path: normalize → deduplicate → insert-in-order → unread side
//! effects.
//!
//! Both delivery paths land here (the live relay forward and the
//! authoritative delivered push), so for any interleaving of the two the
//! log ends up with exactly one entry per logical message.

use std::sync::Arc;

use rideline_proto::message::Message;
use rideline_proto::presence::PeerProfile;

use crate::api::PersistenceApi;

use super::{ChatEvent, Shared};

/// Maximum preview length for unread notifications, in characters.
const PREVIEW_CHARS: usize = 80;

/// Ingests one normalized inbound message.
///
/// `profile` carries the sender's display metadata when the delivery path
/// provides it (relay frames do, delivered pushes do not).
pub(crate) fn ingest<A: PersistenceApi>(
    shared: &Arc<Shared<A>>,
    message: Message,
    profile: Option<PeerProfile>,
) {
    if shared.is_ended() {
        return;
    }

    let local = &shared.identity.user_id;
    let conversation = message.conversation_peer(local).clone();
    let inbound = message.sender_id != *local;
    let window = shared.config.dedup_window_ms;

    let (inserted_active, bumped) = {
        let mut store = shared.store.lock();
        if store.is_duplicate(&message, window) {
            store.absorb_duplicate(&message, window);
            tracing::debug!(id = %message.id, "duplicate delivery dropped");
            return;
        }

        let is_active = store.active() == Some(&conversation);
        if is_active {
            store.insert_sorted(message.clone());
        }
        store.touch_summary(&conversation, &message, profile);

        let bumped = if inbound && !is_active {
            Some(store.bump_unread(&conversation))
        } else {
            None
        };
        (is_active, bumped)
    };

    if inserted_active {
        shared.emit(ChatEvent::MessageReceived {
            conversation: conversation.clone(),
            message: message.clone(),
        });
    }
    shared.emit(ChatEvent::ConversationsUpdated);
    if bumped.is_some() {
        shared.emit(ChatEvent::UnreadNotification {
            conversation,
            preview: preview(&message.body),
        });
    }

    // Keep sidebar ordering and unread badges authoritative regardless of
    // which path delivered the message.
    let refresh_shared = Arc::clone(shared);
    tokio::spawn(async move {
        super::reconcile::refresh_summaries(&refresh_shared).await;
    });
}

fn preview(body: &str) -> String {
    if body.chars().count() <= PREVIEW_CHARS {
        body.to_string()
    } else {
        let truncated: String = body.chars().take(PREVIEW_CHARS).collect();
        format!("{truncated}…")
    }
}
