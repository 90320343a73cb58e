//! Send pipeline: optimistic insert → persist → confirm-or-rollback →
//! best-effort live relay.

use std::sync::Arc;

use rideline_proto::event::{ClientFrame, RelayedMessage};
use rideline_proto::ids::{MessageId, Timestamp, UserId};
use rideline_proto::message::{self, DeliveryState, Message, ValidationError};

use crate::api::{ApiError, PersistenceApi};

use super::{ChatClient, ChatEvent, Shared};

/// Errors returned by the send pipeline.
///
/// Validation variants are rejected synchronously before any network
/// call and leave the log untouched. `Rejected` carries the original
/// body back so the composer can be restored for a retry.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The body failed validation (empty/whitespace or oversized).
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No conversation is open.
    #[error("no active conversation")]
    NoActiveConversation,

    /// The event channel is not connected.
    #[error("not connected")]
    NotConnected,

    /// The persist call failed; the optimistic entry was rolled back.
    #[error("message was not persisted: {source}")]
    Rejected {
        /// The original body, returned for retry.
        body: String,
        /// The underlying API failure.
        #[source]
        source: ApiError,
    },
}

impl<A: PersistenceApi> ChatClient<A> {
    /// Sends `body` to the active conversation.
    ///
    /// The message appears in the log immediately with a transient id and
    /// `Pending` state; once the persist call confirms, the entry is
    /// swapped for the canonical server record and a live-relay frame is
    /// emitted so the peer sees it without waiting on their own fetch.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`]. On [`SendError::Rejected`] the optimistic
    /// entry has been removed and the original body is inside the error.
    pub async fn send_message(&self, body: String) -> Result<MessageId, SendError> {
        message::validate_body(&body)?;
        let Some(peer) = self.shared.store.lock().active().cloned() else {
            return Err(SendError::NoActiveConversation);
        };
        if !self.conn.is_connected() {
            return Err(SendError::NotConnected);
        }
        submit(&self.shared, peer, body).await
    }
}

/// The pipeline body, split from the validation gate so unit tests can
/// drive it without a live connection.
pub(crate) async fn submit<A: PersistenceApi>(
    shared: &Arc<Shared<A>>,
    peer: UserId,
    body: String,
) -> Result<MessageId, SendError> {
    let local_id = uuid::Uuid::now_v7();
    let optimistic = Message {
        id: MessageId::Local(local_id),
        sender_id: shared.identity.user_id.clone(),
        receiver_id: peer.clone(),
        body: body.clone(),
        sent_at: Timestamp::now(),
        delivery: DeliveryState::Pending,
    };
    shared.store.lock().insert_sorted(optimistic);
    shared.emit(ChatEvent::MessageStateChanged {
        id: MessageId::Local(local_id),
        delivery: DeliveryState::Pending,
    });

    match shared.api.submit_message(&peer, &body).await {
        Ok(persisted) => {
            {
                let mut store = shared.store.lock();
                store.remove_local(local_id);
                store.insert_sorted(persisted.clone());
                store.touch_summary(&peer, &persisted, None);
            }
            shared.emit(ChatEvent::MessageStateChanged {
                id: persisted.id.clone(),
                delivery: DeliveryState::Confirmed,
            });

            // Best-effort live relay; the peer would otherwise only see
            // the message through the server's delivered push or a fetch.
            let relay = ClientFrame::Relay(RelayedMessage {
                id: persisted.id.as_persisted(),
                sender_id: shared.identity.user_id.clone(),
                receiver_id: peer,
                sender_name: shared.identity.display_name.clone(),
                sender_role: shared.identity.role,
                body: persisted.body.clone(),
                sent_at: persisted.sent_at,
            });
            if shared.outbound.try_send(relay).is_err() {
                tracing::debug!("relay frame dropped, outbound channel full or closed");
            }

            let refresh_shared = Arc::clone(shared);
            tokio::spawn(async move {
                super::reconcile::refresh_summaries(&refresh_shared).await;
            });

            Ok(persisted.id)
        }
        Err(source) => {
            shared.store.lock().remove_local(local_id);
            shared.emit(ChatEvent::MessageStateChanged {
                id: MessageId::Local(local_id),
                delivery: DeliveryState::Failed,
            });
            shared.handle_api_error(&source);
            tracing::warn!(error = %source, "persist call failed, optimistic entry rolled back");
            Err(SendError::Rejected { body, source })
        }
    }
}
