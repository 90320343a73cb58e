//! Message and conversation types for the Rideline chat protocol.

use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, Timestamp, UserId};
use crate::presence::PeerProfile;

/// Maximum allowed message body size in bytes (64 KiB).
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// Delivery lifecycle of a message as seen by the sending client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Optimistically inserted, persist call still in flight.
    Pending,
    /// Persisted by the server.
    Confirmed,
    /// Persist call failed; the entry is rolled back.
    Failed,
}

/// A chat message between two peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Transient or durable identity.
    pub id: MessageId,
    /// Who sent the message.
    pub sender_id: UserId,
    /// Who the message is addressed to.
    pub receiver_id: UserId,
    /// The message text.
    pub body: String,
    /// When the message was created (server clock once persisted).
    pub sent_at: Timestamp,
    /// Delivery lifecycle state.
    pub delivery: DeliveryState,
}

impl Message {
    /// Returns the conversation key for this message: the other party
    /// relative to `local`.
    #[must_use]
    pub fn conversation_peer<'a>(&'a self, local: &UserId) -> &'a UserId {
        if self.sender_id == *local {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }
}

/// Error returned when a message body fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Body is empty or whitespace-only.
    #[error("message body is empty")]
    Empty,
    /// Body exceeds the maximum allowed size.
    #[error("message body too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the body in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Validates a message body for sending.
///
/// Rejects empty or whitespace-only bodies and bodies over
/// [`MAX_BODY_SIZE`]. Runs before any network call; a rejected body
/// never mutates client state.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] or [`ValidationError::TooLarge`].
pub fn validate_body(body: &str) -> Result<(), ValidationError> {
    if body.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    if body.len() > MAX_BODY_SIZE {
        return Err(ValidationError::TooLarge {
            size: body.len(),
            max: MAX_BODY_SIZE,
        });
    }
    Ok(())
}

/// Kind of message payload. Only text today; attachments would slot in
/// here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Plain text body.
    Text,
}

/// Request body for the submit-message persistence call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitMessageRequest {
    /// Peer the message is addressed to.
    pub receiver_id: UserId,
    /// The message text.
    pub body: String,
    /// Payload kind.
    pub kind: MessageKind,
}

/// Sidebar summary of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// The other party in the conversation.
    pub peer: PeerProfile,
    /// Most recent message in either direction, if any.
    pub last_message: Option<Message>,
    /// Messages received but not yet read by the local user.
    pub unread_count: u32,
}

/// One page of paginated message history.
///
/// Page 0 holds the newest `limit` messages; messages within a page are
/// ascending by timestamp. `has_more` indicates older pages exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Messages in this page, ascending by timestamp.
    pub messages: Vec<Message>,
    /// Whether older messages exist beyond this page.
    pub has_more: bool,
}

/// Slices one history page out of an ascending message thread, counting
/// pages back from the newest message: page 0 is the newest `limit`
/// messages, `has_more` means older pages exist.
#[must_use]
pub fn page_back_from_newest(thread: &[Message], page: u32, limit: u32) -> HistoryPage {
    let limit = (limit.max(1)) as usize;
    let total = thread.len();
    let end = total.saturating_sub(page as usize * limit);
    let start = end.saturating_sub(limit);
    HistoryPage {
        messages: thread[start..end].to_vec(),
        has_more: start > 0,
    }
}
