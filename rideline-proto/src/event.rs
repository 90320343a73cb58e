//! Event-channel frame types for the Rideline chat protocol.
//!
//! Frames are postcard-encoded and sent as WebSocket binary frames in
//! both directions. The same logical message can reach a client twice:
//! once as a live [`ServerFrame::MessageRelayed`] forward and once as the
//! authoritative [`ServerFrame::MessageDelivered`] push; receivers
//! deduplicate, the channel makes no exactly-once promise.

use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, Role, Timestamp, UserId};
use crate::message::{DeliveryState, Message};
use crate::presence::PresenceEntry;

/// A live-relayed copy of a message, carried peer to peer through the
/// server without waiting for the receiver's own fetch.
///
/// `id` is present when the sender already persisted the message; it is
/// the receiver's primary duplicate key against the later
/// [`ServerFrame::MessageDelivered`] push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayedMessage {
    /// Durable id, if the message was persisted before relaying.
    pub id: Option<u64>,
    /// Sender identity (overwritten by the server with the announced
    /// identity of the sending socket).
    pub sender_id: UserId,
    /// Receiver identity, used by the server for routing.
    pub receiver_id: UserId,
    /// Sender display name for receivers that have no profile yet.
    pub sender_name: String,
    /// Sender role.
    pub sender_role: Role,
    /// The message text.
    pub body: String,
    /// Creation timestamp.
    pub sent_at: Timestamp,
}

impl RelayedMessage {
    /// Normalizes this relay frame into the canonical [`Message`] shape.
    ///
    /// Relayed copies without a durable id get a fresh transient id; they
    /// are matched against later authoritative deliveries by content.
    #[must_use]
    pub fn into_message(self) -> Message {
        Message {
            id: self.id.map_or_else(MessageId::new_local, MessageId::Persisted),
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            body: self.body,
            sent_at: self.sent_at,
            delivery: DeliveryState::Confirmed,
        }
    }
}

/// Frames sent from a client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Announce the local identity. Must be the first frame after every
    /// connect and reconnect.
    Announce {
        /// Local user identity.
        user_id: UserId,
        /// Display name shown to peers.
        display_name: String,
        /// Customer or support staff.
        role: Role,
    },

    /// Request the full presence roster.
    RequestRoster,

    /// Typing state change, forwarded to one receiver.
    Typing {
        /// Peer the indicator is addressed to.
        receiver_id: UserId,
        /// The typing peer (overwritten server-side with the announced
        /// identity).
        sender_id: UserId,
        /// Display name of the typing peer.
        sender_name: String,
        /// `true` while typing, `false` when stopped.
        is_typing: bool,
    },

    /// Best-effort live relay of a just-persisted message.
    Relay(RelayedMessage),
}

/// Frames sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Full roster snapshot; replaces any previously known roster.
    RosterFull(Vec<PresenceEntry>),

    /// A peer came online (roster delta).
    PeerOnline(PresenceEntry),

    /// A peer went offline (roster delta).
    PeerOffline {
        /// The peer that disconnected.
        user_id: UserId,
    },

    /// A peer's typing state changed.
    Typing {
        /// The typing peer.
        sender_id: UserId,
        /// Display name of the typing peer.
        sender_name: String,
        /// `true` while typing, `false` when stopped.
        is_typing: bool,
    },

    /// Live-relayed copy of a message from a peer.
    MessageRelayed(RelayedMessage),

    /// Push notification of a message persisted by the server.
    MessageDelivered(Message),
}
