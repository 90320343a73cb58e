//! Chat client controller.
//!
//! [`ChatClient`] owns the local state store, the presence roster, the
//! typing coordinator, and the event-channel connection, and exposes the
//! typed operations the UI layer drives (open conversation, send, typing
//! input, reconcile, shutdown). State changes are surfaced through a
//! single [`ChatEvent`] stream.
//!
//! The store is mutated only inside short synchronous lock sections;
//! interleaved async completions (fetch responses, push frames, timers)
//! stay safe through duplicate detection and timestamp-sorted insertion
//! rather than long-lived locks.

mod receive;
pub(crate) mod reconcile;
mod send;

pub use send::SendError;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use rideline_proto::event::{ClientFrame, ServerFrame};
use rideline_proto::ids::{MessageId, Role, UserId};
use rideline_proto::message::{DeliveryState, Message};
use rideline_proto::presence::{PeerProfile, PresenceEntry};

use crate::api::{ApiError, PersistenceApi};
use crate::config::ChatConfig;
use crate::connection::{
    self, ConnectSetupError, ConnectionConfig, ConnectionHandle, ConnectionState, LinkEvent,
};
use crate::presence::Roster;
use crate::store::{ChatStore, StoreSnapshot};
use crate::typing::TypingCoordinator;

/// The local user's announced identity.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Local user id.
    pub user_id: UserId,
    /// Display name shown to peers.
    pub display_name: String,
    /// Customer or support staff.
    pub role: Role,
}

/// Events emitted by the client for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A message was added to the active conversation's log.
    MessageReceived {
        /// Conversation the message belongs to.
        conversation: UserId,
        /// The inserted message.
        message: Message,
    },
    /// A sent message's delivery state changed.
    MessageStateChanged {
        /// The message (transient id while pending, durable once
        /// confirmed).
        id: MessageId,
        /// The new delivery state.
        delivery: DeliveryState,
    },
    /// The active conversation's log was overwritten from a history
    /// fetch.
    HistoryRefreshed {
        /// The conversation whose log was reloaded.
        conversation: UserId,
    },
    /// Conversation summaries changed (sidebar refresh hint).
    ConversationsUpdated,
    /// An inbound message for an inactive conversation raised its unread
    /// counter.
    UnreadNotification {
        /// The conversation that gained an unread message.
        conversation: UserId,
        /// Truncated message preview.
        preview: String,
    },
    /// A peer's online state changed (roster delta).
    PresenceChanged {
        /// The peer in question.
        user_id: UserId,
        /// New online state.
        is_online: bool,
    },
    /// The "any support staff online" aggregate flipped.
    SupportOnlineChanged(bool),
    /// A peer's typing state changed.
    TypingChanged {
        /// The typing peer.
        user_id: UserId,
        /// Display name of the typing peer.
        display_name: String,
        /// New typing state.
        is_typing: bool,
    },
    /// The event channel went up or down.
    ConnectionStatus {
        /// Whether the channel is up.
        connected: bool,
    },
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// Attempt number, starting at 1.
        attempt: u32,
        /// Attempt budget.
        max_attempts: u32,
    },
    /// The reconnect attempt budget is exhausted; no further automatic
    /// attempt will be made.
    ReconnectFailed,
    /// The chat session was torn down and will emit nothing further.
    SessionEnded {
        /// Why the session ended.
        reason: String,
    },
    /// A non-fatal error the UI may surface.
    Error(String),
}

/// State shared between the client handle and its background tasks.
pub(crate) struct Shared<A: PersistenceApi> {
    pub(crate) api: A,
    pub(crate) identity: Identity,
    pub(crate) store: Arc<Mutex<ChatStore>>,
    pub(crate) roster: Mutex<Roster>,
    pub(crate) typing: Arc<TypingCoordinator>,
    pub(crate) events: mpsc::Sender<ChatEvent>,
    pub(crate) outbound: mpsc::Sender<ClientFrame>,
    pub(crate) config: ChatConfig,
    /// Fetch epoch: advanced when the active conversation changes or the
    /// session ends. Fetch results tagged with an older epoch are
    /// discarded instead of applied.
    epoch: AtomicU64,
    ended: AtomicBool,
    conn_shutdown: Arc<watch::Sender<bool>>,
}

impl<A: PersistenceApi> Shared<A> {
    pub(crate) fn emit(&self, event: ChatEvent) {
        let _ = self.events.try_send(event);
    }

    pub(crate) fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn epoch_is(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    pub(crate) fn advance_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Tears the whole chat session down: connection closed, timers
    /// cancelled, every store entity cleared. Terminal and idempotent.
    pub(crate) fn end_session(&self, reason: &str) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(reason, "tearing down chat session");
        let _ = self.conn_shutdown.send(true);
        self.typing.cancel_all();
        self.advance_epoch();
        self.store.lock().clear_all();
        self.roster.lock().clear();
        self.emit(ChatEvent::SessionEnded {
            reason: reason.to_string(),
        });
    }

    /// Routes API failures into the error taxonomy: auth expiry is fatal
    /// to the session, everything else is the caller's business.
    pub(crate) fn handle_api_error(&self, err: &ApiError) {
        if err.is_auth_expired() {
            self.end_session("authentication expired");
        }
    }
}

/// The chat client: one instance per authenticated session.
///
/// Construct with [`ChatClient::connect`]; drop or [`shutdown`]
/// (`ChatClient::shutdown`) to tear the session down. Dropping cancels
/// the connection supervisor (including any pending backoff timer) and
/// all typing timers.
pub struct ChatClient<A: PersistenceApi> {
    shared: Arc<Shared<A>>,
    conn: ConnectionHandle,
    pump: JoinHandle<()>,
}

impl<A: PersistenceApi> ChatClient<A> {
    /// Builds the client and starts connecting to the event channel at
    /// `ws_url`. Must be called within a tokio runtime.
    ///
    /// Returns the client and the receiver for its [`ChatEvent`] stream.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectSetupError`] if the event-channel URL is invalid.
    /// Connect failures after that are reported through events and
    /// retried with backoff.
    pub fn connect(
        api: A,
        identity: Identity,
        ws_url: impl Into<String>,
        config: ChatConfig,
    ) -> Result<(Self, mpsc::Receiver<ChatEvent>), ConnectSetupError> {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer);

        let conn_config = ConnectionConfig {
            ws_url: ws_url.into(),
            connect_timeout: config.connect_timeout,
            reconnect: config.reconnect.clone(),
            frame_buffer: config.frame_buffer,
        };
        let (conn, link_rx) = connection::spawn(conn_config, identity.clone())?;

        let store = Arc::new(Mutex::new(ChatStore::new(identity.user_id.clone())));
        let typing = TypingCoordinator::new(
            config.typing_idle,
            config.typing_expiry,
            Arc::clone(&store),
            events_tx.clone(),
            conn.outbound(),
        );

        let shared = Arc::new(Shared {
            api,
            identity,
            store,
            roster: Mutex::new(Roster::new()),
            typing,
            events: events_tx,
            outbound: conn.outbound(),
            config,
            epoch: AtomicU64::new(0),
            ended: AtomicBool::new(false),
            conn_shutdown: conn.shutdown_signal(),
        });

        let pump = tokio::spawn(pump_link_events(Arc::clone(&shared), link_rx));

        Ok((
            Self { shared, conn, pump },
            events_rx,
        ))
    }

    /// Opens the conversation with `peer`: marks it read, loads the
    /// newest history page, and makes it the target of sends and typing.
    ///
    /// The fetches run in the background; a stale response from a
    /// previously open conversation can no longer overwrite this one
    /// (fetch results are epoch-checked).
    pub fn open_conversation(&self, peer: UserId) {
        self.shared.advance_epoch();
        self.shared.store.lock().set_active(peer.clone());
        self.shared.emit(ChatEvent::ConversationsUpdated);

        let epoch = self.shared.current_epoch();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if let Err(err) = shared.api.mark_read(&peer).await {
                shared.handle_api_error(&err);
                tracing::warn!(peer = %peer, error = %err, "mark-read failed");
            }
            reconcile::load_active_history(&shared, &peer, epoch).await;
        });
    }

    /// Closes the active conversation.
    pub fn close_conversation(&self) {
        self.shared.advance_epoch();
        self.shared.typing.reset_local(
            &self.shared.identity.user_id,
            &self.shared.identity.display_name,
        );
        self.shared.store.lock().clear_active();
        self.shared.emit(ChatEvent::ConversationsUpdated);
    }

    /// Notes a local composer input change, driving the typing indicator
    /// debounce. A no-op without an active conversation or connection.
    pub fn note_local_input(&self) {
        if !self.conn.is_connected() {
            return;
        }
        let Some(peer) = self.shared.store.lock().active().cloned() else {
            return;
        };
        self.shared.typing.note_local_input(
            peer,
            self.shared.identity.user_id.clone(),
            self.shared.identity.display_name.clone(),
        );
    }

    /// Runs a full reconciliation sweep on demand.
    pub async fn reconcile(&self) {
        reconcile::run_sweep(&self.shared).await;
    }

    /// Deletes a persisted message on the server and locally.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] from the delete call; the local log is
    /// only touched on success.
    pub async fn delete_message(&self, id: u64) -> Result<(), ApiError> {
        match self.shared.api.delete_message(id).await {
            Ok(()) => {
                self.shared.store.lock().remove_persisted(id);
                self.shared.emit(ChatEvent::ConversationsUpdated);
                Ok(())
            }
            Err(err) => {
                self.shared.handle_api_error(&err);
                Err(err)
            }
        }
    }

    /// Fetches the directory of support staff.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] from the directory call.
    pub async fn support_directory(&self) -> Result<Vec<PeerProfile>, ApiError> {
        let result = self.shared.api.fetch_support_directory().await;
        if let Err(ref err) = result {
            self.shared.handle_api_error(err);
        }
        result
    }

    /// Cloned view of the store.
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        self.shared.store.lock().snapshot()
    }

    /// Current event-channel state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Whether the given peer is currently online.
    #[must_use]
    pub fn is_peer_online(&self, peer: &UserId) -> bool {
        self.shared.roster.lock().is_online(peer)
    }

    /// Whether at least one support staff member is online.
    #[must_use]
    pub fn support_online(&self) -> bool {
        self.shared.roster.lock().support_online()
    }

    /// Snapshot of the presence roster.
    #[must_use]
    pub fn roster(&self) -> Vec<PresenceEntry> {
        self.shared.roster.lock().entries()
    }

    /// The local identity this client announced.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    /// Tears the session down: closes the connection, cancels every
    /// timer, clears the store. Terminal.
    pub fn shutdown(&self) {
        self.shared.end_session("client shutdown");
    }
}

impl<A: PersistenceApi> Drop for ChatClient<A> {
    fn drop(&mut self) {
        self.shared.typing.cancel_all();
        self.pump.abort();
        // `conn` aborts its supervisor (and any pending backoff timer)
        // in its own Drop.
    }
}

/// Forwards supervisor events into store mutations and UI events.
async fn pump_link_events<A: PersistenceApi>(
    shared: Arc<Shared<A>>,
    mut link_rx: mpsc::Receiver<LinkEvent>,
) {
    while let Some(event) = link_rx.recv().await {
        match event {
            LinkEvent::Up { attempt } => {
                if attempt > 0 {
                    tracing::info!(attempt, "reconnected, running reconciliation sweep");
                }
                shared.emit(ChatEvent::ConnectionStatus { connected: true });
                let sweep_shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    reconcile::run_sweep(&sweep_shared).await;
                });
            }
            LinkEvent::Frame(frame) => handle_frame(&shared, frame),
            LinkEvent::Down { reason } => {
                tracing::warn!(reason = %reason, "event channel down");
                shared.emit(ChatEvent::ConnectionStatus { connected: false });
            }
            LinkEvent::ConnectFailed { reason } => {
                shared.emit(ChatEvent::Error(format!("connect attempt failed: {reason}")));
            }
            LinkEvent::Reconnecting {
                attempt,
                max_attempts,
            } => {
                shared.emit(ChatEvent::Reconnecting {
                    attempt,
                    max_attempts,
                });
            }
            LinkEvent::Failed => {
                shared.emit(ChatEvent::ReconnectFailed);
            }
        }
    }
}

/// Dispatches one inbound frame. The full set of frame handlers lives
/// here, registered once for the lifetime of the client.
fn handle_frame<A: PersistenceApi>(shared: &Arc<Shared<A>>, frame: ServerFrame) {
    match frame {
        ServerFrame::RosterFull(entries) => {
            let (changed, online) = {
                let mut roster = shared.roster.lock();
                let changed = roster.replace(entries);
                (changed, roster.support_online())
            };
            if changed {
                shared.emit(ChatEvent::SupportOnlineChanged(online));
            }
        }
        ServerFrame::PeerOnline(entry) => {
            let user_id = entry.user_id.clone();
            let (changed, online) = {
                let mut roster = shared.roster.lock();
                let changed = roster.upsert(entry);
                (changed, roster.support_online())
            };
            shared.emit(ChatEvent::PresenceChanged {
                user_id,
                is_online: true,
            });
            if changed {
                shared.emit(ChatEvent::SupportOnlineChanged(online));
            }
        }
        ServerFrame::PeerOffline { user_id } => {
            let (changed, online) = {
                let mut roster = shared.roster.lock();
                let changed = roster.remove(&user_id);
                (changed, roster.support_online())
            };
            shared.emit(ChatEvent::PresenceChanged {
                user_id,
                is_online: false,
            });
            if changed {
                shared.emit(ChatEvent::SupportOnlineChanged(online));
            }
        }
        ServerFrame::Typing {
            sender_id,
            sender_name,
            is_typing,
        } => {
            shared
                .typing
                .observe_remote(sender_id, sender_name, is_typing);
        }
        ServerFrame::MessageRelayed(relayed) => {
            let profile = PeerProfile {
                user_id: relayed.sender_id.clone(),
                display_name: relayed.sender_name.clone(),
                role: relayed.sender_role,
            };
            receive::ingest(shared, relayed.into_message(), Some(profile));
        }
        ServerFrame::MessageDelivered(mut message) => {
            message.delivery = DeliveryState::Confirmed;
            receive::ingest(shared, message, None);
        }
    }
}
