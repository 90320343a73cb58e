//! Typing state coordination.
//!
//! Local side: every input notification while a conversation is open
//! emits `typing: true` and (re)arms an idle timer; when it fires with no
//! further input, `typing: false` goes out. Remote side: observed
//! indicators live in a per-peer arena of cancellable expiry timers, so
//! an indicator self-clears within a bounded time even when the peer's
//! `typing: false` is lost. Inserting a timer for a peer that already has
//! one aborts the prior timer before replacing it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use rideline_proto::event::ClientFrame;
use rideline_proto::ids::UserId;

use crate::chat::ChatEvent;
use crate::store::ChatStore;

/// Local typing state: who the indicator was last sent to, and the idle
/// timer that will retract it.
struct LocalTyping {
    receiver: UserId,
    timer: JoinHandle<()>,
}

/// Debounces local typing emission and expires remote typing entries.
pub(crate) struct TypingCoordinator {
    idle: Duration,
    expiry: Duration,
    store: Arc<Mutex<ChatStore>>,
    events: mpsc::Sender<ChatEvent>,
    outbound: mpsc::Sender<ClientFrame>,
    local: Mutex<Option<LocalTyping>>,
    remote: Mutex<HashMap<UserId, JoinHandle<()>>>,
}

impl TypingCoordinator {
    pub(crate) fn new(
        idle: Duration,
        expiry: Duration,
        store: Arc<Mutex<ChatStore>>,
        events: mpsc::Sender<ChatEvent>,
        outbound: mpsc::Sender<ClientFrame>,
    ) -> Arc<Self> {
        Arc::new(Self {
            idle,
            expiry,
            store,
            events,
            outbound,
            local: Mutex::new(None),
            remote: Mutex::new(HashMap::new()),
        })
    }

    /// Notes a local input change while the conversation with `receiver`
    /// is open: emits `typing: true` on the first input of a burst and
    /// (re)arms the idle timer that will emit `typing: false`.
    pub(crate) fn note_local_input(
        self: &Arc<Self>,
        receiver: UserId,
        sender_id: UserId,
        sender_name: String,
    ) {
        let mut guard = self.local.lock();
        let was_typing_to_same = guard.as_ref().is_some_and(|l| l.receiver == receiver);
        if let Some(prev) = guard.take() {
            prev.timer.abort();
            if prev.receiver != receiver {
                self.send_typing(prev.receiver, sender_id.clone(), sender_name.clone(), false);
            }
        }
        if !was_typing_to_same {
            self.send_typing(receiver.clone(), sender_id.clone(), sender_name.clone(), true);
        }

        let this = Arc::clone(self);
        let idle_receiver = receiver.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(this.idle).await;
            this.finish_local(&idle_receiver, sender_id, sender_name);
        });
        *guard = Some(LocalTyping { receiver, timer });
    }

    /// Retracts the local typing indicator immediately (conversation
    /// switch or teardown path).
    pub(crate) fn reset_local(&self, sender_id: &UserId, sender_name: &str) {
        let prev = self.local.lock().take();
        if let Some(prev) = prev {
            prev.timer.abort();
            self.send_typing(
                prev.receiver,
                sender_id.clone(),
                sender_name.to_string(),
                false,
            );
        }
    }

    /// Applies a remotely observed typing change for `peer`.
    ///
    /// `typing: true` inserts/refreshes the entry and arms the defensive
    /// expiry; `typing: false` removes it immediately.
    pub(crate) fn observe_remote(
        self: &Arc<Self>,
        peer: UserId,
        display_name: String,
        is_typing: bool,
    ) {
        if is_typing {
            let changed = self
                .store
                .lock()
                .set_typing(peer.clone(), display_name.clone());
            if changed {
                self.emit(ChatEvent::TypingChanged {
                    user_id: peer.clone(),
                    display_name: display_name.clone(),
                    is_typing: true,
                });
            }
            let this = Arc::clone(self);
            let expire_peer = peer.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(this.expiry).await;
                this.expire_remote(&expire_peer);
            });
            if let Some(old) = self.remote.lock().insert(peer, timer) {
                old.abort();
            }
        } else {
            if let Some(timer) = self.remote.lock().remove(&peer) {
                timer.abort();
            }
            if self.store.lock().remove_typing(&peer).is_some() {
                self.emit(ChatEvent::TypingChanged {
                    user_id: peer,
                    display_name,
                    is_typing: false,
                });
            }
        }
    }

    /// Aborts every timer (session teardown). Emits nothing.
    pub(crate) fn cancel_all(&self) {
        if let Some(local) = self.local.lock().take() {
            local.timer.abort();
        }
        for (_, timer) in self.remote.lock().drain() {
            timer.abort();
        }
    }

    fn finish_local(&self, receiver: &UserId, sender_id: UserId, sender_name: String) {
        let mut guard = self.local.lock();
        if guard.as_ref().is_some_and(|l| l.receiver == *receiver) {
            *guard = None;
            drop(guard);
            self.send_typing(receiver.clone(), sender_id, sender_name, false);
        }
    }

    fn expire_remote(&self, peer: &UserId) {
        self.remote.lock().remove(peer);
        let display_name = self.store.lock().remove_typing(peer);
        if let Some(display_name) = display_name {
            tracing::debug!(peer = %peer, "typing indicator expired without stop signal");
            self.emit(ChatEvent::TypingChanged {
                user_id: peer.clone(),
                display_name,
                is_typing: false,
            });
        }
    }

    fn send_typing(&self, receiver: UserId, sender_id: UserId, sender_name: String, is_typing: bool) {
        // Fire-and-forget: a dropped indicator is self-healing (the
        // receive side expires entries on its own).
        let frame = ClientFrame::Typing {
            receiver_id: receiver,
            sender_id,
            sender_name,
            is_typing,
        };
        if self.outbound.try_send(frame).is_err() {
            tracing::debug!("typing frame dropped, outbound channel full or closed");
        }
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.try_send(event);
    }
}
