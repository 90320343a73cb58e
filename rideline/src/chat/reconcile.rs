//! Reconciliation sweep: the single place that corrects state drift.
//!
//! After every successful (re)connect, and on demand, the sweep
//! re-fetches conversation summaries, the unread total, and the active
//! conversation's newest history page, overwriting the corresponding
//! store slices instead of merging.
//!
//! Every fetch is tagged with the request epoch current when it was
//! issued; the epoch advances whenever the active conversation changes
//! or the session ends, and results with a stale epoch are discarded so
//! a slow response for a previously open conversation can never
//! overwrite a newer one's state.

use std::sync::Arc;

use rideline_proto::ids::UserId;

use crate::api::PersistenceApi;

use super::{ChatEvent, Shared};

/// Runs the full sweep: summaries, unread total, active history.
pub(crate) async fn run_sweep<A: PersistenceApi>(shared: &Arc<Shared<A>>) {
    if shared.is_ended() {
        return;
    }
    let epoch = shared.current_epoch();
    tracing::debug!(epoch, "reconciliation sweep starting");

    fetch_and_apply_summaries(shared, epoch).await;

    let active = shared.store.lock().active().cloned();
    if let Some(peer) = active {
        // The open conversation is on screen; re-assert its read state so
        // the server's counters match the local zero before summaries are
        // trusted again.
        if let Err(err) = shared.api.mark_read(&peer).await {
            shared.handle_api_error(&err);
            tracing::warn!(peer = %peer, error = %err, "mark-read during sweep failed");
        }
        load_active_history(shared, &peer, epoch).await;
    }
}

/// Refreshes summaries and the unread total (the lightweight half of the
/// sweep, also run after every send/receive).
pub(crate) async fn refresh_summaries<A: PersistenceApi>(shared: &Arc<Shared<A>>) {
    if shared.is_ended() {
        return;
    }
    let epoch = shared.current_epoch();
    fetch_and_apply_summaries(shared, epoch).await;
}

async fn fetch_and_apply_summaries<A: PersistenceApi>(shared: &Arc<Shared<A>>, epoch: u64) {
    match shared.api.fetch_summaries().await {
        Ok(summaries) => {
            let applied = {
                let mut store = shared.store.lock();
                if shared.epoch_is(epoch) {
                    store.apply_summaries(summaries);
                    true
                } else {
                    false
                }
            };
            if applied {
                shared.emit(ChatEvent::ConversationsUpdated);
            } else {
                tracing::debug!(epoch, "stale summaries fetch discarded");
            }
        }
        Err(err) => {
            shared.handle_api_error(&err);
            tracing::warn!(error = %err, "summaries fetch failed");
        }
    }

    match shared.api.fetch_unread_total().await {
        Ok(total) => {
            let mut store = shared.store.lock();
            // With a conversation open, the summaries-derived total (with
            // the active conversation zeroed) is the consistent one; the
            // raw server total may still include not-yet-marked reads.
            if shared.epoch_is(epoch) && store.active().is_none() {
                store.set_unread_total(total);
            }
        }
        Err(err) => {
            shared.handle_api_error(&err);
            tracing::warn!(error = %err, "unread total fetch failed");
        }
    }
}

/// Fetches the newest history page for `peer` and overwrites the active
/// log, unless the fetch has gone stale (epoch advanced or the active
/// conversation changed while it was in flight).
pub(crate) async fn load_active_history<A: PersistenceApi>(
    shared: &Arc<Shared<A>>,
    peer: &UserId,
    epoch: u64,
) {
    if shared.is_ended() {
        return;
    }
    match shared
        .api
        .fetch_history(peer, 0, shared.config.history_page_size)
        .await
    {
        Ok(page) => {
            let applied = {
                let mut store = shared.store.lock();
                if shared.epoch_is(epoch) && store.active() == Some(peer) {
                    store.replace_log(page.messages);
                    true
                } else {
                    false
                }
            };
            if applied {
                shared.emit(ChatEvent::HistoryRefreshed {
                    conversation: peer.clone(),
                });
            } else {
                tracing::debug!(peer = %peer, epoch, "stale history fetch discarded");
            }
        }
        Err(err) => {
            shared.handle_api_error(&err);
            shared.emit(ChatEvent::Error(format!(
                "history fetch for {peer} failed: {err}"
            )));
        }
    }
}
