//! Event-channel socket handling.
//!
//! Connection lifecycle:
//! 1. Wait for an `Announce` frame carrying the peer's identity.
//! 2. Register the session and broadcast `PeerOnline` to everyone else.
//! 3. Enter the frame loop: answer roster requests, forward typing and
//!    relay frames to their receivers.
//! 4. On disconnect, unregister (unless a newer session replaced this
//!    one) and broadcast `PeerOffline`.
//!
//! Forwarded typing/relay frames carry the *announced* identity of the
//! sending socket, never the identity claimed inside the frame.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use rideline_proto::codec;
use rideline_proto::event::{ClientFrame, ServerFrame};
use rideline_proto::ids::{Role, UserId};
use rideline_proto::presence::PresenceEntry;

use crate::state::ServerState;

/// The announced identity of a connected socket.
#[derive(Debug, Clone)]
struct Announced {
    user_id: String,
    display_name: String,
    role: Role,
}

/// Handles an upgraded WebSocket connection for a single peer.
pub async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(announced) = wait_for_announce(&mut ws_receiver).await else {
        tracing::warn!("connection closed before identity announcement");
        return;
    };
    tracing::info!(user_id = %announced.user_id, "peer announcing");

    let session_id = Uuid::now_v7().to_string();
    let entry = PresenceEntry {
        user_id: UserId::new(announced.user_id.as_str()),
        display_name: announced.display_name.clone(),
        role: announced.role,
        is_online: true,
        session_id: session_id.clone(),
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    if state.register(entry.clone(), tx).await {
        tracing::info!(user_id = %announced.user_id, "replaced existing session (reconnect)");
    }
    state
        .broadcast_except(&announced.user_id, &ServerFrame::PeerOnline(entry))
        .await;

    // Writer task: forwards frames from the channel to the socket.
    let writer_user = announced.user_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(user_id = %writer_user, "WebSocket write failed");
                break;
            }
        }
    });

    // Reader task: processes frames from this peer.
    let reader_state = Arc::clone(&state);
    let reader_announced = announced.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                WsMessage::Binary(data) => {
                    handle_client_frame(&reader_announced, &data, &reader_state).await;
                }
                WsMessage::Close(_) => {
                    tracing::info!(user_id = %reader_announced.user_id, "received close frame");
                    break;
                }
                _ => {
                    // Ignore text, ping, pong frames.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    // Only the session that still owns the registry slot announces the
    // departure; a reconnect that already replaced it must stay online.
    if state
        .unregister_session(&announced.user_id, &session_id)
        .await
    {
        state
            .broadcast_except(
                &announced.user_id,
                &ServerFrame::PeerOffline {
                    user_id: UserId::new(announced.user_id.as_str()),
                },
            )
            .await;
        tracing::info!(user_id = %announced.user_id, "peer disconnected");
    }
}

/// Waits for the first frame, expecting `Announce`.
async fn wait_for_announce(
    receiver: &mut (impl StreamExt<Item = Result<WsMessage, axum::Error>> + Unpin),
) -> Option<Announced> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            WsMessage::Binary(data) => match codec::decode_client(&data) {
                Ok(ClientFrame::Announce {
                    user_id,
                    display_name,
                    role,
                }) => {
                    if user_id.as_str().is_empty() {
                        tracing::warn!("received Announce with empty user id");
                        return None;
                    }
                    return Some(Announced {
                        user_id: user_id.as_str().to_string(),
                        display_name,
                        role,
                    });
                }
                Ok(other) => {
                    tracing::warn!(frame = ?other, "expected Announce, got different frame");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode announcement");
                    return None;
                }
            },
            WsMessage::Close(_) => return None,
            _ => {
                // Skip ping/pong frames during announcement.
            }
        }
    }
    None
}

/// Handles one binary frame from an announced peer.
async fn handle_client_frame(announced: &Announced, data: &[u8], state: &Arc<ServerState>) {
    let frame = match codec::decode_client(data) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(user_id = %announced.user_id, error = %e, "failed to decode frame");
            return;
        }
    };

    match frame {
        ClientFrame::RequestRoster => {
            let roster = state.roster().await;
            if !state
                .send_to(&announced.user_id, &ServerFrame::RosterFull(roster))
                .await
            {
                tracing::warn!(user_id = %announced.user_id, "roster reply failed");
            }
        }
        ClientFrame::Typing {
            receiver_id,
            sender_id: _,
            sender_name: _,
            is_typing,
        } => {
            // Identity enforcement: forward under the announced identity.
            let forward = ServerFrame::Typing {
                sender_id: UserId::new(announced.user_id.as_str()),
                sender_name: announced.display_name.clone(),
                is_typing,
            };
            state.send_to(receiver_id.as_str(), &forward).await;
        }
        ClientFrame::Relay(mut relayed) => {
            relayed.sender_id = UserId::new(announced.user_id.as_str());
            relayed.sender_name = announced.display_name.clone();
            relayed.sender_role = announced.role;
            let receiver = relayed.receiver_id.as_str().to_string();
            tracing::debug!(
                from = %announced.user_id,
                to = %receiver,
                "forwarding relayed message"
            );
            state
                .send_to(&receiver, &ServerFrame::MessageRelayed(relayed))
                .await;
        }
        ClientFrame::Announce { .. } => {
            tracing::warn!(
                user_id = %announced.user_id,
                "duplicate Announce from already-announced peer"
            );
        }
    }
}
