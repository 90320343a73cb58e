//! Event-channel connection management.
//!
//! A single supervisor task owns the WebSocket for its whole lifetime:
//! it connects, announces the local identity, requests the roster, pumps
//! frames in both directions, and on unexpected loss schedules bounded
//! doubling-backoff reconnects. Exhausting the attempt budget is
//! terminal; the supervisor reports a persistent failure and exits.
//!
//! Every exit path cancels the pending retry timer: the supervisor only
//! ever sleeps inside `select!` against the shutdown signal, and dropping
//! the [`ConnectionHandle`] aborts the task outright.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use rideline_proto::codec;
use rideline_proto::event::{ClientFrame, ServerFrame};

use crate::chat::Identity;
use crate::config::ReconnectConfig;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Lifecycle state of the event-channel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no automatic attempt scheduled.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// The channel is up and the identity has been announced.
    Connected,
    /// The channel was lost; a retry is scheduled.
    Reconnecting,
}

/// Events reported by the supervisor to the client pump.
#[derive(Debug)]
pub(crate) enum LinkEvent {
    /// The channel came up; identity announced, roster requested.
    /// `attempt` is 0 for the initial connect, otherwise the reconnect
    /// attempt that succeeded.
    Up { attempt: u32 },
    /// A decoded inbound frame.
    Frame(ServerFrame),
    /// The channel was lost after being up.
    Down { reason: String },
    /// A connect attempt failed.
    ConnectFailed { reason: String },
    /// A retry is scheduled.
    Reconnecting { attempt: u32, max_attempts: u32 },
    /// The attempt budget is exhausted; no further automatic attempt.
    Failed,
}

/// Static parameters for the supervisor.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionConfig {
    /// WebSocket URL of the event channel (`ws://…/ws`).
    pub ws_url: String,
    /// Timeout for each connect attempt.
    pub connect_timeout: Duration,
    /// Backoff behavior.
    pub reconnect: ReconnectConfig,
    /// Capacity of the outbound frame channel.
    pub frame_buffer: usize,
}

/// Errors detected before the supervisor is even spawned.
#[derive(Debug, thiserror::Error)]
pub enum ConnectSetupError {
    /// The event-channel URL does not parse.
    #[error("invalid event channel url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The URL scheme is not `ws` or `wss`.
    #[error("unsupported event channel scheme: {0}")]
    UnsupportedScheme(String),
}

/// Handle to a running connection supervisor.
///
/// Dropping the handle shuts the supervisor down and aborts the task,
/// which also cancels any pending backoff timer.
pub(crate) struct ConnectionHandle {
    outbound: mpsc::Sender<ClientFrame>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    /// Clone of the outbound frame sender.
    pub(crate) fn outbound(&self) -> mpsc::Sender<ClientFrame> {
        self.outbound.clone()
    }

    /// Current connection state.
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Whether the channel is currently up.
    pub(crate) fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Shared shutdown signal, for teardown paths that do not own the
    /// handle itself.
    pub(crate) fn shutdown_signal(&self) -> Arc<watch::Sender<bool>> {
        Arc::clone(&self.shutdown)
    }

    /// Requests a graceful shutdown. Terminal: the supervisor exits and
    /// schedules no further attempt.
    pub(crate) fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

/// Validates the URL and spawns the connection supervisor.
///
/// Returns the handle plus the receiver for [`LinkEvent`]s.
pub(crate) fn spawn(
    config: ConnectionConfig,
    identity: Identity,
) -> Result<(ConnectionHandle, mpsc::Receiver<LinkEvent>), ConnectSetupError> {
    let parsed = url::Url::parse(&config.ws_url)?;
    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        return Err(ConnectSetupError::UnsupportedScheme(
            parsed.scheme().to_string(),
        ));
    }

    let (outbound_tx, outbound_rx) = mpsc::channel(config.frame_buffer);
    let (link_tx, link_rx) = mpsc::channel(config.frame_buffer);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown = Arc::new(shutdown_tx);

    let task = tokio::spawn(supervise(
        config,
        identity,
        outbound_rx,
        link_tx,
        state_tx,
        shutdown_rx,
    ));

    Ok((
        ConnectionHandle {
            outbound: outbound_tx,
            state_rx,
            shutdown,
            task,
        },
        link_rx,
    ))
}

/// Doubles a backoff delay, bounded by `max`.
fn bounded_double(delay: Duration, max: Duration) -> Duration {
    (delay * 2).min(max)
}

/// The supervisor loop: connect, run the session, back off, repeat.
async fn supervise(
    config: ConnectionConfig,
    identity: Identity,
    mut outbound_rx: mpsc::Receiver<ClientFrame>,
    link_tx: mpsc::Sender<LinkEvent>,
    state_tx: watch::Sender<ConnectionState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    let mut delay = config.reconnect.initial_delay;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        if attempt > 0 {
            let _ = state_tx.send(ConnectionState::Reconnecting);
            let _ = link_tx
                .send(LinkEvent::Reconnecting {
                    attempt,
                    max_attempts: config.reconnect.max_attempts,
                })
                .await;
            let cancelled = tokio::select! {
                () = tokio::time::sleep(delay) => false,
                _ = shutdown_rx.changed() => true,
            };
            if cancelled {
                break;
            }
            delay = bounded_double(delay, config.reconnect.max_delay);
        }
        let _ = state_tx.send(ConnectionState::Connecting);

        match open_session(&config, &identity).await {
            Ok(ws) => {
                let _ = state_tx.send(ConnectionState::Connected);
                let _ = link_tx.send(LinkEvent::Up { attempt }).await;
                delay = config.reconnect.initial_delay;

                match run_session(ws, &mut outbound_rx, &link_tx, &mut shutdown_rx).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Lost(reason) => {
                        tracing::warn!(reason = %reason, "event channel lost");
                        let _ = link_tx.send(LinkEvent::Down { reason }).await;
                        attempt = 1;
                    }
                }
            }
            Err(reason) => {
                tracing::warn!(reason = %reason, attempt, "event channel connect failed");
                let _ = link_tx.send(LinkEvent::ConnectFailed { reason }).await;
                attempt += 1;
                if attempt > config.reconnect.max_attempts {
                    let _ = link_tx.send(LinkEvent::Failed).await;
                    break;
                }
            }
        }
    }

    let _ = state_tx.send(ConnectionState::Disconnected);
    tracing::info!("connection supervisor exiting");
}

/// Connects, announces the local identity, and requests the roster.
async fn open_session(config: &ConnectionConfig, identity: &Identity) -> Result<WsStream, String> {
    let (mut ws, _response) = tokio::time::timeout(
        config.connect_timeout,
        connect_async(config.ws_url.as_str()),
    )
    .await
    .map_err(|_| "connect timed out".to_string())?
    .map_err(|e| format!("connect failed: {e}"))?;

    let announce = ClientFrame::Announce {
        user_id: identity.user_id.clone(),
        display_name: identity.display_name.clone(),
        role: identity.role,
    };
    send_frame(&mut ws, &announce).await?;
    send_frame(&mut ws, &ClientFrame::RequestRoster).await?;
    Ok(ws)
}

async fn send_frame(ws: &mut WsStream, frame: &ClientFrame) -> Result<(), String> {
    let bytes = codec::encode_client(frame).map_err(|e| format!("encode failed: {e}"))?;
    ws.send(WsMessage::Binary(bytes.into()))
        .await
        .map_err(|e| format!("send failed: {e}"))
}

/// How a live session ended.
enum SessionEnd {
    /// Explicit teardown; the supervisor must exit.
    Shutdown,
    /// Unexpected loss; the supervisor schedules a reconnect.
    Lost(String),
}

/// Pumps frames in both directions until the session ends.
async fn run_session(
    ws: WsStream,
    outbound_rx: &mut mpsc::Receiver<ClientFrame>,
    link_tx: &mpsc::Sender<LinkEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                let _ = sink.close().await;
                return SessionEnd::Shutdown;
            }
            outbound = outbound_rx.recv() => {
                let Some(frame) = outbound else {
                    // All senders gone: the client is being torn down.
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                };
                match codec::encode_client(&frame) {
                    Ok(bytes) => {
                        if let Err(e) = sink.send(WsMessage::Binary(bytes.into())).await {
                            return SessionEnd::Lost(format!("send failed: {e}"));
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode outbound frame, dropping");
                    }
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Binary(data))) => match codec::decode_server(&data) {
                        Ok(frame) => {
                            if link_tx.send(LinkEvent::Frame(frame)).await.is_err() {
                                return SessionEnd::Shutdown;
                            }
                        }
                        Err(e) => {
                            // Malformed frame: log and skip, don't disconnect.
                            tracing::warn!(error = %e, "malformed server frame, skipping");
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) => {
                        return SessionEnd::Lost("closed by server".into());
                    }
                    Some(Ok(_)) => {
                        // Ignore ping/pong/text frames.
                    }
                    Some(Err(e)) => return SessionEnd::Lost(format!("receive failed: {e}")),
                    None => return SessionEnd::Lost("stream ended".into()),
                }
            }
        }
    }
}
