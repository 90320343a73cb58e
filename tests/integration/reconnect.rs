// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items,
    clippy::future_not_send,
    clippy::redundant_pub_crate
)]

//! Reconnection scenarios: backoff, attempt exhaustion, identity
//! re-announcement, and reconciliation after an outage.
//!
//! ## Disconnect simulation
//!
//! Aborting the server's accept task does not close established
//! WebSocket connections (they live on independently-spawned tasks), so
//! a **TCP proxy** sits between the client and the real server. Killing
//! the proxy aborts every proxied connection task, which drops both
//! `TcpStream`s and surfaces as an immediate disconnect on the client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rideline::api::HttpApi;
use rideline::chat::{ChatClient, ChatEvent, Identity};
use rideline::config::{ChatConfig, ReconnectConfig};
use rideline::connection::ConnectionState;
use rideline_proto::ids::{Role, UserId};
use rideline_server::http::start_server_with_state;
use rideline_server::state::ServerState;
use tokio::sync::mpsc;

// =============================================================================
// TCP proxy helper
// =============================================================================

/// Forwards traffic between a client-facing port and the real server.
/// `kill()` aborts all tracked connection tasks, tearing down both ends
/// of every proxied TCP connection.
struct TcpProxy {
    client_addr: String,
    accept_handle: tokio::task::JoinHandle<()>,
    conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TcpProxy {
    async fn new(proxy_port: u16, backend_addr: &str) -> Self {
        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{proxy_port}"))
            .await
            .unwrap_or_else(|e| panic!("proxy: failed to bind port {proxy_port}: {e}"));
        let bound_addr = listener.local_addr().unwrap();
        let client_addr = format!("127.0.0.1:{}", bound_addr.port());
        let backend = backend_addr.to_string();
        let conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let conn_handles_clone = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            loop {
                let (mut client_stream, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => break,
                };
                let backend = backend.clone();
                let conn_handle = tokio::spawn(async move {
                    let Ok(mut backend_stream) = tokio::net::TcpStream::connect(&backend).await
                    else {
                        return;
                    };
                    // When this task is aborted both streams drop,
                    // causing RST on both ends.
                    let _ = tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream)
                        .await;
                });
                conn_handles_clone.lock().push(conn_handle);
            }
        });

        Self {
            client_addr,
            accept_handle,
            conn_handles,
        }
    }

    fn kill(self) {
        self.accept_handle.abort();
        for handle in self.conn_handles.lock().iter() {
            handle.abort();
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn find_free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind port 0");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn start_server() -> (std::net::SocketAddr, Arc<ServerState>) {
    let state = Arc::new(ServerState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start test server");
    (addr, state)
}

fn reconnect_config(max_attempts: u32) -> ChatConfig {
    ChatConfig {
        connect_timeout: Duration::from_secs(2),
        api_timeout: Duration::from_secs(5),
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts,
        },
        ..ChatConfig::default()
    }
}

/// Connects a client whose WebSocket goes through `ws_host` while the
/// persistence API talks to `api_addr` directly.
fn build_client(
    ws_host: &str,
    api_addr: std::net::SocketAddr,
    user: &str,
    config: ChatConfig,
) -> (ChatClient<HttpApi>, mpsc::Receiver<ChatEvent>) {
    let api = HttpApi::new(
        format!("http://{api_addr}"),
        UserId::new(user),
        Duration::from_secs(5),
    )
    .expect("failed to build api client");
    let identity = Identity {
        user_id: UserId::new(user),
        display_name: user.to_uppercase(),
        role: Role::Customer,
    };
    ChatClient::connect(api, identity, format!("ws://{ws_host}/ws"), config)
        .expect("failed to build client")
}

async fn wait_for_event<F>(
    rx: &mut mpsc::Receiver<ChatEvent>,
    timeout: Duration,
    description: &str,
    pred: F,
) -> ChatEvent
where
    F: Fn(&ChatEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline - tokio::time::Instant::now();
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(event)) if pred(&event) => return event,
            Ok(Some(_other)) => continue,
            Ok(None) => panic!("event channel closed while waiting for {description}"),
            Err(_) => break,
        }
    }
    panic!("timeout waiting for {description}");
}

async fn wait_for_connected(rx: &mut mpsc::Receiver<ChatEvent>) {
    wait_for_event(rx, Duration::from_secs(15), "connected", |e| {
        matches!(e, ChatEvent::ConnectionStatus { connected: true })
    })
    .await;
}

async fn wait_for_disconnected(rx: &mut mpsc::Receiver<ChatEvent>) {
    wait_for_event(rx, Duration::from_secs(10), "disconnected", |e| {
        matches!(e, ChatEvent::ConnectionStatus { connected: false })
    })
    .await;
}

// =============================================================================
// Test 1: reconnect heals missed state
// =============================================================================

/// While alice is partitioned, bob persists a message. After alice
/// reconnects, her identity is re-announced and the reconciliation
/// sweep restores the active conversation's log to what a fresh fetch
/// returns.
#[tokio::test]
async fn reconnect_reannounces_and_heals_missed_messages() {
    let (server_addr, _state) = start_server().await;

    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &server_addr.to_string()).await;
    let proxy_host = proxy.client_addr.clone();

    let (alice, mut alice_events) =
        build_client(&proxy_host, server_addr, "alice", reconnect_config(10));
    wait_for_connected(&mut alice_events).await;

    // Bob connects directly (no proxy).
    let (bob, mut bob_events) = build_client(
        &server_addr.to_string(),
        server_addr,
        "bob",
        reconnect_config(10),
    );
    wait_for_connected(&mut bob_events).await;

    alice.open_conversation(UserId::new("bob"));
    bob.open_conversation(UserId::new("alice"));
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Partition alice.
    proxy.kill();
    wait_for_disconnected(&mut alice_events).await;

    // Bob's message is persisted while alice cannot hear about it.
    bob.send_message("sent during the outage".into())
        .await
        .expect("bob send failed");

    // Heal the network on the same port.
    let _proxy2 = TcpProxy::new(proxy_port, &server_addr.to_string()).await;
    wait_for_connected(&mut alice_events).await;

    // Re-announcement makes alice visible to bob again.
    wait_for_event(
        &mut bob_events,
        Duration::from_secs(10),
        "alice back online",
        |e| {
            matches!(e, ChatEvent::PresenceChanged { user_id, is_online: true }
                if *user_id == UserId::new("alice"))
        },
    )
    .await;

    // The sweep overwrote alice's log with the authoritative history.
    wait_for_event(
        &mut alice_events,
        Duration::from_secs(10),
        "history refreshed",
        |e| matches!(e, ChatEvent::HistoryRefreshed { .. }),
    )
    .await;
    let log = alice.snapshot().log;
    assert_eq!(log.len(), 1, "missed message must appear after the sweep");
    assert_eq!(log[0].body, "sent during the outage");
}

// =============================================================================
// Test 2: backoff growth and terminal exhaustion
// =============================================================================

#[tokio::test]
async fn backoff_grows_and_exhaustion_is_terminal() {
    let (server_addr, _state) = start_server().await;

    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &server_addr.to_string()).await;
    let proxy_host = proxy.client_addr.clone();

    let (alice, mut alice_events) =
        build_client(&proxy_host, server_addr, "alice", reconnect_config(3));
    wait_for_connected(&mut alice_events).await;

    // Sever the network and never restore it.
    proxy.kill();
    wait_for_disconnected(&mut alice_events).await;

    // Collect all three scheduled attempts and their arrival times.
    let mut instants = Vec::new();
    for expected in 1..=3u32 {
        let event = wait_for_event(
            &mut alice_events,
            Duration::from_secs(10),
            &format!("reconnect attempt {expected}"),
            |e| matches!(e, ChatEvent::Reconnecting { .. }),
        )
        .await;
        instants.push(Instant::now());
        match event {
            ChatEvent::Reconnecting {
                attempt,
                max_attempts,
            } => {
                assert_eq!(attempt, expected);
                assert_eq!(max_attempts, 3);
            }
            _ => unreachable!(),
        }
    }

    // Delay doubling: gap 2→3 must exceed gap 1→2 (100 ms then 200 ms,
    // with generous slack for scheduling).
    if instants.len() == 3 {
        let gap_1_2 = instants[1] - instants[0];
        let gap_2_3 = instants[2] - instants[1];
        assert!(
            gap_2_3 > gap_1_2,
            "expected growing backoff, got {gap_1_2:?} then {gap_2_3:?}"
        );
    }

    // Exhaustion is reported once and is terminal.
    wait_for_event(
        &mut alice_events,
        Duration::from_secs(10),
        "reconnect failed",
        |e| matches!(e, ChatEvent::ReconnectFailed),
    )
    .await;

    // No further automatic attempt: the event stream stays silent.
    let silence = tokio::time::timeout(Duration::from_millis(800), alice_events.recv()).await;
    assert!(
        silence.is_err(),
        "no events expected after exhaustion, got {silence:?}"
    );
    assert_eq!(alice.connection_state(), ConnectionState::Disconnected);
}

// =============================================================================
// Test 3: manual sweep equals fresh fetch
// =============================================================================

/// A manual reconciliation sweep is idempotent: running it twice in a
/// row leaves the same state as a single run.
#[tokio::test]
async fn manual_sweep_is_idempotent() {
    let (server_addr, _state) = start_server().await;

    let (alice, mut alice_events) = build_client(
        &server_addr.to_string(),
        server_addr,
        "alice",
        reconnect_config(5),
    );
    wait_for_connected(&mut alice_events).await;
    let (bob, mut bob_events) = build_client(
        &server_addr.to_string(),
        server_addr,
        "bob",
        reconnect_config(5),
    );
    wait_for_connected(&mut bob_events).await;

    alice.open_conversation(UserId::new("bob"));
    bob.open_conversation(UserId::new("alice"));
    tokio::time::sleep(Duration::from_millis(150)).await;

    alice.send_message("one".into()).await.unwrap();
    bob.send_message("two".into()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    alice.reconcile().await;
    let first = alice.snapshot();
    alice.reconcile().await;
    let second = alice.snapshot();

    let first_ids: Vec<_> = first.log.iter().map(|m| m.id.clone()).collect();
    let second_ids: Vec<_> = second.log.iter().map(|m| m.id.clone()).collect();
    assert_eq!(first_ids, second_ids);
    assert_eq!(first.log.len(), 2);
    assert_eq!(first.unread_total, second.unread_total);
}
