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

//! Presence roster and typing indicator scenarios: roster on connect,
//! deltas, the support-online aggregate, and the defensive typing
//! expiry.

use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use rideline::api::HttpApi;
use rideline::chat::{ChatClient, ChatEvent, Identity};
use rideline::config::{ChatConfig, ReconnectConfig};
use rideline_proto::codec;
use rideline_proto::event::ClientFrame;
use rideline_proto::ids::{Role, UserId};
use rideline_server::http::start_server_with_state;
use rideline_server::state::ServerState;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

// =============================================================================
// Helpers
// =============================================================================

fn test_config() -> ChatConfig {
    ChatConfig {
        typing_idle: Duration::from_millis(150),
        typing_expiry: Duration::from_millis(400),
        connect_timeout: Duration::from_secs(5),
        api_timeout: Duration::from_secs(5),
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        },
        ..ChatConfig::default()
    }
}

async fn start_server() -> (std::net::SocketAddr, Arc<ServerState>) {
    let state = Arc::new(ServerState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start test server");
    (addr, state)
}

async fn connect_client(
    addr: std::net::SocketAddr,
    user: &str,
    role: Role,
) -> (ChatClient<HttpApi>, mpsc::Receiver<ChatEvent>) {
    let api = HttpApi::new(
        format!("http://{addr}"),
        UserId::new(user),
        Duration::from_secs(5),
    )
    .expect("failed to build api client");
    let identity = Identity {
        user_id: UserId::new(user),
        display_name: user.to_uppercase(),
        role,
    };
    let (client, mut events) =
        ChatClient::connect(api, identity, format!("ws://{addr}/ws"), test_config())
            .expect("failed to build client");

    wait_for_event(&mut events, Duration::from_secs(10), "connected", |e| {
        matches!(e, ChatEvent::ConnectionStatus { connected: true })
    })
    .await;

    (client, events)
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

/// A bare WebSocket peer that announces but is otherwise script-driven,
/// for exercising paths a well-behaved client never takes.
async fn raw_peer(
    addr: std::net::SocketAddr,
    user: &str,
    role: Role,
) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    let announce = ClientFrame::Announce {
        user_id: UserId::new(user),
        display_name: user.to_uppercase(),
        role,
    };
    let bytes = codec::encode_client(&announce).unwrap();
    ws.send(tungstenite::Message::Binary(bytes.into()))
        .await
        .unwrap();
    ws
}

// =============================================================================
// Presence
// =============================================================================

#[tokio::test]
async fn roster_reflects_connected_peers() {
    let (addr, _state) = start_server().await;
    let (alice, _alice_events) = connect_client(addr, "alice", Role::Customer).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    // The initial roster pull includes alice herself.
    assert!(alice.is_peer_online(&UserId::new("alice")));
    assert!(!alice.is_peer_online(&UserId::new("bob")));
}

#[tokio::test]
async fn support_agent_connecting_flips_aggregate() {
    let (addr, _state) = start_server().await;
    let (alice, mut alice_events) = connect_client(addr, "alice", Role::Customer).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!alice.support_online());

    let (_agent, _agent_events) = connect_client(addr, "agent-7", Role::Support).await;

    let event = wait_for_event(
        &mut alice_events,
        Duration::from_secs(5),
        "support online",
        |e| matches!(e, ChatEvent::SupportOnlineChanged(true)),
    )
    .await;
    assert_eq!(event, ChatEvent::SupportOnlineChanged(true));
    assert!(alice.support_online());
    assert!(alice.is_peer_online(&UserId::new("agent-7")));
}

#[tokio::test]
async fn support_agent_disconnecting_clears_aggregate() {
    let (addr, _state) = start_server().await;
    let (alice, mut alice_events) = connect_client(addr, "alice", Role::Customer).await;

    let (agent, _agent_events) = connect_client(addr, "agent-7", Role::Support).await;
    wait_for_event(
        &mut alice_events,
        Duration::from_secs(5),
        "support online",
        |e| matches!(e, ChatEvent::SupportOnlineChanged(true)),
    )
    .await;

    agent.shutdown();
    drop(agent);

    wait_for_event(
        &mut alice_events,
        Duration::from_secs(5),
        "support offline",
        |e| matches!(e, ChatEvent::SupportOnlineChanged(false)),
    )
    .await;
    assert!(!alice.support_online());
    assert!(!alice.is_peer_online(&UserId::new("agent-7")));
}

#[tokio::test]
async fn support_directory_lists_known_agents() {
    let (addr, _state) = start_server().await;
    let (alice, _alice_events) = connect_client(addr, "alice", Role::Customer).await;
    let (_agent, _agent_events) = connect_client(addr, "agent-7", Role::Support).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let directory = alice.support_directory().await.expect("directory fetch");
    assert_eq!(directory.len(), 1);
    assert_eq!(directory[0].user_id, UserId::new("agent-7"));
    assert_eq!(directory[0].role, Role::Support);
}

// =============================================================================
// Typing indicators
// =============================================================================

#[tokio::test]
async fn typing_indicator_round_trip_with_debounced_stop() {
    let (addr, _state) = start_server().await;
    let (alice, mut alice_events) = connect_client(addr, "alice", Role::Customer).await;
    let (bob, _bob_events) = connect_client(addr, "bob", Role::Customer).await;

    bob.open_conversation(UserId::new("alice"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    bob.note_local_input();

    let event = wait_for_event(
        &mut alice_events,
        Duration::from_secs(5),
        "typing true",
        |e| matches!(e, ChatEvent::TypingChanged { is_typing: true, .. }),
    )
    .await;
    match event {
        ChatEvent::TypingChanged { user_id, .. } => assert_eq!(user_id, UserId::new("bob")),
        _ => unreachable!(),
    }
    assert!(!alice.snapshot().typing.is_empty());

    // Bob goes idle; his client emits the stop signal after the idle
    // window and alice's indicator clears.
    wait_for_event(
        &mut alice_events,
        Duration::from_secs(5),
        "typing false",
        |e| matches!(e, ChatEvent::TypingChanged { is_typing: false, .. }),
    )
    .await;
    assert!(alice.snapshot().typing.is_empty());
}

#[tokio::test]
async fn typing_indicator_expires_when_stop_signal_is_lost() {
    let (addr, _state) = start_server().await;
    let (alice, mut alice_events) = connect_client(addr, "alice", Role::Customer).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A misbehaving peer that sends `typing: true` and never stops.
    let mut ghost = raw_peer(addr, "ghost", Role::Customer).await;
    let typing = ClientFrame::Typing {
        receiver_id: UserId::new("alice"),
        sender_id: UserId::new("ghost"),
        sender_name: "GHOST".into(),
        is_typing: true,
    };
    let bytes = codec::encode_client(&typing).unwrap();
    ghost
        .send(tungstenite::Message::Binary(bytes.into()))
        .await
        .unwrap();

    wait_for_event(
        &mut alice_events,
        Duration::from_secs(5),
        "typing true",
        |e| matches!(e, ChatEvent::TypingChanged { is_typing: true, .. }),
    )
    .await;
    assert!(!alice.snapshot().typing.is_empty());

    // No stop signal ever arrives; the defensive ceiling clears it.
    wait_for_event(
        &mut alice_events,
        Duration::from_secs(5),
        "typing expiry",
        |e| matches!(e, ChatEvent::TypingChanged { is_typing: false, .. }),
    )
    .await;
    assert!(alice.snapshot().typing.is_empty());
}

#[tokio::test]
async fn refreshed_typing_indicator_outlives_first_deadline() {
    let (addr, _state) = start_server().await;
    let (alice, mut alice_events) = connect_client(addr, "alice", Role::Customer).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut ghost = raw_peer(addr, "ghost", Role::Customer).await;
    let typing = ClientFrame::Typing {
        receiver_id: UserId::new("alice"),
        sender_id: UserId::new("ghost"),
        sender_name: "GHOST".into(),
        is_typing: true,
    };

    let bytes = codec::encode_client(&typing).unwrap();
    ghost
        .send(tungstenite::Message::Binary(bytes.clone().into()))
        .await
        .unwrap();
    wait_for_event(
        &mut alice_events,
        Duration::from_secs(5),
        "typing true",
        |e| matches!(e, ChatEvent::TypingChanged { is_typing: true, .. }),
    )
    .await;

    // Refresh at ~300 ms, inside the 400 ms expiry window.
    tokio::time::sleep(Duration::from_millis(300)).await;
    ghost
        .send(tungstenite::Message::Binary(bytes.into()))
        .await
        .unwrap();

    // At ~550 ms the original deadline has passed but the refreshed one
    // has not: the indicator must still be visible.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(
        !alice.snapshot().typing.is_empty(),
        "refresh must replace the expiry timer, not race it"
    );
}
