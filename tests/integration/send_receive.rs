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

//! End-to-end send/receive scenarios against the in-process server:
//! optimistic sends, dual-delivery deduplication, rollback on persist
//! failure, and unread counter behavior.

use std::sync::Arc;
use std::time::Duration;

use rideline::api::HttpApi;
use rideline::chat::{ChatClient, ChatEvent, Identity, SendError};
use rideline::config::{ChatConfig, ReconnectConfig};
use rideline_proto::ids::{MessageId, Role, UserId};
use rideline_proto::message::DeliveryState;
use rideline_server::http::start_server_with_state;
use rideline_server::state::ServerState;
use tokio::sync::mpsc;

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

/// Wait for an event matching `pred`, skipping non-matching events.
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

// =============================================================================
// Send pipeline
// =============================================================================

#[tokio::test]
async fn optimistic_send_confirms_and_peer_receives_exactly_once() {
    let (addr, _state) = start_server().await;
    let (alice, _alice_events) = connect_client(addr, "alice", Role::Customer).await;
    let (bob, mut bob_events) = connect_client(addr, "bob", Role::Customer).await;

    alice.open_conversation(UserId::new("bob"));
    bob.open_conversation(UserId::new("alice"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let id = alice
        .send_message("is the cargo van free on Saturday?".into())
        .await
        .expect("send failed");
    assert!(matches!(id, MessageId::Persisted(_)));

    // Bob sees the message through whichever path won the race.
    wait_for_event(&mut bob_events, Duration::from_secs(5), "message", |e| {
        matches!(e, ChatEvent::MessageReceived { message, .. }
            if message.body == "is the cargo van free on Saturday?")
    })
    .await;

    // Let the losing delivery path (relay vs. delivered push) land too.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let bob_snap = bob.snapshot();
    assert_eq!(
        bob_snap.log.len(),
        1,
        "dual delivery must be deduplicated: {:?}",
        bob_snap.log
    );

    let alice_snap = alice.snapshot();
    assert_eq!(alice_snap.log.len(), 1);
    assert_eq!(alice_snap.log[0].delivery, DeliveryState::Confirmed);
    assert!(matches!(alice_snap.log[0].id, MessageId::Persisted(_)));
}

#[tokio::test]
async fn whitespace_body_rejected_without_any_state_change() {
    let (addr, _state) = start_server().await;
    let (alice, _events) = connect_client(addr, "alice", Role::Customer).await;
    alice.open_conversation(UserId::new("bob"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = alice.send_message("   \t ".into()).await.unwrap_err();
    assert!(matches!(err, SendError::Validation(_)));
    assert!(alice.snapshot().log.is_empty());
}

#[tokio::test]
async fn send_without_active_conversation_rejected() {
    let (addr, _state) = start_server().await;
    let (alice, _events) = connect_client(addr, "alice", Role::Customer).await;

    let err = alice.send_message("hello?".into()).await.unwrap_err();
    assert!(matches!(err, SendError::NoActiveConversation));
}

#[tokio::test]
async fn send_while_disconnected_rejected() {
    let (addr, _state) = start_server().await;
    // Valid persistence API, but the event channel points at a dead port.
    let api = HttpApi::new(
        format!("http://{addr}"),
        UserId::new("alice"),
        Duration::from_secs(5),
    )
    .unwrap();
    let identity = Identity {
        user_id: UserId::new("alice"),
        display_name: "ALICE".into(),
        role: Role::Customer,
    };
    let (alice, _events) =
        ChatClient::connect(api, identity, "ws://127.0.0.1:1/ws", test_config()).unwrap();

    alice.open_conversation(UserId::new("bob"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = alice.send_message("hello?".into()).await.unwrap_err();
    assert!(matches!(err, SendError::NotConnected));
    assert!(alice.snapshot().log.is_empty());
}

#[tokio::test]
async fn failed_persist_rolls_back_and_returns_body() {
    let (addr, state) = start_server().await;
    let (alice, mut events) = connect_client(addr, "alice", Role::Customer).await;
    alice.open_conversation(UserId::new("bob"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    state.set_fail_submissions(true).await;

    let err = alice.send_message("Hi".into()).await.unwrap_err();
    match err {
        SendError::Rejected { body, .. } => assert_eq!(body, "Hi", "composer must be restorable"),
        other => panic!("expected Rejected, got {other:?}"),
    }
    assert!(
        alice.snapshot().log.is_empty(),
        "optimistic entry must be rolled back"
    );

    wait_for_event(&mut events, Duration::from_secs(2), "failed state", |e| {
        matches!(
            e,
            ChatEvent::MessageStateChanged {
                delivery: DeliveryState::Failed,
                ..
            }
        )
    })
    .await;

    // Recovery: the same body sends fine once the server behaves again.
    state.set_fail_submissions(false).await;
    alice.send_message("Hi".into()).await.expect("retry failed");
    assert_eq!(alice.snapshot().log.len(), 1);
}

// =============================================================================
// Unread counters
// =============================================================================

#[tokio::test]
async fn message_for_inactive_conversation_bumps_unread_exactly_once() {
    let (addr, _state) = start_server().await;
    let (alice, mut alice_events) = connect_client(addr, "alice", Role::Customer).await;
    let (bob, _bob_events) = connect_client(addr, "bob", Role::Customer).await;

    // Alice is looking at a different conversation entirely.
    alice.open_conversation(UserId::new("someone-else"));
    bob.open_conversation(UserId::new("alice"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    bob.send_message("ping".into()).await.expect("send failed");

    let event = wait_for_event(
        &mut alice_events,
        Duration::from_secs(5),
        "unread notification",
        |e| matches!(e, ChatEvent::UnreadNotification { .. }),
    )
    .await;
    match event {
        ChatEvent::UnreadNotification { conversation, preview } => {
            assert_eq!(conversation, UserId::new("bob"));
            assert_eq!(preview, "ping");
        }
        _ => unreachable!(),
    }

    // Both delivery paths have landed by now; the counter must be 1.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let snap = alice.snapshot();
    assert_eq!(snap.unread_total, 1, "duplicate delivery must not double-count");
    let bob_summary = snap
        .conversations
        .iter()
        .find(|s| s.peer.user_id == UserId::new("bob"))
        .expect("bob conversation summary missing");
    assert_eq!(bob_summary.unread_count, 1);
    // Alice's open conversation log is untouched.
    assert!(snap.log.is_empty());
}

#[tokio::test]
async fn opening_conversation_clears_unread() {
    let (addr, _state) = start_server().await;
    let (alice, mut alice_events) = connect_client(addr, "alice", Role::Customer).await;
    let (bob, _bob_events) = connect_client(addr, "bob", Role::Customer).await;

    bob.open_conversation(UserId::new("alice"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    bob.send_message("are you there?".into()).await.unwrap();

    wait_for_event(
        &mut alice_events,
        Duration::from_secs(5),
        "unread notification",
        |e| matches!(e, ChatEvent::UnreadNotification { .. }),
    )
    .await;
    assert_eq!(alice.snapshot().unread_total, 1);

    alice.open_conversation(UserId::new("bob"));
    wait_for_event(
        &mut alice_events,
        Duration::from_secs(5),
        "history refresh",
        |e| matches!(e, ChatEvent::HistoryRefreshed { .. }),
    )
    .await;

    let snap = alice.snapshot();
    assert_eq!(snap.unread_total, 0);
    assert_eq!(snap.log.len(), 1, "history fetch fills the log");
}

// =============================================================================
// Deletion
// =============================================================================

#[tokio::test]
async fn delete_message_removes_it_from_server_and_log() {
    let (addr, _state) = start_server().await;
    let (alice, _alice_events) = connect_client(addr, "alice", Role::Customer).await;

    alice.open_conversation(UserId::new("bob"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let id = alice.send_message("wrong thread, sorry".into()).await.unwrap();
    let MessageId::Persisted(id) = id else {
        panic!("expected persisted id");
    };

    alice.delete_message(id).await.expect("delete failed");
    assert!(alice.snapshot().log.is_empty());

    // A fresh sweep confirms the server forgot it too.
    alice.reconcile().await;
    assert!(alice.snapshot().log.is_empty());
}
