//! Rideline support chat, line-oriented CLI client.
//!
//! Connects to a Rideline chat server and drives a live session from
//! stdin. Plain text sends to the open conversation; slash commands
//! switch conversations and inspect state.
//!
//! ```bash
//! cargo run --bin rideline -- --server-url http://127.0.0.1:9400 \
//!     --user-id cust-1 --display-name Sam --peer agent-7
//! ```

use std::io::Write as _;
use std::path::Path;

use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tracing_appender::non_blocking::WorkerGuard;

use rideline::api::HttpApi;
use rideline::chat::{ChatClient, ChatEvent, Identity};
use rideline::config::{CliArgs, ClientConfig};
use rideline_proto::ids::{Role, UserId};

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    // Logs go to a file so stdout stays usable for the conversation.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("rideline client starting");

    let Some(server_url) = config.server_url.clone() else {
        eprintln!("error: --server-url (or RIDELINE_SERVER) is required");
        std::process::exit(2);
    };
    let Some(user_id) = config.user_id.clone() else {
        eprintln!("error: --user-id (or RIDELINE_USER) is required");
        std::process::exit(2);
    };

    let identity = Identity {
        user_id: UserId::new(user_id.as_str()),
        display_name: config.display_name.clone().unwrap_or(user_id),
        role: if config.support {
            Role::Support
        } else {
            Role::Customer
        },
    };

    let api = match HttpApi::new(
        server_url.clone(),
        identity.user_id.clone(),
        config.chat.api_timeout,
    ) {
        Ok(api) => api,
        Err(e) => {
            eprintln!("error: could not build API client: {e}");
            std::process::exit(1);
        }
    };

    let ws_url = derive_ws_url(&server_url);
    let (client, mut events) =
        match ChatClient::connect(api, identity, ws_url, config.chat.clone()) {
            Ok(pair) => pair,
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        };

    if let Some(peer) = cli.peer {
        client.open_conversation(UserId::new(peer));
    }

    println!("connected as {}", client.identity().user_id);
    println!("commands: /open <peer>  /close  /sweep  /who  /delete <id>  /quit");

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let quit = print_event(&event);
                if quit {
                    break;
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if handle_line(&client, line.trim()).await {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break, // stdin closed
                }
            }
        }
    }

    client.shutdown();
    tracing::info!("rideline client exiting");
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to flush
/// buffered log entries.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("rideline.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Derives the event-channel URL from the HTTP base URL.
fn derive_ws_url(server_url: &str) -> String {
    let base = server_url.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{base}")
    };
    format!("{ws}/ws")
}

/// Handles one stdin line. Returns `true` to quit.
async fn handle_line(client: &ChatClient<HttpApi>, line: &str) -> bool {
    if line.is_empty() {
        return false;
    }
    if let Some(rest) = line.strip_prefix('/') {
        let mut parts = rest.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("quit"), _) => return true,
            (Some("open"), Some(peer)) => {
                client.open_conversation(UserId::new(peer));
                println!("* opened conversation with {peer}");
            }
            (Some("open"), None) => println!("usage: /open <peer>"),
            (Some("close"), _) => {
                client.close_conversation();
                println!("* conversation closed");
            }
            (Some("sweep"), _) => {
                client.reconcile().await;
                println!("* reconciliation sweep done");
            }
            (Some("who"), _) => {
                let roster = client.roster();
                if roster.is_empty() {
                    println!("* nobody online");
                }
                for entry in roster {
                    println!(
                        "* {} ({}) {}",
                        entry.display_name,
                        entry.role,
                        if entry.is_online { "online" } else { "offline" }
                    );
                }
                println!(
                    "* support online: {}",
                    if client.support_online() { "yes" } else { "no" }
                );
            }
            (Some("delete"), Some(id)) => match id.parse::<u64>() {
                Ok(id) => match client.delete_message(id).await {
                    Ok(()) => println!("* message {id} deleted"),
                    Err(e) => println!("! delete failed: {e}"),
                },
                Err(_) => println!("usage: /delete <numeric id>"),
            },
            _ => println!("! unknown command: /{rest}"),
        }
        return false;
    }

    // Plain text: typing indicator then send.
    client.note_local_input();
    match client.send_message(line.to_string()).await {
        Ok(_) => {}
        Err(e) => {
            // The body stays in the error for retry; in a line-oriented
            // client the user just types it again.
            println!("! send failed: {e}");
        }
    }
    false
}

/// Prints one event. Returns `true` when the session is over.
fn print_event(event: &ChatEvent) -> bool {
    match event {
        ChatEvent::MessageReceived { message, .. } => {
            println!(
                "[{}] {}: {}",
                format_timestamp_ms(message.sent_at.as_millis()),
                message.sender_id,
                message.body
            );
        }
        ChatEvent::MessageStateChanged { id, delivery } => {
            tracing::debug!(id = %id, delivery = ?delivery, "message state changed");
        }
        ChatEvent::HistoryRefreshed { conversation } => {
            println!("* history for {conversation} refreshed");
        }
        ChatEvent::ConversationsUpdated => {}
        ChatEvent::UnreadNotification { conversation, preview } => {
            println!("* new message from {conversation}: {preview}");
        }
        ChatEvent::PresenceChanged { user_id, is_online } => {
            println!(
                "* {user_id} is {}",
                if *is_online { "online" } else { "offline" }
            );
        }
        ChatEvent::SupportOnlineChanged(online) => {
            println!(
                "* support is {}",
                if *online { "available" } else { "unavailable" }
            );
        }
        ChatEvent::TypingChanged {
            display_name,
            is_typing,
            ..
        } => {
            if *is_typing {
                println!("* {display_name} is typing…");
            }
        }
        ChatEvent::ConnectionStatus { connected } => {
            println!("* {}", if *connected { "connected" } else { "disconnected" });
        }
        ChatEvent::Reconnecting {
            attempt,
            max_attempts,
        } => {
            println!("* reconnecting… (attempt {attempt}/{max_attempts})");
        }
        ChatEvent::ReconnectFailed => {
            println!("! could not reconnect; use /quit and start again");
        }
        ChatEvent::SessionEnded { reason } => {
            println!("! session ended: {reason}");
            return true;
        }
        ChatEvent::Error(message) => {
            println!("! {message}");
        }
    }
    let _ = std::io::stdout().flush();
    false
}

/// Format an epoch-millisecond timestamp as "HH:MM".
fn format_timestamp_ms(ms: u64) -> String {
    use chrono::{Local, TimeZone};
    let secs = i64::try_from(ms / 1000).unwrap_or(0);
    let nsecs = u32::try_from((ms % 1000) * 1_000_000).unwrap_or(0);
    match Local.timestamp_opt(secs, nsecs) {
        chrono::LocalResult::Single(dt) => dt.format("%H:%M").to_string(),
        _ => "??:??".to_string(),
    }
}
