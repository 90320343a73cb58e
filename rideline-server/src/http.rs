//! HTTP surface: the persistence API routes plus the WebSocket upgrade
//! endpoint, and the server entry points shared by `main.rs` and tests.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State, ws::WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};

use rideline_proto::event::ServerFrame;
use rideline_proto::message::{self, ConversationSummary, HistoryPage, Message, SubmitMessageRequest};
use rideline_proto::presence::PeerProfile;

use crate::state::ServerState;

/// Query carrying the calling user's identity.
#[derive(Debug, serde::Deserialize)]
struct UserQuery {
    user_id: String,
}

/// Query for paginated history fetches.
#[derive(Debug, serde::Deserialize)]
struct HistoryQuery {
    user_id: String,
    peer_id: String,
    #[serde(default)]
    page: u32,
    #[serde(default = "default_limit")]
    limit: u32,
}

const fn default_limit() -> u32 {
    50
}

/// Builds the axum router over the shared state.
#[must_use]
pub fn router(state: Arc<ServerState>) -> axum::Router {
    axum::Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/{peer}/read", post(mark_read))
        .route("/api/messages", get(fetch_history).post(submit_message))
        .route("/api/messages/{id}", delete(delete_message))
        .route("/api/unread", get(unread_total))
        .route("/api/support", get(support_directory))
        .with_state(state)
}

/// Starts the server on the given address with fresh state.
///
/// Returns the bound address and a join handle. Primary entry point for
/// `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(ServerState::new())).await
}

/// Starts the server with pre-configured state (tests use this to reach
/// the revocation and failure hooks).
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<ServerState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok((bound_addr, handle))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| crate::ws::handle_socket(socket, state))
}

/// Rejects revoked users with 401.
async fn authorize(state: &ServerState, user_id: &str) -> Result<(), StatusCode> {
    if state.is_revoked(user_id).await {
        Err(StatusCode::UNAUTHORIZED)
    } else {
        Ok(())
    }
}

async fn list_conversations(
    State(state): State<Arc<ServerState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<ConversationSummary>>, StatusCode> {
    authorize(&state, &q.user_id).await?;
    Ok(Json(state.summaries_for(&q.user_id).await))
}

async fn fetch_history(
    State(state): State<Arc<ServerState>>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>, StatusCode> {
    authorize(&state, &q.user_id).await?;
    Ok(Json(
        state.history(&q.user_id, &q.peer_id, q.page, q.limit).await,
    ))
}

async fn submit_message(
    State(state): State<Arc<ServerState>>,
    Query(q): Query<UserQuery>,
    Json(request): Json<SubmitMessageRequest>,
) -> Result<Json<Message>, (StatusCode, String)> {
    authorize(&state, &q.user_id)
        .await
        .map_err(|status| (status, String::new()))?;
    if state.submissions_failing().await {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "submissions disabled".to_string(),
        ));
    }
    message::validate_body(&request.body)
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;

    let persisted = state
        .persist_message(&q.user_id, request.receiver_id.as_str(), &request.body)
        .await;

    // Push notification to the receiver's live session, if any. This is
    // the second delivery path next to the sender's live relay.
    state
        .send_to(
            request.receiver_id.as_str(),
            &ServerFrame::MessageDelivered(persisted.clone()),
        )
        .await;

    Ok(Json(persisted))
}

async fn mark_read(
    State(state): State<Arc<ServerState>>,
    Path(peer): Path<String>,
    Query(q): Query<UserQuery>,
) -> Result<StatusCode, StatusCode> {
    authorize(&state, &q.user_id).await?;
    state.mark_read(&q.user_id, &peer).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_message(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<u64>,
    Query(q): Query<UserQuery>,
) -> Result<StatusCode, StatusCode> {
    authorize(&state, &q.user_id).await?;
    if state.delete_message(id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn unread_total(
    State(state): State<Arc<ServerState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<u32>, StatusCode> {
    authorize(&state, &q.user_id).await?;
    Ok(Json(state.unread_total(&q.user_id).await))
}

async fn support_directory(
    State(state): State<Arc<ServerState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<PeerProfile>>, StatusCode> {
    authorize(&state, &q.user_id).await?;
    Ok(Json(state.support_directory().await))
}
