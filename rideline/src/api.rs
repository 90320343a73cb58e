//! Persistence API client for the Rideline chat server.
//!
//! Defines the [`PersistenceApi`] trait the client core talks through,
//! the HTTP implementation [`HttpApi`], and an in-memory double
//! ([`InMemoryApi`]) for unit tests. Every HTTP request carries the local
//! user id and runs under a per-request timeout.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rideline_proto::ids::{MessageId, Role, Timestamp, UserId};
use rideline_proto::message::{
    ConversationSummary, DeliveryState, HistoryPage, Message, MessageKind, SubmitMessageRequest,
};
use rideline_proto::presence::PeerProfile;

/// Errors surfaced by persistence API calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The session is no longer authenticated (HTTP 401). Observing this
    /// anywhere tears the whole chat session down.
    #[error("session is no longer authenticated")]
    AuthExpired,

    /// The server rejected the request.
    #[error("server rejected request: {status} {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, if any.
        message: String,
    },

    /// Request-level transport failure (connect error, timeout).
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a body the client could not interpret.
    #[error("invalid server response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Returns `true` when the error means the session identity is dead.
    #[must_use]
    pub const fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired)
    }
}

/// Request/response persistence boundary consumed by the client core.
///
/// The HTTP implementation is [`HttpApi`]; tests substitute
/// [`InMemoryApi`]. All calls are independent request/response exchanges;
/// ordering across calls is not guaranteed, which is why fetch results are
/// epoch-checked before being applied to the store.
pub trait PersistenceApi: Send + Sync + 'static {
    /// Fetch conversation summaries for the local user (role-scoped).
    fn fetch_summaries(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ConversationSummary>, ApiError>> + Send;

    /// Fetch one page of message history with `peer`. Page 0 is the newest
    /// `limit` messages; pages count backwards in time.
    fn fetch_history(
        &self,
        peer: &UserId,
        page: u32,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<HistoryPage, ApiError>> + Send;

    /// Fetch the total unread count across all conversations.
    fn fetch_unread_total(
        &self,
    ) -> impl std::future::Future<Output = Result<u32, ApiError>> + Send;

    /// Persist a message to `receiver`. The server assigns the durable id
    /// and timestamp.
    fn submit_message(
        &self,
        receiver: &UserId,
        body: &str,
    ) -> impl std::future::Future<Output = Result<Message, ApiError>> + Send;

    /// Mark the conversation with `peer` as read.
    fn mark_read(
        &self,
        peer: &UserId,
    ) -> impl std::future::Future<Output = Result<(), ApiError>> + Send;

    /// Delete a persisted message.
    fn delete_message(
        &self,
        id: u64,
    ) -> impl std::future::Future<Output = Result<(), ApiError>> + Send;

    /// Fetch the directory of support staff.
    fn fetch_support_directory(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<PeerProfile>, ApiError>> + Send;
}

/// HTTP implementation of [`PersistenceApi`] against the Rideline server.
pub struct HttpApi {
    http: reqwest::Client,
    base_url: String,
    user_id: UserId,
}

impl HttpApi {
    /// Creates an API client rooted at `base_url` (e.g.
    /// `http://127.0.0.1:9400`), acting as `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Transport`] if the underlying HTTP client
    /// cannot be constructed.
    pub fn new(
        base_url: impl Into<String>,
        user_id: UserId,
        timeout: std::time::Duration,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self {
            http,
            base_url,
            user_id,
        })
    }

    /// Maps an HTTP response to the API error taxonomy.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ApiError::AuthExpired);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

impl PersistenceApi for HttpApi {
    async fn fetch_summaries(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        let response = self
            .http
            .get(self.url("/api/conversations"))
            .query(&[("user_id", self.user_id.as_str())])
            .send()
            .await?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    async fn fetch_history(
        &self,
        peer: &UserId,
        page: u32,
        limit: u32,
    ) -> Result<HistoryPage, ApiError> {
        let response = self
            .http
            .get(self.url("/api/messages"))
            .query(&[
                ("user_id", self.user_id.as_str()),
                ("peer_id", peer.as_str()),
            ])
            .query(&[("page", page), ("limit", limit)])
            .send()
            .await?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    async fn fetch_unread_total(&self) -> Result<u32, ApiError> {
        let response = self
            .http
            .get(self.url("/api/unread"))
            .query(&[("user_id", self.user_id.as_str())])
            .send()
            .await?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    async fn submit_message(&self, receiver: &UserId, body: &str) -> Result<Message, ApiError> {
        let request = SubmitMessageRequest {
            receiver_id: receiver.clone(),
            body: body.to_string(),
            kind: MessageKind::Text,
        };
        let response = self
            .http
            .post(self.url("/api/messages"))
            .query(&[("user_id", self.user_id.as_str())])
            .json(&request)
            .send()
            .await?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    async fn mark_read(&self, peer: &UserId) -> Result<(), ApiError> {
        let response = self
            .http
            .post(self.url(&format!("/api/conversations/{}/read", peer.as_str())))
            .query(&[("user_id", self.user_id.as_str())])
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete_message(&self, id: u64) -> Result<(), ApiError> {
        let response = self
            .http
            .delete(self.url(&format!("/api/messages/{id}")))
            .query(&[("user_id", self.user_id.as_str())])
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn fetch_support_directory(&self) -> Result<Vec<PeerProfile>, ApiError> {
        let response = self
            .http
            .get(self.url("/api/support"))
            .query(&[("user_id", self.user_id.as_str())])
            .send()
            .await?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

/// In-memory [`PersistenceApi`] double for unit tests.
///
/// Stores submitted messages, serves history pages over them, and can be
/// switched into failure modes (`fail_submissions`, `revoke_auth`) to
/// exercise the rollback and teardown paths.
pub struct InMemoryApi {
    user_id: UserId,
    next_id: AtomicU64,
    messages: parking_lot::Mutex<Vec<Message>>,
    summaries: parking_lot::Mutex<Vec<ConversationSummary>>,
    unread_total: AtomicU64,
    fail_submissions: AtomicBool,
    revoked: AtomicBool,
}

impl InMemoryApi {
    /// Creates an empty in-memory API acting as `user_id`.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            next_id: AtomicU64::new(1),
            messages: parking_lot::Mutex::new(Vec::new()),
            summaries: parking_lot::Mutex::new(Vec::new()),
            unread_total: AtomicU64::new(0),
            fail_submissions: AtomicBool::new(false),
            revoked: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent submit call fail with a server rejection.
    pub fn fail_submissions(&self, fail: bool) {
        self.fail_submissions.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent call fail with [`ApiError::AuthExpired`].
    pub fn revoke_auth(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    /// Seeds a persisted message, returning its assigned id.
    pub fn seed_message(&self, sender: &UserId, receiver: &UserId, body: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.messages.lock().push(Message {
            id: MessageId::Persisted(id),
            sender_id: sender.clone(),
            receiver_id: receiver.clone(),
            body: body.to_string(),
            sent_at: Timestamp::now(),
            delivery: DeliveryState::Confirmed,
        });
        id
    }

    /// Replaces the summaries served by `fetch_summaries`.
    pub fn set_summaries(&self, summaries: Vec<ConversationSummary>) {
        *self.summaries.lock() = summaries;
    }

    /// Sets the total served by `fetch_unread_total`.
    pub fn set_unread_total(&self, total: u32) {
        self.unread_total.store(u64::from(total), Ordering::SeqCst);
    }

    fn check_auth(&self) -> Result<(), ApiError> {
        if self.revoked.load(Ordering::SeqCst) {
            return Err(ApiError::AuthExpired);
        }
        Ok(())
    }
}

impl PersistenceApi for InMemoryApi {
    async fn fetch_summaries(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        self.check_auth()?;
        Ok(self.summaries.lock().clone())
    }

    async fn fetch_history(
        &self,
        peer: &UserId,
        page: u32,
        limit: u32,
    ) -> Result<HistoryPage, ApiError> {
        self.check_auth()?;
        let messages = self.messages.lock();
        let mut thread: Vec<Message> = messages
            .iter()
            .filter(|m| {
                (m.sender_id == self.user_id && m.receiver_id == *peer)
                    || (m.sender_id == *peer && m.receiver_id == self.user_id)
            })
            .cloned()
            .collect();
        thread.sort_by_key(|m| m.sent_at);
        Ok(rideline_proto::message::page_back_from_newest(
            &thread, page, limit,
        ))
    }

    async fn fetch_unread_total(&self) -> Result<u32, ApiError> {
        self.check_auth()?;
        Ok(u32::try_from(self.unread_total.load(Ordering::SeqCst)).unwrap_or(u32::MAX))
    }

    async fn submit_message(&self, receiver: &UserId, body: &str) -> Result<Message, ApiError> {
        self.check_auth()?;
        if self.fail_submissions.load(Ordering::SeqCst) {
            return Err(ApiError::Rejected {
                status: 500,
                message: "submissions disabled".into(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = Message {
            id: MessageId::Persisted(id),
            sender_id: self.user_id.clone(),
            receiver_id: receiver.clone(),
            body: body.to_string(),
            sent_at: Timestamp::now(),
            delivery: DeliveryState::Confirmed,
        };
        self.messages.lock().push(message.clone());
        Ok(message)
    }

    async fn mark_read(&self, _peer: &UserId) -> Result<(), ApiError> {
        self.check_auth()
    }

    async fn delete_message(&self, id: u64) -> Result<(), ApiError> {
        self.check_auth()?;
        self.messages
            .lock()
            .retain(|m| m.id.as_persisted() != Some(id));
        Ok(())
    }

    async fn fetch_support_directory(&self) -> Result<Vec<PeerProfile>, ApiError> {
        self.check_auth()?;
        Ok(self
            .summaries
            .lock()
            .iter()
            .filter(|s| s.peer.role == Role::Support)
            .map(|s| s.peer.clone())
            .collect())
    }
}
