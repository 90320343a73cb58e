//! Rideline chat client: real-time conversational sync for the rental
//! marketplace support chat.
//!
//! The [`chat::ChatClient`] keeps a local view of conversations, messages,
//! presence, and typing state consistent with the server over a long-lived
//! WebSocket plus a request/response persistence API, surviving
//! disconnects, duplicate deliveries, and speculative local writes.

pub mod api;
pub mod chat;
pub mod config;
pub mod connection;
pub mod presence;
pub mod store;
pub mod typing;
