//! Rideline reference chat server.
//!
//! Implements the two boundary contracts the client consumes (the
//! WebSocket event channel and the request/response persistence API)
//! over in-memory storage. Used by the integration suite to exercise the
//! client against a real network path; also runnable standalone.

pub mod config;
pub mod http;
pub mod state;
pub mod ws;
