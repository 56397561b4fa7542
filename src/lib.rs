//! Streaming chat sessions for a local-first AI knowledge assistant.
//!
//! sluice is both halves of one long-lived conversation stream:
//!
//! - a **client** whose [`StreamController`](client::session::StreamController)
//!   opens a server-sent-event stream, accumulates token fragments, reconnects
//!   on transport failure with bounded backoff, and commits exactly one
//!   authoritative message per response;
//! - a **server** that fronts the chat API with an explicit, validated chain of
//!   security gates before any handler runs.
//!
//! | Gate | Order | Rejects with |
//! |------|-------|--------------|
//! | Origin policy | 1 | 403 `origin_rejected` (answers preflights) |
//! | Size limit | 2 | 413 `size_exceeded` |
//! | Rate limit | 3 | 429 `rate_exceeded` + `Retry-After` |
//! | Forgery check | 4 | 403 `forgery_missing` / `forgery_invalid` / `forgery_expired` |
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from TOML files and environment variables
//! - [`protocol`]: Wire types shared by client and server
//! - [`error`]: Client-side stream error taxonomy
//! - [`client`]: Session controller, retry handler, CSRF token cache, transport
//! - [`gate`]: Security gates and the ordered pipeline
//! - [`server`]: axum router, SSE chat handler, completion backends

pub mod client;
pub mod config;
pub mod error;
pub mod gate;
pub mod protocol;
pub mod server;
