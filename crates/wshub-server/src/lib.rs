//! # wshub-server
//!
//! In-memory WebSocket broadcast hub.
//!
//! - **Codec** ([`protocol`]): JSON text frames ⇄ the closed [`protocol::Message`] set
//! - **Connection** ([`websocket::connection`]): one client's state and outbound queue
//! - **Registry** ([`websocket::registry`]): authenticated members and fan-out broadcast
//! - **Hub** ([`hub`]): per-message protocol state machine, errors become `error` replies
//! - **Server** ([`server`]): axum `/ws` and `/health`, connection limit, graceful shutdown

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use hub::{Hub, HubError};
pub use server::{HubServer, ServerError, run};
