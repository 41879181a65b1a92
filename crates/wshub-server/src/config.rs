//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use wshub_settings::{DEFAULT_AUTH_TOKENS, HubSettings};

use crate::websocket::session::SessionOptions;

/// Configuration for the hub server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket sessions.
    pub max_connections: usize,
    /// Outbound queue capacity per connection.
    pub send_queue_capacity: usize,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Interval between transport Ping frames, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a client is dropped, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Tokens accepted by `register`.
    pub auth_tokens: Vec<String>,
}

impl ServerConfig {
    /// Project loaded settings onto the server.
    pub fn from_settings(settings: &HubSettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_connections: server.max_connections,
            send_queue_capacity: server.send_queue_capacity,
            max_message_size: server.max_message_size,
            heartbeat_interval_ms: server.heartbeat_interval_ms,
            heartbeat_timeout_ms: server.heartbeat_timeout_ms,
            auth_tokens: settings.auth.tokens.clone(),
        }
    }

    /// Tuning handed to each session.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            send_queue_capacity: self.send_queue_capacity,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
        }
        .clamped()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1024,
            send_queue_capacity: 256,
            max_message_size: 1024 * 1024, // 1 MiB
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            auth_tokens: DEFAULT_AUTH_TOKENS.map(String::from).to_vec(),
        }
    }
}
