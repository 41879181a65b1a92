//! Settings types.

use serde::{Deserialize, Serialize};
use wshub_core::logging::{LogFormat, LogSink};

use crate::errors::{Result, SettingsError};

/// Tokens accepted by `register` when no settings override them.
pub const DEFAULT_AUTH_TOKENS: [&str; 4] = ["asdf", "asdf1", "asdf2", "asdf3"];

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Listener and connection settings.
    pub server: ServerSettings,
    /// Static token authentication.
    pub auth: AuthSettings,
    /// Log level, format and sink.
    pub logging: LoggingSettings,
}

impl HubSettings {
    /// Reject settings the hub cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.auth.tokens.is_empty() {
            return Err(SettingsError::InvalidValue(
                "auth.tokens must not be empty".into(),
            ));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be at least 1".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be at least 1".into(),
            ));
        }
        if self.server.heartbeat_timeout_ms < self.server.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatTimeoutMs must not be below server.heartbeatIntervalMs".into(),
            ));
        }
        Ok(())
    }
}

/// Server network and runtime settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address. `0.0.0.0` listens on every interface.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Maximum concurrently open WebSocket sessions.
    pub max_connections: usize,
    /// Outbound messages buffered per connection before sends start failing.
    pub send_queue_capacity: usize,
    /// Largest accepted WebSocket message in bytes.
    pub max_message_size: usize,
    /// Interval between transport-level Ping frames in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a connection is dropped, in milliseconds.
    pub heartbeat_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 1024,
            send_queue_capacity: 256,
            max_message_size: 1024 * 1024,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
        }
    }
}

/// Authentication settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Tokens accepted by the `register` message.
    pub tokens: Vec<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            tokens: DEFAULT_AUTH_TOKENS.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive, e.g. `info` or `wshub_server=debug`.
    pub level: String,
    /// Line format.
    pub format: LogFormat,
    /// Output stream.
    pub sink: LogSink,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            sink: LogSink::default(),
        }
    }
}
