//! Structured logging with `tracing`.
//!
//! The hub never writes to stdout/stderr directly. Everything goes through
//! `tracing` macros, and the binary picks the sink and format once at startup
//! with [`init_subscriber`].

pub mod test_utils;

pub use test_utils::{CapturedLogs, capture_logs};

use serde::{Deserialize, Serialize};

/// Output format of the fmt subscriber.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human readable output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Where log lines are written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSink {
    /// Standard error.
    #[default]
    Stderr,
    /// Standard output.
    Stdout,
}

/// Initialize the global tracing subscriber.
///
/// Call once at application startup. Subsequent calls are no-ops.
/// `RUST_LOG` takes precedence over `level` when it is set.
pub fn init_subscriber(level: &str, format: LogFormat, sink: LogSink) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    // try_init fails only when a global subscriber is already installed
    let _ = match (format, sink) {
        (LogFormat::Compact, LogSink::Stderr) => {
            builder.with_writer(std::io::stderr).compact().try_init()
        }
        (LogFormat::Compact, LogSink::Stdout) => {
            builder.with_writer(std::io::stdout).compact().try_init()
        }
        (LogFormat::Json, LogSink::Stderr) => builder.with_writer(std::io::stderr).json().try_init(),
        (LogFormat::Json, LogSink::Stdout) => builder.with_writer(std::io::stdout).json().try_init(),
    };
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
