//! # wshub
//!
//! Broadcast hub binary: loads settings, applies CLI overrides, starts the
//! WebSocket server and runs until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use wshub_core::logging::{LogFormat, LogSink, init_subscriber};
use wshub_server::config::ServerConfig;
use wshub_server::server::HubServer;
use wshub_settings::{HubSettings, load_settings_from_path, settings_path};

/// WebSocket broadcast hub.
#[derive(Parser, Debug)]
#[command(name = "wshub", about = "WebSocket broadcast hub")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings, 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.wshub/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Accepted auth token; repeat to accept several. Replaces the configured list.
    #[arg(long = "token", value_name = "TOKEN")]
    tokens: Vec<String>,

    /// Log at debug level.
    #[arg(long)]
    debug: bool,

    /// Write logs to stdout instead of stderr.
    #[arg(long)]
    stdout: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn settings_path(&self) -> PathBuf {
        self.settings.clone().unwrap_or_else(settings_path)
    }

    /// Layer the flags over loaded settings.
    fn apply(&self, settings: &mut HubSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if !self.tokens.is_empty() {
            settings.auth.tokens.clone_from(&self.tokens);
        }
        if self.debug {
            settings.logging.level = "debug".into();
        }
        if self.stdout {
            settings.logging.sink = LogSink::Stdout;
        }
        if self.json_logs {
            settings.logging.format = LogFormat::Json;
        }
    }
}

/// Resolve settings from the file, env vars and CLI flags.
fn resolve_settings(cli: &Cli) -> Result<HubSettings> {
    let path = cli.settings_path();
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = resolve_settings(&cli)?;
    init_subscriber(
        &settings.logging.level,
        settings.logging.format,
        settings.logging.sink,
    );

    let server = HubServer::new(ServerConfig::from_settings(&settings));
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        tokens = settings.auth.tokens.len(),
        max_connections = settings.server.max_connections,
        "wshub listening on ws://{addr}/ws"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    if !server.shutdown().graceful_shutdown([handle], None).await {
        tracing::warn!("accept loop did not stop in time");
    }
    Ok(())
}
