//! `HubServer`: Axum HTTP + WebSocket server.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, info, info_span, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::hub::Hub;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::session::run_ws_session;

/// Fatal server failures. Everything else is handled per connection.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be opened.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested `host:port`.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The accept loop failed.
    #[error("server error: {0}")]
    Serve(#[from] io::Error),
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Protocol logic and the registry behind it.
    pub hub: Arc<Hub>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Open WebSocket sessions.
    pub open_sessions: Arc<AtomicUsize>,
}

/// The broadcast hub server.
pub struct HubServer {
    config: Arc<ServerConfig>,
    hub: Arc<Hub>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    open_sessions: Arc<AtomicUsize>,
}

impl HubServer {
    /// Create a server with its own shutdown coordinator.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_shutdown(config, ShutdownCoordinator::new())
    }

    /// Create a server stopped by `shutdown`.
    pub fn with_shutdown(config: ServerConfig, shutdown: ShutdownCoordinator) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let hub = Hub::new(registry, config.auth_tokens.iter().cloned());
        Self {
            config: Arc::new(config),
            hub: Arc::new(hub),
            shutdown: Arc::new(shutdown),
            start_time: Instant::now(),
            open_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: self.hub.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            open_sessions: self.open_sessions.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address (useful with port `0`) and the accept loop's
    /// task handle.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<Result<(), ServerError>>), ServerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let router = self.router();
        let token = self.shutdown.token();
        info!(addr = %local_addr, "listening");

        let handle = tokio::spawn(
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(token.cancelled_owned())
                    .await?;
                info!("accept loop stopped");
                Ok::<(), ServerError>(())
            }
            .in_current_span(),
        );
        Ok((local_addr, handle))
    }

    /// Protocol logic.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Registry of authenticated connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.hub.registry()
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Open WebSocket sessions.
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }
}

/// Run the hub on `config.host:config.port` until `shutdown` is cancelled.
///
/// Only a bind failure or a failing accept loop is reported as an error.
pub async fn run(config: ServerConfig, shutdown: CancellationToken) -> Result<(), ServerError> {
    let span = info_span!("hub", host = %config.host, port = config.port);
    async move {
        let server = HubServer::with_shutdown(config, ShutdownCoordinator::with_token(shutdown));
        let (_addr, handle) = server.listen().await?;
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(ServerError::Serve(io::Error::other(e))),
        };
        info!(
            open_sessions = server.open_sessions(),
            registered = server.registry().member_count(),
            "hub stopped"
        );
        result
    }
    .instrument(span)
    .await
}

/// One counted WebSocket session; released on drop.
struct SessionSlot(Arc<AtomicUsize>);

impl SessionSlot {
    /// Take a slot unless `limit` sessions are already open.
    fn acquire(open: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        open.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .ok()
            .map(|_| Self(Arc::clone(open)))
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.open_sessions.load(Ordering::SeqCst),
        state.hub.registry().member_count(),
    ))
}

/// GET /ws
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let Some(slot) = SessionSlot::acquire(&state.open_sessions, state.config.max_connections) else {
        warn!(limit = state.config.max_connections, "connection limit reached, refusing upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };

    let id = state.hub.registry().next_connection_id();
    let hub = state.hub.clone();
    let options = state.config.session_options();
    let token = state.shutdown.session_token();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            let _slot = slot;
            run_ws_session(socket, id, hub, options, token).await;
        })
}
