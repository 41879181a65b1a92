//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, Utf8Bytes, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, instrument, warn};
use wshub_core::ConnectionId;

use super::connection::ClientConnection;
use crate::hub::Hub;

/// Lower bound for both heartbeat durations; `tokio::time::interval` rejects zero.
const MIN_HEARTBEAT: Duration = Duration::from_millis(1);

/// Per-session tuning derived from the server configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    /// Capacity of the outbound queue feeding the writer task.
    pub send_queue_capacity: usize,
    /// Interval between server-initiated Ping frames.
    pub heartbeat_interval: Duration,
    /// Silence after which the client is considered dead.
    pub heartbeat_timeout: Duration,
}

impl SessionOptions {
    /// Copy with zero values raised to their minimums.
    pub fn clamped(self) -> Self {
        Self {
            send_queue_capacity: self.send_queue_capacity.max(1),
            heartbeat_interval: self.heartbeat_interval.max(MIN_HEARTBEAT),
            heartbeat_timeout: self.heartbeat_timeout.max(MIN_HEARTBEAT),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
        }
    }
}

/// Run a WebSocket session for a connected client.
///
/// 1. Spawns the writer task draining the connection's outbound queue and
///    sending periodic Ping frames
/// 2. Hands inbound text frames to the hub, one at a time, in arrival order
/// 3. Ends on client close, transport error, heartbeat timeout or `cancel`
/// 4. Removes the connection from the registry
///
/// `cancel` must be owned by this session (a child of the shutdown token); it
/// is cancelled when either half stops.
#[instrument(skip_all, fields(conn_id = %id))]
pub async fn run_ws_session(
    ws: WebSocket,
    id: ConnectionId,
    hub: Arc<Hub>,
    options: SessionOptions,
    cancel: CancellationToken,
) {
    let options = options.clamped();
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Utf8Bytes>(options.send_queue_capacity);
    let connection = Arc::new(ClientConnection::new(id, send_tx));
    debug!("client connected");

    let outbound = {
        let connection = Arc::clone(&connection);
        let cancel = cancel.clone();
        tokio::spawn(
            async move {
                let mut ping_interval = tokio::time::interval(options.heartbeat_interval);
                // Skip the immediate first tick
                let _ = ping_interval.tick().await;

                loop {
                    tokio::select! {
                        frame = send_rx.recv() => {
                            let Some(text) = frame else { break };
                            if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        _ = ping_interval.tick() => {
                            if !connection.check_alive()
                                && connection.last_seen_elapsed() > options.heartbeat_timeout
                            {
                                warn!(timeout = ?options.heartbeat_timeout, "client unresponsive, disconnecting");
                                break;
                            }
                            if ws_tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                                break;
                            }
                        }
                        () = cancel.cancelled() => break,
                    }
                }
                let _ = ws_tx.close().await;
                cancel.cancel();
            }
            .in_current_span(),
        )
    };

    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            () = cancel.cancelled() => break,
        };
        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!(error = %e, "transport error");
                break;
            }
            None => break,
        };
        connection.mark_alive();
        match msg {
            WsMessage::Text(text) => hub.handle_text(&connection, text.as_str()).await,
            WsMessage::Binary(data) => debug!(len = data.len(), "ignoring binary frame"),
            WsMessage::Close(_) => {
                debug!("client sent close frame");
                break;
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
        }
    }

    cancel.cancel();
    if let Err(e) = outbound.await {
        warn!(error = %e, "writer task failed");
    }
    hub.disconnect(&connection).await;
}
