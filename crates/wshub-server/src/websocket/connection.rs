//! WebSocket client connection state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::Utf8Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use wshub_core::ConnectionId;

use super::registry::{BroadcastReport, ConnectionRegistry};
use crate::protocol::{self, Message};

/// Lifecycle of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected, not yet registered.
    Pending,
    /// Registered with a valid token; a Registry member.
    Authenticated,
    /// Transport gone; no further messages are processed.
    Closed,
}

/// Failure to queue a frame for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The client's outbound queue is full.
    #[error("send queue full")]
    Full,
    /// The client's writer task has gone away.
    #[error("connection closed")]
    Closed,
}

/// A connected WebSocket client.
pub struct ClientConnection {
    id: ConnectionId,
    state: Mutex<ConnectionState>,
    /// Queue drained by the socket writer task.
    tx: mpsc::Sender<Utf8Bytes>,
    connected_at: Instant,
    /// Set by any inbound frame, cleared by each heartbeat check.
    is_alive: AtomicBool,
    last_seen: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a pending connection.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Utf8Bytes>) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: Mutex::new(ConnectionState::Pending),
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Identity assigned at accept time.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Whether `register` has succeeded and the connection is still open.
    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    /// Move `Pending` → `Authenticated`.
    ///
    /// Returns `false` without changing anything from any other state.
    pub fn authenticate(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Pending {
            *state = ConnectionState::Authenticated;
            true
        } else {
            false
        }
    }

    /// Enter `Closed` and return the state it left.
    pub fn mark_closed(&self) -> ConnectionState {
        std::mem::replace(&mut *self.state.lock(), ConnectionState::Closed)
    }

    /// Queue a pre-encoded frame without waiting.
    pub fn send(&self, frame: Utf8Bytes) -> Result<(), SendError> {
        self.tx.try_send(frame).map_err(|e| {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            match e {
                mpsc::error::TrySendError::Full(_) => SendError::Full,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            }
        })
    }

    /// Reply to this client only. Failures are logged, never returned.
    pub fn send_to_self(&self, message: &Message) {
        let frame = match protocol::encode(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(conn_id = %self.id, kind = %message.kind(), error = %e, "failed to encode message");
                return;
            }
        };
        debug!(conn_id = %self.id, frame = %frame, "sending to self");
        if let Err(e) = self.send(Utf8Bytes::from(frame)) {
            warn!(conn_id = %self.id, kind = %message.kind(), error = %e, "failed to send to self");
        }
    }

    /// Broadcast to every Registry member except this connection.
    pub async fn send_to_others(
        &self,
        registry: &ConnectionRegistry,
        message: &Message,
    ) -> BroadcastReport {
        registry.broadcast_except(message, Some(self.id)).await
    }

    /// Close: leave the Registry (if a member) and enter `Closed`.
    ///
    /// Returns the state the connection was in before closing.
    pub async fn close(&self, registry: &ConnectionRegistry) -> ConnectionState {
        let previous = self.mark_closed();
        let _ = registry.remove(self.id).await;
        previous
    }

    /// Total frames that could not be queued.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record inbound activity.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the client was heard from since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last inbound frame (or connection establishment).
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
