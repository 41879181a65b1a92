//! The set of authenticated connections and fan-out broadcast.
//!
//! Membership lives behind a `tokio` `RwLock`. Broadcasts hold the read lock
//! while queueing, so a concurrent `remove` waits until the broadcast has seen
//! a consistent snapshot. Queueing never blocks, which keeps the read section
//! short.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::ws::Utf8Bytes;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use wshub_core::{ConnectionId, ConnectionIdGenerator};

use super::connection::ClientConnection;
use crate::protocol::{self, Message};

/// Membership change that would break the registry invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// A member with this identity is already registered.
    #[error("connection {0} is already registered")]
    Duplicate(ConnectionId),
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Members the message was addressed to.
    pub recipients: usize,
    /// Members whose queue rejected the message.
    pub failed: usize,
}

impl BroadcastReport {
    /// Members the message was queued for.
    pub fn delivered(&self) -> usize {
        self.recipients - self.failed
    }
}

/// Authenticated, broadcast-eligible connections keyed by identity.
pub struct ConnectionRegistry {
    members: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
    /// Mirrors `members.len()` so counts need no lock.
    member_count: AtomicUsize,
    ids: ConnectionIdGenerator,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            member_count: AtomicUsize::new(0),
            ids: ConnectionIdGenerator::new(),
        }
    }

    /// Allocate an identity for a newly accepted socket.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.ids.next_id()
    }

    /// Add a member. An existing member with the same identity is kept.
    pub async fn add(&self, connection: Arc<ClientConnection>) -> Result<(), RegistrationError> {
        let mut members = self.members.write().await;
        match members.entry(connection.id()) {
            Entry::Occupied(entry) => Err(RegistrationError::Duplicate(*entry.key())),
            Entry::Vacant(entry) => {
                let _ = entry.insert(connection);
                let _ = self.member_count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Remove a member. Returns whether it was present; absent is not an error.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        let mut members = self.members.write().await;
        if members.remove(&id).is_some() {
            let _ = self.member_count.fetch_sub(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Whether `id` is currently a member.
    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.members.read().await.contains_key(&id)
    }

    /// Identities of the current members, in no particular order.
    pub async fn member_ids(&self) -> Vec<ConnectionId> {
        self.members.read().await.keys().copied().collect()
    }

    /// Number of members.
    pub fn member_count(&self) -> usize {
        self.member_count.load(Ordering::Relaxed)
    }

    /// Queue `message` for every member except `excluded`.
    ///
    /// A member whose queue rejects the message is logged and skipped; it stays
    /// registered and the remaining members still receive the message.
    pub async fn broadcast_except(
        &self,
        message: &Message,
        excluded: Option<ConnectionId>,
    ) -> BroadcastReport {
        let frame = match protocol::encode(message) {
            Ok(text) => Utf8Bytes::from(text),
            Err(e) => {
                warn!(kind = %message.kind(), error = %e, "failed to encode broadcast");
                return BroadcastReport::default();
            }
        };

        let members = self.members.read().await;
        let mut report = BroadcastReport::default();
        for conn in members.values().filter(|c| Some(c.id()) != excluded) {
            report.recipients += 1;
            if let Err(e) = conn.send(frame.clone()) {
                report.failed += 1;
                warn!(conn_id = %conn.id(), error = %e, drops = conn.drop_count(), "failed to send broadcast to client");
            }
        }
        debug!(
            kind = %message.kind(),
            excluded = ?excluded.map(ConnectionId::as_u64),
            recipients = report.recipients,
            failed = report.failed,
            "broadcast"
        );
        report
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::sync::mpsc;
    use tracing::Level;
    use wshub_core::logging::capture_logs;

    fn make_connection_with_rx(
        registry: &ConnectionRegistry,
        capacity: usize,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = ClientConnection::new(registry.next_connection_id(), tx);
        assert!(conn.authenticate());
        (Arc::new(conn), rx)
    }

    fn chat(raw_from: u64) -> Message {
        Message::chat(ConnectionId::from_raw(raw_from), "hi")
    }

    #[tokio::test]
    async fn add_and_remove() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = make_connection_with_rx(&registry, 8);
        registry.add(conn.clone()).await.unwrap();
        assert_eq!(registry.member_count(), 1);
        assert!(registry.contains(conn.id()).await);

        assert!(registry.remove(conn.id()).await);
        assert_eq!(registry.member_count(), 0);
        assert!(!registry.contains(conn.id()).await);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = make_connection_with_rx(&registry, 8);
        let (b, _rx_b) = make_connection_with_rx(&registry, 8);
        registry.add(a.clone()).await.unwrap();
        registry.add(b.clone()).await.unwrap();

        assert!(registry.remove(a.id()).await);
        assert!(!registry.remove(a.id()).await);
        assert!(!registry.remove(ConnectionId::from_raw(999)).await);
        assert_eq!(registry.member_count(), 1);
        assert!(registry.contains(b.id()).await);
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = make_connection_with_rx(&registry, 8);
        registry.add(conn.clone()).await.unwrap();
        assert_matches!(
            registry.add(conn.clone()).await,
            Err(RegistrationError::Duplicate(id)) if id == conn.id()
        );
        assert_eq!(registry.member_count(), 1);
    }

    #[tokio::test]
    async fn broadcast_excludes_sender() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = make_connection_with_rx(&registry, 8);
        let (b, mut rx_b) = make_connection_with_rx(&registry, 8);
        let (c, mut rx_c) = make_connection_with_rx(&registry, 8);
        for conn in [&a, &b, &c] {
            registry.add(conn.clone()).await.unwrap();
        }

        let report = registry.broadcast_except(&chat(1), Some(a.id())).await;
        assert_eq!(report.recipients, 2);
        assert_eq!(report.delivered(), 2);

        assert!(rx_a.try_recv().is_err());
        assert_eq!(
            rx_b.try_recv().unwrap().as_str(),
            r#"{"type":"chat","from":"1","message":"hi"}"#
        );
        assert!(rx_c.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn recipients_share_one_encoded_frame() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = make_connection_with_rx(&registry, 8);
        let (b, mut rx_b) = make_connection_with_rx(&registry, 8);
        let (c, mut rx_c) = make_connection_with_rx(&registry, 8);
        for conn in [&a, &b, &c] {
            registry.add(conn.clone()).await.unwrap();
        }

        let _ = registry.broadcast_except(&chat(7), None).await;
        let frames = [
            rx_a.try_recv().unwrap(),
            rx_b.try_recv().unwrap(),
            rx_c.try_recv().unwrap(),
        ];
        for frame in &frames {
            assert_eq!(frame.as_str(), r#"{"type":"chat","from":"7","message":"hi"}"#);
            assert_eq!(frame.as_str().as_ptr(), frames[0].as_str().as_ptr());
        }
    }

    #[tokio::test]
    async fn broadcast_without_exclusion_reaches_everyone() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = make_connection_with_rx(&registry, 8);
        let (b, mut rx_b) = make_connection_with_rx(&registry, 8);
        registry.add(a).await.unwrap();
        registry.add(b).await.unwrap();

        let report = registry.broadcast_except(&chat(0), None).await;
        assert_eq!(report.recipients, 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn broadcast_to_empty_registry() {
        let registry = ConnectionRegistry::new();
        let report = registry.broadcast_except(&chat(1), None).await;
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn failed_member_does_not_abort_broadcast() {
        let (logs, _guard) = capture_logs();
        let registry = ConnectionRegistry::new();
        let (closed, closed_rx) = make_connection_with_rx(&registry, 8);
        let (full, _full_rx) = make_connection_with_rx(&registry, 1);
        let (healthy, mut healthy_rx) = make_connection_with_rx(&registry, 8);
        drop(closed_rx);
        full.send("filler".into()).unwrap();
        for conn in [&closed, &full, &healthy] {
            registry.add(conn.clone()).await.unwrap();
        }

        let report = registry.broadcast_except(&chat(42), None).await;
        assert_eq!(report.recipients, 3);
        assert_eq!(report.failed, 2);
        assert_eq!(report.delivered(), 1);
        assert!(healthy_rx.try_recv().is_ok());

        // Failing members stay registered
        assert_eq!(registry.member_count(), 3);
        assert!(registry.contains(closed.id()).await);
        assert!(registry.contains(full.id()).await);
        assert_eq!(logs.count_at_level(Level::WARN), 2);
    }

    #[tokio::test]
    async fn removed_member_misses_later_broadcasts() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = make_connection_with_rx(&registry, 8);
        let (b, mut rx_b) = make_connection_with_rx(&registry, 8);
        let (c, mut rx_c) = make_connection_with_rx(&registry, 8);
        for conn in [&a, &b, &c] {
            registry.add(conn.clone()).await.unwrap();
        }

        let _ = registry.remove(b.id()).await;
        let report = registry.broadcast_except(&chat(1), Some(a.id())).await;
        assert_eq!(report.recipients, 1);
        assert!(rx_b.try_recv().is_err());
        assert!(rx_c.try_recv().is_ok());
    }

    #[tokio::test]
    async fn member_ids_lists_members() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = make_connection_with_rx(&registry, 8);
        let (b, _rx_b) = make_connection_with_rx(&registry, 8);
        registry.add(a.clone()).await.unwrap();
        registry.add(b.clone()).await.unwrap();

        let mut ids = registry.member_ids().await;
        ids.sort();
        assert_eq!(ids, vec![a.id(), b.id()]);
    }

    #[tokio::test]
    async fn identities_are_unique() {
        let registry = ConnectionRegistry::default();
        let first = registry.next_connection_id();
        let second = registry.next_connection_id();
        assert_ne!(first, second);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_membership_changes_during_broadcast() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut receivers = Vec::new();
        let mut conns = Vec::new();
        for _ in 0..32 {
            let (conn, rx) = make_connection_with_rx(&registry, 256);
            registry.add(conn.clone()).await.unwrap();
            conns.push(conn);
            receivers.push(rx);
        }

        let broadcaster = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    let _ = registry.broadcast_except(&chat(i), None).await;
                }
            })
        };
        let remover = {
            let registry = registry.clone();
            let ids: Vec<_> = conns.iter().map(|c| c.id()).collect();
            tokio::spawn(async move {
                for id in ids {
                    let _ = registry.remove(id).await;
                    let _ = registry.remove(id).await;
                }
            })
        };

        broadcaster.await.unwrap();
        remover.await.unwrap();
        assert_eq!(registry.member_count(), 0);
        for rx in &mut receivers {
            while let Ok(frame) = rx.try_recv() {
                assert!(frame.as_str().starts_with(r#"{"type":"chat""#));
            }
        }
    }
}
