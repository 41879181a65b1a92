//! Stopping the accept loop and every open session from one token.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long [`ShutdownCoordinator::graceful_shutdown`] waits when no timeout is given.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the hub's root cancellation token.
///
/// The accept loop waits on [`token`](Self::token). Each session gets a
/// [`session_token`](Self::session_token) child, which it may cancel on its
/// own when the socket closes without touching the root.
pub struct ShutdownCoordinator {
    root: CancellationToken,
}

impl ShutdownCoordinator {
    /// Coordinator with a fresh root token.
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Coordinator driven by a token the caller cancels.
    pub fn with_token(root: CancellationToken) -> Self {
        Self { root }
    }

    /// The root token.
    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// A token cancelled with the root, or on its own.
    pub fn session_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Cancel the root token. Idempotent.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    /// Whether [`shutdown`](Self::shutdown) has happened.
    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Cancel, then wait up to `timeout` for `tasks`.
    ///
    /// Returns `false` if some task was still running when the timeout hit.
    pub async fn graceful_shutdown<T>(
        &self,
        tasks: impl IntoIterator<Item = JoinHandle<T>>,
        timeout: Option<Duration>,
    ) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        let tasks: Vec<_> = tasks.into_iter().collect();
        self.shutdown();
        info!(tasks = tasks.len(), ?timeout, "draining tasks");

        match tokio::time::timeout(timeout, futures::future::join_all(tasks)).await {
            Ok(_) => true,
            Err(_) => {
                warn!(?timeout, "tasks still running after shutdown timeout");
                false
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
