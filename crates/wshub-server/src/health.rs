//! `GET /health` body.

use std::time::Instant;

use serde::Serialize;

/// Liveness and occupancy of the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    /// `"ok"` whenever the server answers.
    pub status: &'static str,
    /// Whole seconds since the server was created.
    pub uptime_secs: u64,
    /// Open WebSocket sessions, registered or not.
    pub connections: usize,
    /// Registry members.
    pub registered: usize,
}

/// Snapshot the counters into a response.
pub fn health_check(started: Instant, connections: usize, registered: usize) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_secs: started.elapsed().as_secs(),
        connections,
        registered,
    }
}
