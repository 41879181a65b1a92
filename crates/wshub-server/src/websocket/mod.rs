//! WebSocket connection state, the authenticated-member registry, and the
//! per-socket session loop.

pub mod connection;
pub mod registry;
pub mod session;
