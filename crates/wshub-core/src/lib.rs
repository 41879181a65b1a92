//! # wshub-core
//!
//! Shared vocabulary for the wshub crates.
//!
//! - **Connection identity**: [`ids::ConnectionId`], an opaque comparable handle
//!   assigned when a socket is accepted, and the per-registry generator that hands
//!   them out
//! - **Logging**: [`logging::init_subscriber`] for the process-wide `tracing`
//!   subscriber, plus log-capture helpers for tests

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;

pub use ids::{ConnectionId, ConnectionIdGenerator};
