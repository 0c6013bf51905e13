//! Session-scoped real-time event synchronization core.
//!
//! Keeps multiple browser panels of one collaborative review session
//! consistent over a lossy, long-lived stream: an append-only per-session
//! [`log::EventLog`] that owns sequencing, TTL expiry, and FIFO retention; a
//! [`registry::SessionRegistry`] that bounds concurrent connections per
//! session; a [`gap::GapTracker`] that classifies delivery discontinuities
//! and walks them through a lifecycle; and a [`binder::BinderRouter`] that
//! hands validated, in-order events to the UI binding layer.
//!
//! ## Ordering model
//!
//! - Sequences are per-session, monotonic, and assigned under a per-session
//!   critical section, so concurrent publishers never collide.
//! - Every subscriber of a session's live tail observes events in
//!   non-decreasing sequence order; replay reads are strictly ascending.
//! - There is no cross-session ordering guarantee.
//!
//! ## Bounded growth
//!
//! Stored events expire by TTL and are FIFO-evicted past a per-session cap;
//! sessions accept at most a fixed number of live connections; closed gap
//! records age out of a 24-hour history. Nothing grows without bound under
//! continuous event production.

#![warn(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::unimplemented,
    clippy::todo
)]
#![deny(clippy::unwrap_in_result, clippy::panic_in_result_fn)]

pub mod binder;
pub mod config;
pub mod event;
pub mod gap;
pub mod log;
pub mod registry;
pub mod types;

pub use binder::{BinderRouter, PanelBinder};
pub use config::SyncConfig;
pub use event::{EventLogEntry, HANDSHAKE_EVENT, HIGHLIGHT_EVENT, SCROLL_EVENT, ttl_from_hours};
pub use gap::{
    GapLifecycle, GapMetadata, GapReport, GapSeverity, GapStatistics, GapTracker, SeverityCounts,
};
pub use log::{EventLog, LogStats};
pub use registry::{Connection, ConnectionStatus, RegistryStats, Session, SessionRegistry};
pub use types::{SessionId, SessionIdError};

/// Protocol contract version negotiated at the SSE handshake.
pub const CONTRACT_VERSION: &str = "1.0.0";
