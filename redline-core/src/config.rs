//! Tunables for the event log, registry, gap tracker, and stream gateway.

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::event::ttl_from_hours;

/// Recognized configuration knobs for one sync service instance.
///
/// Every field has a production-sensible default so a bare `[sync]` table (or
/// none at all) yields a working deployment; tests construct instances with
/// deliberately small caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Live (non-terminated) connections allowed per session.
    pub max_connections_per_session: usize,
    /// Stored events allowed per session before FIFO eviction.
    pub max_events_per_session: usize,
    /// Default entry TTL, in fractional hours.
    pub default_ttl_hours: f64,
    /// Gap width at which severity becomes WARN.
    pub gap_warn_threshold: u64,
    /// Gap width at which severity becomes CRITICAL.
    pub gap_critical_threshold: u64,
    /// Minimum `X-Client-Version` accepted at the SSE handshake.
    pub min_supported_client_version: String,
    /// Interval between SSE keepalive heartbeats, in seconds.
    pub keepalive_secs: u64,
    /// Capacity of each session's live-tail broadcast channel.
    pub tail_buffer: usize,
    /// Interval between background maintenance sweeps, in seconds.
    pub prune_interval_secs: u64,
    /// Idle time after which a session with no live connections may be
    /// purged by the administrative sweep, in seconds.
    pub session_idle_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_connections_per_session: 5,
            max_events_per_session: 1000,
            default_ttl_hours: 1.0,
            gap_warn_threshold: 3,
            gap_critical_threshold: 10,
            min_supported_client_version: "1.0.0".to_string(),
            keepalive_secs: 15,
            tail_buffer: 256,
            prune_interval_secs: 60,
            session_idle_timeout_secs: 3600,
        }
    }
}

impl SyncConfig {
    /// Default TTL as a duration.
    #[must_use]
    pub fn default_ttl(&self) -> ChronoDuration {
        ttl_from_hours(self.default_ttl_hours)
    }

    /// SSE keepalive heartbeat interval.
    #[must_use]
    pub const fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Background maintenance sweep interval.
    #[must_use]
    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }

    /// Idle threshold for the administrative session purge.
    #[must_use]
    pub const fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }
}
