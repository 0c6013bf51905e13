//! Immutable domain events and their canonical wire form.
//!
//! An [`EventLogEntry`] is created once, stored in the per-session log, and
//! never mutated. Serialization happens at exactly one boundary: the derived
//! serde impls persist the full record, and [`EventLogEntry::to_wire`]
//! projects the SSE `data:` payload. Producers and consumers share these two
//! shapes; there is no ad hoc field mapping elsewhere.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::types::SessionId;

/// Event kind routed to scroll-position binders.
pub const SCROLL_EVENT: &str = "scroll";

/// Event kind routed to highlight-overlay binders.
pub const HIGHLIGHT_EVENT: &str = "highlight";

/// Event emitted once per stream immediately after the SSE handshake.
pub const HANDSHAKE_EVENT: &str = "handshake_complete";

/// One immutable domain event in a session's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// Globally unique id used for idempotent de-duplication.
    pub event_id: String,
    /// Session whose log owns this entry.
    pub session_id: SessionId,
    /// Per-session monotonically increasing position. Not required to be
    /// contiguous at write time.
    pub sequence: u64,
    /// Domain kind, e.g. `scroll` or `highlight`.
    pub event_type: String,
    /// Opaque structured payload.
    pub payload: Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Instant after which the entry is invisible to reads and eligible for
    /// deletion by the expiry sweep.
    pub expires_at: DateTime<Utc>,
}

impl EventLogEntry {
    /// Builds an entry with a server-generated `event_id`.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        sequence: u64,
        event_type: impl Into<String>,
        payload: Value,
        ttl: Duration,
    ) -> Self {
        Self::with_event_id(
            uuid::Uuid::new_v4().to_string(),
            session_id,
            sequence,
            event_type,
            payload,
            ttl,
        )
    }

    /// Builds an entry with a caller-supplied `event_id`.
    #[must_use]
    pub fn with_event_id(
        event_id: impl Into<String>,
        session_id: SessionId,
        sequence: u64,
        event_type: impl Into<String>,
        payload: Value,
        ttl: Duration,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            event_id: event_id.into(),
            session_id,
            sequence,
            event_type: event_type.into(),
            payload,
            created_at,
            expires_at: created_at + ttl,
        }
    }

    /// Whether the entry has passed its expiry instant.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Canonical SSE `data:` projection.
    ///
    /// `contract_version` is attached only on frames that negotiate protocol
    /// state (the handshake); ordinary event frames omit it.
    #[must_use]
    pub fn to_wire(&self, contract_version: Option<&str>) -> Value {
        let mut frame = json!({
            "event_id": self.event_id,
            "sequence": self.sequence,
            "event_type": self.event_type,
            "payload": self.payload,
        });
        if let (Some(version), Some(map)) = (contract_version, frame.as_object_mut()) {
            map.insert("contract_version".to_string(), Value::String(version.to_string()));
        }
        frame
    }
}

/// Converts a fractional-hours TTL (the configuration unit) into a duration.
#[must_use]
pub fn ttl_from_hours(hours: f64) -> Duration {
    let seconds = (hours * 3600.0).max(0.0);
    Duration::milliseconds((seconds * 1000.0) as i64)
}
