//! Per-session append-only event log with TTL expiry and FIFO retention.
//!
//! The log is the single authority for sequence assignment and replay. Each
//! session's entries live behind one `RwLock`, so mutations (append, evict,
//! prune) are serialized per session while reads take a consistent snapshot.
//! Live push rides on a per-session `tokio::sync::broadcast` channel whose
//! sends happen inside the same critical section as the append, which is what
//! gives every subscriber a non-decreasing sequence order.
//!
//! Gap detection is computed from the *stored set*, not an assumed contiguous
//! index: TTL expiry and FIFO eviction can remove the middle of a range, and
//! callers may append non-contiguous sequences to begin with.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::SyncConfig;
use crate::event::EventLogEntry;
use crate::types::SessionId;

/// Aggregate counters for diagnostics endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LogStats {
    /// Non-expired entries across all sessions.
    pub total_events: usize,
    /// Sessions currently holding at least one non-expired entry.
    pub sessions_with_events: usize,
}

struct LogState {
    by_sequence: BTreeMap<u64, Arc<EventLogEntry>>,
    event_ids: HashSet<String>,
    /// Next sequence handed out by [`EventLog::publish`]. Tracks one past the
    /// highest sequence ever appended, so caller-assigned and server-assigned
    /// sequences never collide.
    next_sequence: u64,
}

struct SessionLog {
    state: RwLock<LogState>,
    tail: broadcast::Sender<Arc<EventLogEntry>>,
}

impl SessionLog {
    fn new(tail_buffer: usize) -> Self {
        let (tail, _) = broadcast::channel(tail_buffer.max(1));
        Self {
            state: RwLock::new(LogState {
                by_sequence: BTreeMap::new(),
                event_ids: HashSet::new(),
                next_sequence: 1,
            }),
            tail,
        }
    }
}

/// Append-only event store keyed by session.
pub struct EventLog {
    sessions: DashMap<SessionId, Arc<SessionLog>>,
    max_events_per_session: usize,
    tail_buffer: usize,
    default_ttl: Duration,
}

impl EventLog {
    /// Creates a log using the retention and buffering knobs of `config`.
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            max_events_per_session: config.max_events_per_session,
            tail_buffer: config.tail_buffer,
            default_ttl: config.default_ttl(),
        }
    }

    fn session_log(&self, session_id: &SessionId) -> Arc<SessionLog> {
        self.sessions
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(SessionLog::new(self.tail_buffer)))
            .clone()
    }

    /// Appends a caller-assembled entry.
    ///
    /// Returns `false` without mutating anything when the entry's `event_id`
    /// already exists in the session. When `enforce_max` is set and the
    /// session exceeds its cap afterwards, the lowest sequences are evicted
    /// until the cap is met again.
    pub fn append(&self, entry: EventLogEntry, enforce_max: bool) -> bool {
        let log = self.session_log(&entry.session_id);
        let mut state = log.state.write();
        Self::append_locked(
            &mut state,
            Arc::new(entry),
            enforce_max.then_some(self.max_events_per_session),
        )
        .is_some()
    }

    /// Appends each entry in order; non-atomic across entries.
    ///
    /// Returns the number successfully appended.
    pub fn append_batch(&self, entries: Vec<EventLogEntry>) -> usize {
        entries
            .into_iter()
            .map(|entry| self.append(entry, true))
            .filter(|appended| *appended)
            .count()
    }

    /// Assigns the session's next sequence, appends, and pushes to the live
    /// tail, all under one per-session critical section, so concurrent
    /// publishers observe unique, monotonic sequences and subscribers see
    /// sends in sequence order.
    pub fn publish(
        &self,
        session_id: &SessionId,
        event_type: impl Into<String>,
        payload: Value,
        ttl: Option<Duration>,
    ) -> Arc<EventLogEntry> {
        let log = self.session_log(session_id);
        let mut state = log.state.write();
        let sequence = state.next_sequence;
        let entry = Arc::new(EventLogEntry::new(
            session_id.clone(),
            sequence,
            event_type,
            payload,
            ttl.unwrap_or(self.default_ttl),
        ));
        // A fresh UUID cannot collide with a stored id, so this insert cannot
        // report a duplicate.
        Self::append_locked(&mut state, Arc::clone(&entry), Some(self.max_events_per_session));
        // Receiver-less sends fail harmlessly; ignore.
        let _ = log.tail.send(Arc::clone(&entry));
        entry
    }

    fn append_locked(
        state: &mut LogState,
        entry: Arc<EventLogEntry>,
        cap: Option<usize>,
    ) -> Option<Arc<EventLogEntry>> {
        if state.event_ids.contains(&entry.event_id) {
            debug!(
                session = %entry.session_id,
                event_id = %entry.event_id,
                "duplicate event id rejected"
            );
            return None;
        }
        state.event_ids.insert(entry.event_id.clone());
        state.next_sequence = state.next_sequence.max(entry.sequence.saturating_add(1));
        state.by_sequence.insert(entry.sequence, Arc::clone(&entry));

        if let Some(cap) = cap {
            while state.by_sequence.len() > cap {
                if let Some((_, evicted)) = state.by_sequence.pop_first() {
                    state.event_ids.remove(&evicted.event_id);
                } else {
                    break;
                }
            }
        }
        Some(entry)
    }

    /// All non-expired entries with `sequence >= from_seq`, ascending.
    #[must_use]
    pub fn events_from(&self, session_id: &SessionId, from_seq: u64) -> Vec<Arc<EventLogEntry>> {
        self.collect_range(session_id, from_seq, u64::MAX)
    }

    /// All non-expired entries with `from_seq <= sequence <= to_seq`, ascending.
    #[must_use]
    pub fn events_in_range(
        &self,
        session_id: &SessionId,
        from_seq: u64,
        to_seq: u64,
    ) -> Vec<Arc<EventLogEntry>> {
        self.collect_range(session_id, from_seq, to_seq)
    }

    fn collect_range(
        &self,
        session_id: &SessionId,
        from_seq: u64,
        to_seq: u64,
    ) -> Vec<Arc<EventLogEntry>> {
        if from_seq > to_seq {
            return Vec::new();
        }
        let Some(log) = self.sessions.get(session_id) else {
            return Vec::new();
        };
        let now = Utc::now();
        let state = log.state.read();
        state
            .by_sequence
            .range(from_seq..=to_seq)
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(_, entry)| Arc::clone(entry))
            .collect()
    }

    /// Highest non-expired sequence stored for the session, if any.
    #[must_use]
    pub fn latest_sequence(&self, session_id: &SessionId) -> Option<u64> {
        let log = self.sessions.get(session_id)?;
        let now = Utc::now();
        let state = log.state.read();
        state
            .by_sequence
            .iter()
            .rev()
            .find(|(_, entry)| !entry.is_expired(now))
            .map(|(sequence, _)| *sequence)
    }

    /// Maximal missing runs within `[from_seq, to_seq]`, computed from the
    /// stored (non-expired) set.
    ///
    /// Stored `{1, 2, 5, 6, 10}` scanned over `[1, 10]` yields
    /// `[(3, 4), (7, 9)]`.
    #[must_use]
    pub fn detect_gaps(
        &self,
        session_id: &SessionId,
        from_seq: u64,
        to_seq: u64,
    ) -> Vec<(u64, u64)> {
        if from_seq > to_seq {
            return Vec::new();
        }
        let mut gaps = Vec::new();
        let mut expected = from_seq;
        for entry in self.collect_range(session_id, from_seq, to_seq) {
            if entry.sequence > expected {
                gaps.push((expected, entry.sequence - 1));
            }
            expected = entry.sequence + 1;
        }
        if expected <= to_seq {
            gaps.push((expected, to_seq));
        }
        gaps
    }

    /// Deletes every entry whose expiry instant has passed.
    ///
    /// Safe to call repeatedly and concurrently with appends; each session is
    /// swept under its own write lock. Returns the number deleted.
    pub fn prune_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        for log in self.sessions.iter() {
            let mut state = log.state.write();
            let expired: Vec<u64> = state
                .by_sequence
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(sequence, _)| *sequence)
                .collect();
            for sequence in expired {
                if let Some(entry) = state.by_sequence.remove(&sequence) {
                    state.event_ids.remove(&entry.event_id);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(removed, "expired events pruned");
        }
        removed
    }

    /// Clears a session's stored entries, returning the number deleted.
    ///
    /// The session's live tail stays open; only the backlog is dropped.
    pub fn delete_session_events(&self, session_id: &SessionId) -> usize {
        let Some(log) = self.sessions.get(session_id) else {
            return 0;
        };
        let mut state = log.state.write();
        let removed = state.by_sequence.len();
        state.by_sequence.clear();
        state.event_ids.clear();
        removed
    }

    /// Subscribes to the session's live tail.
    ///
    /// The receiver observes every `publish` for the session from this point
    /// on, in sequence order. A lagging receiver gets
    /// [`broadcast::error::RecvError::Lagged`] rather than blocking the
    /// publisher.
    #[must_use]
    pub fn subscribe_tail(&self, session_id: &SessionId) -> broadcast::Receiver<Arc<EventLogEntry>> {
        self.session_log(session_id).tail.subscribe()
    }

    /// Aggregate counters over non-expired entries.
    #[must_use]
    pub fn stats(&self) -> LogStats {
        let now = Utc::now();
        let mut total_events = 0;
        let mut sessions_with_events = 0;
        for log in self.sessions.iter() {
            let state = log.state.read();
            let live = state
                .by_sequence
                .values()
                .filter(|entry| !entry.is_expired(now))
                .count();
            if live > 0 {
                sessions_with_events += 1;
                total_events += live;
            }
        }
        LogStats {
            total_events,
            sessions_with_events,
        }
    }
}
