//! Session and connection registry with per-session concurrency limits.
//!
//! Tracks every review session and its live SSE connections. The registry
//! enforces the per-session connection cap, purges terminated connections
//! opportunistically, and provides the administrative idle-session sweep.
//! Connection telemetry (`last_sequence`, `events_sent`) is advisory: a
//! reconnecting client must still request replay explicitly rather than
//! trusting the server to resume for it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::types::SessionId;

/// Connection lifecycle: Inactive → Active → Terminated; Terminated is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionStatus {
    /// Registered but not yet through the handshake, or frozen by a pause.
    Inactive = 0,
    /// Handshake complete; receiving live events.
    Active = 1,
    /// Disconnected or errored; terminal.
    Terminated = 2,
}

impl From<u8> for ConnectionStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Active,
            2 => Self::Terminated,
            _ => Self::Inactive,
        }
    }
}

/// One live SSE stream bound to a session.
///
/// Status and counters are atomics so the stream-driving task, the registry,
/// and diagnostics readers can share a connection without locking.
#[derive(Debug)]
pub struct Connection {
    connection_id: String,
    status: AtomicU8,
    connected_at: DateTime<Utc>,
    last_sequence: AtomicU64,
    events_sent: AtomicU64,
}

impl Connection {
    /// Creates a connection in the `Inactive` state with a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            status: AtomicU8::new(ConnectionStatus::Inactive as u8),
            connected_at: Utc::now(),
            last_sequence: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
        }
    }

    /// Unique connection identifier.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from(self.status.load(Ordering::SeqCst))
    }

    /// Moves the connection to `new_status`.
    ///
    /// `Terminated` is final: once there, every transition attempt returns
    /// `false` and leaves the state unchanged.
    pub fn set_status(&self, new_status: ConnectionStatus) -> bool {
        let mut current = self.status.load(Ordering::SeqCst);
        loop {
            if ConnectionStatus::from(current) == ConnectionStatus::Terminated {
                return false;
            }
            match self.status.compare_exchange(
                current,
                new_status as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Timestamp the connection was registered.
    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Highest sequence delivered on this connection (advisory telemetry).
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::SeqCst)
    }

    /// Total events delivered on this connection.
    #[must_use]
    pub fn events_sent(&self) -> u64 {
        self.events_sent.load(Ordering::SeqCst)
    }

    /// Records one delivered event.
    pub fn record_delivery(&self, sequence: u64) {
        self.last_sequence.fetch_max(sequence, Ordering::SeqCst);
        self.events_sent.fetch_add(1, Ordering::SeqCst);
    }

    /// Whether the connection still counts against the session's cap.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.status() != ConnectionStatus::Terminated
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

/// One collaborative review session and its connection set.
#[derive(Debug)]
pub struct Session {
    session_id: SessionId,
    user_id: Option<String>,
    created_at: DateTime<Utc>,
    /// Millisecond timestamp, atomic so saves need no lock.
    updated_at: AtomicI64,
    connections: RwLock<Vec<Arc<Connection>>>,
}

impl Session {
    fn new(session_id: SessionId, user_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            user_id,
            created_at: now,
            updated_at: AtomicI64::new(now.timestamp_millis()),
            connections: RwLock::new(Vec::new()),
        }
    }

    /// Session identifier.
    #[must_use]
    pub const fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Owning user, when known.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last save/touch timestamp.
    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.updated_at.load(Ordering::SeqCst))
            .unwrap_or(self.created_at)
    }

    fn touch(&self) {
        self.updated_at
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    /// Snapshot of every registered connection, terminated included.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().clone()
    }

    fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.updated_at())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Aggregate registry counters for diagnostics endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Sessions currently tracked.
    pub total_sessions: usize,
    /// Connections currently registered, any status.
    pub total_connections: usize,
    /// Connections with status `Active`.
    pub active_connections: usize,
}

/// Registry of sessions and their live connections.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    max_connections_per_session: usize,
}

impl SessionRegistry {
    /// Creates a registry enforcing `max_connections_per_session`.
    #[must_use]
    pub fn new(max_connections_per_session: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_connections_per_session: max_connections_per_session.max(1),
        }
    }

    /// Creates (or replaces) a session record.
    pub fn create_session(&self, session_id: SessionId, user_id: Option<String>) -> Arc<Session> {
        let session = Arc::new(Session::new(session_id.clone(), user_id));
        self.sessions.insert(session_id, Arc::clone(&session));
        session
    }

    /// Looks up a session.
    #[must_use]
    pub fn get_session(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the existing session or creates one on first reference.
    pub fn get_or_create_session(&self, session_id: &SessionId) -> Arc<Session> {
        self.sessions
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Session::new(session_id.clone(), None)))
            .clone()
    }

    /// Persists the session record, refreshing its `updated_at`.
    ///
    /// The in-memory store shares state by reference, so a save is a touch;
    /// the method exists so call sites mark their mutation points explicitly.
    pub fn save_session(&self, session: &Session) {
        session.touch();
    }

    /// Registers a connection on a session.
    ///
    /// Terminated connections are purged first; the insert is rejected (no
    /// mutation beyond the purge) when it would push the live count past the
    /// per-session cap.
    pub fn add_connection(&self, session: &Session, connection: Arc<Connection>) -> bool {
        let mut connections = session.connections.write();
        connections.retain(|existing| existing.is_live());
        if connections.len() >= self.max_connections_per_session {
            info!(
                session = %session.session_id(),
                limit = self.max_connections_per_session,
                "connection rejected: session at capacity"
            );
            return false;
        }
        debug!(
            session = %session.session_id(),
            connection = connection.connection_id(),
            "connection registered"
        );
        connections.push(connection);
        drop(connections);
        session.touch();
        true
    }

    /// Unregisters a connection wherever it lives. Returns `false` when the
    /// id is unknown.
    pub fn remove_connection(&self, connection_id: &str) -> bool {
        for session in self.sessions.iter() {
            let mut connections = session.connections.write();
            let before = connections.len();
            connections.retain(|conn| conn.connection_id() != connection_id);
            if connections.len() < before {
                return true;
            }
        }
        false
    }

    /// Applies a status transition to a connection by id.
    ///
    /// Returns `false` when the id is unknown or the transition is rejected
    /// (the terminated state is final).
    pub fn update_connection_status(&self, connection_id: &str, status: ConnectionStatus) -> bool {
        self.find_connection(connection_id)
            .is_some_and(|connection| connection.set_status(status))
    }

    /// Looks up a connection by id across all sessions.
    #[must_use]
    pub fn find_connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        for session in self.sessions.iter() {
            let connections = session.connections.read();
            if let Some(found) = connections
                .iter()
                .find(|conn| conn.connection_id() == connection_id)
            {
                return Some(Arc::clone(found));
            }
        }
        None
    }

    /// Connections on the session with status `Active`.
    #[must_use]
    pub fn active_connections(&self, session: &Session) -> Vec<Arc<Connection>> {
        session
            .connections
            .read()
            .iter()
            .filter(|conn| conn.status() == ConnectionStatus::Active)
            .cloned()
            .collect()
    }

    /// Deletes a session and, with it, every registered connection.
    pub fn delete_session(&self, session_id: &SessionId) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Administrative sweep: removes sessions idle past `timeout` that hold
    /// no live connections. Event traffic alone never triggers this; the
    /// maintenance task decides when to call it.
    pub fn purge_idle_sessions(&self, timeout: Duration) -> usize {
        let now = Utc::now();
        let idle: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                session.idle_for(now) > timeout
                    && !session.connections.read().iter().any(|c| c.is_live())
            })
            .map(|entry| entry.key().clone())
            .collect();

        let purged = idle.len();
        for session_id in idle {
            self.sessions.remove(&session_id);
            info!(session = %session_id, "idle session purged");
        }
        purged
    }

    /// Aggregate counters across all sessions.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut total_connections = 0;
        let mut active_connections = 0;
        for session in self.sessions.iter() {
            let connections = session.connections.read();
            total_connections += connections.len();
            active_connections += connections
                .iter()
                .filter(|conn| conn.status() == ConnectionStatus::Active)
                .count();
        }
        RegistryStats {
            total_sessions: self.sessions.len(),
            total_connections,
            active_connections,
        }
    }
}
