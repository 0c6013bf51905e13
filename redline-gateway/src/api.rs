//! HTTP/SSE protocol surface for the review synchronization layer.
//!
//! The gateway composes the core components: Subscribe performs the SSE
//! handshake and joins the session's live tail, Publish ingests events into
//! the log, Replay serves historical ranges, and Status/Health report
//! session and aggregate state. Protocol failures (missing Accept header,
//! stale client version, missing `from_seq`) surface as specific status
//! codes, never generic 500s.
//!
//! ```text
//! Browser panel
//!      ↓ GET /stream/{session_id}           (SSE, long-lived)
//! StreamWorker ── per-connection push loop
//!      ↓
//! EventLog tail + SessionRegistry + GapTracker + BinderRouter
//! ```

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use utoipa::{IntoParams, OpenApi, ToSchema};

use redline_core::{
    BinderRouter, CONTRACT_VERSION, Connection, ConnectionStatus, EventLog, EventLogEntry,
    GapTracker, HANDSHAKE_EVENT, Session, SessionId, SessionIdError, SessionRegistry, SyncConfig,
    ttl_from_hours,
};

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    /// Append-only per-session event log.
    pub log: Arc<EventLog>,
    /// Session and connection registry.
    pub registry: Arc<SessionRegistry>,
    /// Gap lifecycle tracker.
    pub gaps: Arc<GapTracker>,
    /// Downstream binder fan-out.
    pub binders: Arc<BinderRouter>,
    /// Effective configuration.
    pub config: Arc<SyncConfig>,
    min_client_version: Option<Version>,
}

impl ApiState {
    /// Builds a state object with fresh core components.
    #[must_use]
    pub fn new(config: SyncConfig) -> Self {
        let min_client_version = match Version::parse(&config.min_supported_client_version) {
            Ok(version) => Some(version),
            Err(error) => {
                warn!(
                    value = %config.min_supported_client_version,
                    %error,
                    "min_supported_client_version is not valid semver; version gating disabled"
                );
                None
            }
        };
        Self {
            log: Arc::new(EventLog::new(&config)),
            registry: Arc::new(SessionRegistry::new(config.max_connections_per_session)),
            gaps: Arc::new(GapTracker::new(&config)),
            binders: Arc::new(BinderRouter::new()),
            config: Arc::new(config),
            min_client_version,
        }
    }
}

/// Builds the gateway route table.
pub fn create_api_routes() -> Router<ApiState> {
    Router::new()
        .route("/stream/health", get(health))
        .route("/stream/{session_id}", get(subscribe))
        .route("/stream/{session_id}/publish", post(publish))
        .route("/stream/{session_id}/replay", get(replay))
        .route("/stream/{session_id}/status", get(session_status))
        .route("/api-docs/openapi.json", get(openapi_spec))
}

#[derive(OpenApi)]
#[openapi(
    paths(subscribe, publish, replay, session_status, health),
    components(schemas(PublishRequest, PublishResponse, ErrorResponse)),
    info(
        title = "Redline Sync Gateway",
        description = "SSE synchronization surface for collaborative review sessions"
    )
)]
struct ApiDoc;

async fn openapi_spec() -> Json<Value> {
    Json(json!(ApiDoc::openapi()))
}

// ================================================================================================
// Error surface
// ================================================================================================

/// Wire shape of every gateway error body.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

/// Protocol and capacity errors surfaced by the gateway.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Subscribe called without the SSE Accept header.
    #[error("subscribe requires the 'Accept: text/event-stream' header")]
    NotAcceptable,

    /// Client protocol version below the supported minimum.
    #[error("client version {client} is below the supported minimum {minimum}")]
    UpgradeRequired {
        /// Version the client announced.
        client: String,
        /// Minimum the deployment accepts.
        minimum: String,
    },

    /// `X-Client-Version` was present but not parseable semver.
    #[error("X-Client-Version '{value}' is not a valid semantic version")]
    InvalidClientVersion {
        /// Raw header value.
        value: String,
    },

    /// Path segment failed session-id validation.
    #[error(transparent)]
    InvalidSessionId(#[from] SessionIdError),

    /// Replay called without its required range start.
    #[error("replay requires the from_seq query parameter")]
    MissingFromSeq,

    /// Publish body was missing, unparseable, or structurally wrong.
    #[error("malformed request body: {0}")]
    MalformedBody(String),

    /// Session already holds the maximum number of live connections.
    #[error("session {session_id} is at its connection limit ({limit})")]
    ConnectionLimit {
        /// Session that rejected the connection.
        session_id: String,
        /// Configured per-session cap.
        limit: usize,
    },
}

impl ApiError {
    const fn status(&self) -> StatusCode {
        match self {
            Self::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            Self::UpgradeRequired { .. } => StatusCode::UPGRADE_REQUIRED,
            Self::ConnectionLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::InvalidClientVersion { .. }
            | Self::InvalidSessionId(_)
            | Self::MissingFromSeq
            | Self::MalformedBody(_) => StatusCode::BAD_REQUEST,
        }
    }

    const fn code(&self) -> &'static str {
        match self {
            Self::NotAcceptable => "NOT_ACCEPTABLE",
            Self::UpgradeRequired { .. } => "CLIENT_VERSION_UNSUPPORTED",
            Self::InvalidClientVersion { .. } => "INVALID_CLIENT_VERSION",
            Self::InvalidSessionId(_) => "INVALID_SESSION_ID",
            Self::MissingFromSeq => "MISSING_FROM_SEQ",
            Self::MalformedBody(_) => "MALFORMED_BODY",
            Self::ConnectionLimit { .. } => "CONNECTION_LIMIT",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (self.status(), Json(json!({ "error": body }))).into_response()
    }
}

// ================================================================================================
// Subscribe (SSE handshake + live push)
// ================================================================================================

/// Opens a long-lived SSE stream onto a session.
///
/// Requires `Accept: text/event-stream` (406 otherwise) and, when the client
/// announces `X-Client-Version`, a version at or above the deployment
/// minimum (426 otherwise). The first frame is always `handshake_complete`
/// carrying the negotiated `contract_version`.
#[utoipa::path(
    get,
    path = "/stream/{session_id}",
    tag = "stream",
    params(("session_id" = String, Path, description = "Review session identifier")),
    responses(
        (status = 200, description = "SSE stream opened", content_type = "text/event-stream"),
        (status = 406, description = "Missing or wrong Accept header", body = ErrorResponse),
        (status = 426, description = "Client version below minimum", body = ErrorResponse),
        (status = 429, description = "Session at its connection limit", body = ErrorResponse)
    )
)]
pub async fn subscribe(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<KeepAliveStream<ReceiverStream<Result<Event, Infallible>>>>, ApiError> {
    let accepts_sse = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("text/event-stream"));
    if !accepts_sse {
        return Err(ApiError::NotAcceptable);
    }
    check_client_version(&state, &headers)?;

    let session_id = SessionId::new(session_id)?;
    let session = state.registry.get_or_create_session(&session_id);
    let connection = Arc::new(Connection::new());
    if !state.registry.add_connection(&session, Arc::clone(&connection)) {
        return Err(ApiError::ConnectionLimit {
            session_id: session_id.to_string(),
            limit: state.config.max_connections_per_session,
        });
    }

    let tail = state.log.subscribe_tail(&session_id);
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(state.config.tail_buffer.max(1));
    let keepalive = state.config.keepalive();

    let worker = StreamWorker {
        state,
        session_id,
        session,
        connection,
        tx,
    };
    tokio::spawn(worker.run(tail));

    Ok(Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::new().interval(keepalive).text("keep-alive")))
}

fn check_client_version(state: &ApiState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(minimum) = &state.min_client_version else {
        return Ok(());
    };
    let Some(raw) = headers
        .get("x-client-version")
        .and_then(|value| value.to_str().ok())
    else {
        // Version announcement is optional; absent means "trust the client".
        return Ok(());
    };
    let client = Version::parse(raw.trim()).map_err(|_| ApiError::InvalidClientVersion {
        value: raw.to_string(),
    })?;
    if client < *minimum {
        return Err(ApiError::UpgradeRequired {
            client: client.to_string(),
            minimum: minimum.to_string(),
        });
    }
    Ok(())
}

/// Drives one SSE connection: handshake, live push, freeze/resume catch-up,
/// and terminal cleanup.
struct StreamWorker {
    state: ApiState,
    session_id: SessionId,
    session: Arc<Session>,
    connection: Arc<Connection>,
    tx: mpsc::Sender<Result<Event, Infallible>>,
}

impl StreamWorker {
    async fn run(self, mut tail: broadcast::Receiver<Arc<EventLogEntry>>) {
        if !self.send_handshake().await {
            self.finish();
            return;
        }
        self.connection.set_status(ConnectionStatus::Active);
        self.state.registry.save_session(&self.session);
        info!(
            session = %self.session_id,
            connection = self.connection.connection_id(),
            "stream handshake complete"
        );

        // The tick exists to notice freeze/resume transitions and dead
        // clients during quiet periods; event delivery itself is push-based.
        let mut status_tick = tokio::time::interval(Duration::from_millis(250));
        let mut frozen = false;

        loop {
            tokio::select! {
                received = tail.recv() => match received {
                    Ok(entry) => match self.connection.status() {
                        ConnectionStatus::Terminated => break,
                        ConnectionStatus::Inactive => frozen = true,
                        ConnectionStatus::Active => {
                            if frozen {
                                // The log already stored this entry, so the
                                // catch-up read covers it.
                                if !self.catch_up().await {
                                    break;
                                }
                                frozen = false;
                            } else if !self.forward(&entry).await {
                                break;
                            }
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        if !self.recover_from_lag(skipped).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = status_tick.tick() => match self.connection.status() {
                    ConnectionStatus::Terminated => break,
                    ConnectionStatus::Inactive => frozen = true,
                    ConnectionStatus::Active => {
                        if frozen {
                            if !self.catch_up().await {
                                break;
                            }
                            frozen = false;
                        } else if self.tx.is_closed() {
                            break;
                        }
                    }
                },
            }
        }
        self.finish();
    }

    async fn send_handshake(&self) -> bool {
        let frame = json!({
            "contract_version": CONTRACT_VERSION,
            "session_id": self.session_id.as_str(),
            "connection_id": self.connection.connection_id(),
        });
        let event = Event::default().event(HANDSHAKE_EVENT).data(frame.to_string());
        self.tx.send(Ok(event)).await.is_ok()
    }

    /// Pushes one entry to the client and the binder surface.
    ///
    /// Returns `false` once the client is gone. Sequence regressions are
    /// skipped silently (catch-up overlap); forward jumps past `last + 1`
    /// are recorded as gaps but never block delivery.
    async fn forward(&self, entry: &Arc<EventLogEntry>) -> bool {
        let last = self.connection.last_sequence();
        if last > 0 && entry.sequence <= last {
            return true;
        }
        if last > 0 && entry.sequence > last + 1 {
            self.state.gaps.on_gap_detected(
                self.session_id.clone(),
                last,
                entry.sequence - 1,
                "sse_stream",
            );
        }

        let event = Event::default()
            .id(entry.sequence.to_string())
            .event(entry.event_type.as_str())
            .data(entry.to_wire(None).to_string());
        if self.tx.send(Ok(event)).await.is_err() {
            return false;
        }
        self.state
            .binders
            .dispatch(self.connection.connection_id(), entry);
        self.connection.record_delivery(entry.sequence);
        true
    }

    /// Replays the stored backlog past the connection's high-water mark.
    async fn catch_up(&self) -> bool {
        let from = self.connection.last_sequence().saturating_add(1);
        for entry in self.state.log.events_from(&self.session_id, from) {
            if !self.forward(&entry).await {
                return false;
            }
        }
        true
    }

    /// Handles a lagged broadcast receiver: records the gap, then refills
    /// from the log and resolves the gap if the backlog still covers it.
    async fn recover_from_lag(&self, skipped: u64) -> bool {
        let last = self.connection.last_sequence();
        let gap = self.state.gaps.on_gap_detected(
            self.session_id.clone(),
            last,
            last.saturating_add(skipped),
            "sse_stream",
        );
        if self.connection.status() != ConnectionStatus::Active {
            return true;
        }
        if !self.catch_up().await {
            return false;
        }
        let caught_up_to = self.connection.last_sequence();
        if caught_up_to.saturating_add(1) >= gap.end_sequence {
            self.state.gaps.resolve_gap(&gap.gap_id, caught_up_to);
        }
        true
    }

    fn finish(&self) {
        self.connection.set_status(ConnectionStatus::Terminated);
        self.state
            .binders
            .forget_connection(self.connection.connection_id());
        debug!(
            session = %self.session_id,
            connection = self.connection.connection_id(),
            events_sent = self.connection.events_sent(),
            "stream closed"
        );
    }
}

// ================================================================================================
// Publish
// ================================================================================================

/// Event submission body.
#[derive(Debug, Deserialize, ToSchema)]
pub struct PublishRequest {
    /// Domain kind, e.g. `scroll` or `highlight`.
    pub event_type: String,
    /// Opaque structured payload.
    #[serde(default)]
    pub payload: Value,
    /// Per-entry TTL override, in fractional hours.
    pub ttl_hours: Option<f64>,
}

/// Assigned identity of a published event.
#[derive(Debug, Serialize, ToSchema)]
pub struct PublishResponse {
    /// Server-generated unique event id.
    pub event_id: String,
    /// Assigned per-session sequence number.
    pub sequence: u64,
}

/// Appends one event to a session's log and pushes it to live streams.
///
/// Publish is not internally retried; a duplicate `event_id` is rejected
/// rather than double-applied, so client-side retry is safe.
#[utoipa::path(
    post,
    path = "/stream/{session_id}/publish",
    tag = "stream",
    params(("session_id" = String, Path, description = "Review session identifier")),
    request_body = PublishRequest,
    responses(
        (status = 201, description = "Event appended", body = PublishResponse),
        (status = 400, description = "Malformed body", body = ErrorResponse)
    )
)]
pub async fn publish(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    body: Result<Json<PublishRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<PublishResponse>), ApiError> {
    let Json(request) = body.map_err(|rejection| ApiError::MalformedBody(rejection.body_text()))?;
    let session_id = SessionId::new(session_id)?;
    if request.event_type.trim().is_empty() {
        return Err(ApiError::MalformedBody(
            "event_type must not be empty".to_string(),
        ));
    }

    let session = state.registry.get_or_create_session(&session_id);
    state.registry.save_session(&session);

    let ttl = request.ttl_hours.map(ttl_from_hours);
    let entry = state
        .log
        .publish(&session_id, request.event_type, request.payload, ttl);
    debug!(
        session = %session_id,
        sequence = entry.sequence,
        event_type = %entry.event_type,
        "event published"
    );

    Ok((
        StatusCode::CREATED,
        Json(PublishResponse {
            event_id: entry.event_id.clone(),
            sequence: entry.sequence,
        }),
    ))
}

// ================================================================================================
// Replay
// ================================================================================================

/// Replay range selection.
#[derive(Debug, Deserialize, IntoParams)]
pub struct ReplayParams {
    /// First sequence to return. Required.
    pub from_seq: Option<u64>,
    /// Last sequence to return, inclusive. Defaults to the end of the log.
    pub to_seq: Option<u64>,
}

/// Serves the ordered backlog for gap recovery and reconnects.
#[utoipa::path(
    get,
    path = "/stream/{session_id}/replay",
    tag = "stream",
    params(
        ("session_id" = String, Path, description = "Review session identifier"),
        ReplayParams
    ),
    responses(
        (status = 200, description = "Ordered event list"),
        (status = 400, description = "Missing from_seq", body = ErrorResponse)
    )
)]
pub async fn replay(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    Query(params): Query<ReplayParams>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::new(session_id)?;
    let Some(from_seq) = params.from_seq else {
        return Err(ApiError::MissingFromSeq);
    };

    let events = match params.to_seq {
        Some(to_seq) => state.log.events_in_range(&session_id, from_seq, to_seq),
        None => state.log.events_from(&session_id, from_seq),
    };
    let frames: Vec<Value> = events.iter().map(|entry| entry.to_wire(None)).collect();

    Ok(Json(json!({
        "session_id": session_id,
        "from_seq": from_seq,
        "to_seq": params.to_seq,
        "count": frames.len(),
        "events": frames,
    })))
}

// ================================================================================================
// Status & health
// ================================================================================================

/// Reports session existence and connection summary. Never errors: an
/// unknown (or even malformed) session id yields `exists: false`.
#[utoipa::path(
    get,
    path = "/stream/{session_id}/status",
    tag = "stream",
    params(("session_id" = String, Path, description = "Review session identifier")),
    responses((status = 200, description = "Session summary"))
)]
pub async fn session_status(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    let Ok(parsed) = SessionId::new(session_id.as_str()) else {
        return Json(json!({ "session_id": session_id, "exists": false }));
    };
    let Some(session) = state.registry.get_session(&parsed) else {
        return Json(json!({ "session_id": session_id, "exists": false }));
    };

    let connections = session.connections();
    let active = connections
        .iter()
        .filter(|c| c.status() == ConnectionStatus::Active)
        .count();
    let open_gaps = state
        .gaps
        .gap_report()
        .open_gaps
        .iter()
        .filter(|gap| gap.session_id == parsed)
        .count();

    Json(json!({
        "session_id": session_id,
        "exists": true,
        "user_id": session.user_id(),
        "created_at": session.created_at().to_rfc3339(),
        "updated_at": session.updated_at().to_rfc3339(),
        "connections": {
            "total": connections.len(),
            "active": active,
        },
        "latest_sequence": state.log.latest_sequence(&parsed),
        "open_gaps": open_gaps,
    }))
}

/// Aggregate statistics for liveness probing.
#[utoipa::path(
    get,
    path = "/stream/health",
    tag = "stream",
    responses((status = 200, description = "Service statistics"))
)]
pub async fn health(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "redline-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "contract_version": CONTRACT_VERSION,
        "timestamp": Utc::now().to_rfc3339(),
        "events": state.log.stats(),
        "sessions": state.registry.stats(),
        "gaps": state.gaps.gap_statistics(),
    }))
}
