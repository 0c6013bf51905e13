//! Tests for the gateway's request/response endpoints.
//!
//! Covers publish ingestion, replay ranges, session status, and the health
//! probe, with the protocol error codes the wire contract promises.

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use redline_gateway::api::{ApiState, create_api_routes};
use redline_core::SyncConfig;
use serde_json::{Value, json};
use tower::ServiceExt; // for `oneshot`

/// Create a test router with API routes
fn create_test_router() -> Router {
    create_test_router_with(SyncConfig::default())
}

fn create_test_router_with(config: SyncConfig) -> Router {
    create_api_routes().with_state(ApiState::new(config))
}

/// Helper to make HTTP requests
async fn make_request(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");

    let request = if let Some(body) = body {
        request.body(Body::from(body.to_string()))
    } else {
        request.body(Body::empty())
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap_or_else(|_| json!({}));

    (status, json)
}

async fn publish_event(app: &Router, session: &str, body: Value) -> (StatusCode, Value) {
    make_request(
        app,
        Method::POST,
        &format!("/stream/{session}/publish"),
        Some(body),
    )
    .await
}

#[tokio::test]
async fn publish_assigns_event_id_and_sequence() {
    let app = create_test_router();

    let (status, response) = publish_event(
        &app,
        "review-1",
        json!({"event_type": "scroll", "payload": {"position": 0.25}}),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(response["sequence"], 1);
    assert!(response["event_id"].as_str().is_some());

    let (status, response) = publish_event(
        &app,
        "review-1",
        json!({"event_type": "highlight", "payload": {"clause": "7.2"}}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(response["sequence"], 2);
}

#[tokio::test]
async fn publish_sequences_are_per_session() {
    let app = create_test_router();

    let (_, first) = publish_event(&app, "review-a", json!({"event_type": "scroll"})).await;
    let (_, second) = publish_event(&app, "review-b", json!({"event_type": "scroll"})).await;

    assert_eq!(first["sequence"], 1);
    assert_eq!(second["sequence"], 1);
}

#[tokio::test]
async fn publish_rejects_malformed_bodies() {
    let app = create_test_router();

    // Not JSON at all.
    let request = Request::builder()
        .method(Method::POST)
        .uri("/stream/review-1/publish")
        .header("content-type", "application/json")
        .body(Body::from("not json"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Missing event_type.
    let (status, response) = publish_event(&app, "review-1", json!({"payload": {}})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error"]["code"], "MALFORMED_BODY");

    // Blank event_type.
    let (status, _) = publish_event(&app, "review-1", json!({"event_type": "  "})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn replay_requires_from_seq() {
    let app = create_test_router();

    let (status, response) =
        make_request(&app, Method::GET, "/stream/review-1/replay", None).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error"]["code"], "MISSING_FROM_SEQ");
    assert!(
        response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("from_seq")
    );
}

#[tokio::test]
async fn publish_then_replay_returns_ordered_backlog() {
    let app = create_test_router();

    for index in 0..5 {
        let (status, _) = publish_event(
            &app,
            "review-e2e",
            json!({"event_type": "scroll", "payload": {"index": index}}),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, response) =
        make_request(&app, Method::GET, "/stream/review-e2e/replay?from_seq=1", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["count"], 5);
    let sequences: Vec<u64> = response["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|frame| frame["sequence"].as_u64().unwrap())
        .collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn replay_honors_inclusive_range() {
    let app = create_test_router();
    for _ in 0..5 {
        publish_event(&app, "review-range", json!({"event_type": "scroll"})).await;
    }

    let (status, response) = make_request(
        &app,
        Method::GET,
        "/stream/review-range/replay?from_seq=2&to_seq=4",
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["count"], 3);
    let sequences: Vec<u64> = response["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|frame| frame["sequence"].as_u64().unwrap())
        .collect();
    assert_eq!(sequences, vec![2, 3, 4]);
}

#[tokio::test]
async fn replay_of_unknown_session_is_empty() {
    let app = create_test_router();

    let (status, response) =
        make_request(&app, Method::GET, "/stream/no-such/replay?from_seq=1", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["count"], 0);
}

#[tokio::test]
async fn status_never_errors_for_unknown_sessions() {
    let app = create_test_router();

    let (status, response) =
        make_request(&app, Method::GET, "/stream/unknown/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["exists"], false);

    // Even a malformed id reports non-existence instead of failing.
    let (status, response) =
        make_request(&app, Method::GET, "/stream/bad%20id/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["exists"], false);
}

#[tokio::test]
async fn status_reports_session_summary_after_publish() {
    let app = create_test_router();
    publish_event(&app, "review-status", json!({"event_type": "scroll"})).await;
    publish_event(&app, "review-status", json!({"event_type": "scroll"})).await;

    let (status, response) =
        make_request(&app, Method::GET, "/stream/review-status/status", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["exists"], true);
    assert_eq!(response["latest_sequence"], 2);
    assert_eq!(response["connections"]["total"], 0);
    assert!(response["created_at"].is_string());
}

#[tokio::test]
async fn health_reports_aggregate_statistics() {
    let app = create_test_router();
    publish_event(&app, "review-h1", json!({"event_type": "scroll"})).await;
    publish_event(&app, "review-h2", json!({"event_type": "scroll"})).await;

    let (status, response) = make_request(&app, Method::GET, "/stream/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "healthy");
    assert!(response["contract_version"].is_string());
    assert_eq!(response["events"]["total_events"], 2);
    assert_eq!(response["events"]["sessions_with_events"], 2);
    assert_eq!(response["sessions"]["total_sessions"], 2);
    assert_eq!(response["gaps"]["total_active"], 0);
}

#[tokio::test]
async fn fifo_eviction_bounds_replayable_backlog() {
    let config = SyncConfig {
        max_events_per_session: 10,
        ..SyncConfig::default()
    };
    let app = create_test_router_with(config);

    for _ in 0..15 {
        publish_event(&app, "review-cap", json!({"event_type": "scroll"})).await;
    }

    let (status, response) =
        make_request(&app, Method::GET, "/stream/review-cap/replay?from_seq=1", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["count"], 10);
    let first = response["events"][0]["sequence"].as_u64().unwrap();
    assert_eq!(first, 6);
}

#[tokio::test]
async fn openapi_document_is_served() {
    let app = create_test_router();

    let (status, response) =
        make_request(&app, Method::GET, "/api-docs/openapi.json", None).await;

    assert_eq!(status, StatusCode::OK);
    assert!(response["paths"]["/stream/{session_id}"].is_object());
    assert!(response["paths"]["/stream/{session_id}/publish"].is_object());
}
