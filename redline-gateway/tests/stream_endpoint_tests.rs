//! Tests for the SSE subscribe endpoint: handshake, protocol gating,
//! connection caps, and live push.

use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
    response::Response,
};
use futures::StreamExt;
use redline_gateway::api::{ApiState, create_api_routes};
use redline_core::SyncConfig;
use serde_json::json;
use tower::ServiceExt;

fn create_test_router() -> Router {
    create_api_routes().with_state(ApiState::new(SyncConfig::default()))
}

/// Helper to issue a subscribe request with optional headers.
async fn subscribe_request(
    app: &Router,
    session: &str,
    accept: Option<&str>,
    client_version: Option<&str>,
) -> Response<Body> {
    let mut request = Request::builder()
        .method(Method::GET)
        .uri(format!("/stream/{session}"))
        .header("Cache-Control", "no-cache");
    if let Some(accept) = accept {
        request = request.header("Accept", accept);
    }
    if let Some(version) = client_version {
        request = request.header("X-Client-Version", version);
    }

    app.clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

/// Reads body chunks until `needle` appears or the attempt budget runs out.
async fn read_until(response: Response<Body>, needle: &str) -> String {
    let mut stream = response.into_body().into_data_stream();
    let mut collected = String::new();
    for _ in 0..10 {
        let Ok(Some(chunk)) = tokio::time::timeout(Duration::from_secs(2), stream.next()).await
        else {
            break;
        };
        collected.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
        if collected.contains(needle) {
            break;
        }
    }
    collected
}

#[tokio::test]
async fn subscribe_without_accept_header_is_rejected() {
    let app = create_test_router();

    let response = subscribe_request(&app, "review-1", None, None).await;
    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);

    let response = subscribe_request(&app, "review-1", Some("application/json"), None).await;
    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
}

#[tokio::test]
async fn subscribe_opens_stream_and_sends_handshake() {
    let app = create_test_router();

    let response = subscribe_request(&app, "review-1", Some("text/event-stream"), None).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let body = read_until(response, "handshake_complete").await;
    assert!(body.contains("event: handshake_complete"));
    assert!(body.contains("contract_version"));
    assert!(body.contains("connection_id"));
}

#[tokio::test]
async fn subscribe_rejects_stale_client_versions() {
    let app = create_test_router();

    let response =
        subscribe_request(&app, "review-1", Some("text/event-stream"), Some("0.0.1")).await;
    assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
}

#[tokio::test]
async fn subscribe_accepts_current_client_versions() {
    let app = create_test_router();

    let response =
        subscribe_request(&app, "review-1", Some("text/event-stream"), Some("1.2.0")).await;
    assert_eq!(response.status(), StatusCode::OK);
    drop(response);
}

#[tokio::test]
async fn subscribe_rejects_unparseable_client_versions() {
    let app = create_test_router();

    let response = subscribe_request(
        &app,
        "review-1",
        Some("text/event-stream"),
        Some("latest-and-greatest"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sixth_concurrent_subscription_is_rejected() {
    let app = create_test_router();

    let mut held = Vec::new();
    for _ in 0..5 {
        let response =
            subscribe_request(&app, "review-cap", Some("text/event-stream"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        held.push(response);
    }

    let rejected = subscribe_request(&app, "review-cap", Some("text/event-stream"), None).await;
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);

    drop(held);
}

#[tokio::test]
async fn published_events_are_pushed_to_live_streams() {
    let app = create_test_router();

    let response = subscribe_request(&app, "review-live", Some("text/event-stream"), None).await;
    assert_eq!(response.status(), StatusCode::OK);

    // Give the stream worker a beat to register and hand-shake.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let publish = Request::builder()
        .method(Method::POST)
        .uri("/stream/review-live/publish")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"event_type": "scroll", "payload": {"position": 0.8}}).to_string(),
        ))
        .unwrap();
    let publish_response = app.clone().oneshot(publish).await.unwrap();
    assert_eq!(publish_response.status(), StatusCode::CREATED);

    let body = read_until(response, "\"position\":0.8").await;
    assert!(body.contains("event: scroll"));
    assert!(body.contains("\"sequence\":1"));
}

#[tokio::test]
async fn subscription_registers_connection_in_status() {
    let app = create_test_router();

    let response = subscribe_request(&app, "review-reg", Some("text/event-stream"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status_request = Request::builder()
        .method(Method::GET)
        .uri("/stream/review-reg/status")
        .body(Body::empty())
        .unwrap();
    let status_response = app.clone().oneshot(status_request).await.unwrap();
    let bytes = axum::body::to_bytes(status_response.into_body(), usize::MAX)
        .await
        .unwrap();
    let summary: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(summary["exists"], true);
    assert_eq!(summary["connections"]["total"], 1);
    assert_eq!(summary["connections"]["active"], 1);

    drop(response);
}
