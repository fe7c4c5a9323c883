mod common;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use serde_json::{Value, json};
use tower::ServiceExt;

use common::{FakeRuntime, Harness};

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn start(app: &Router, project: &str, username: &str) -> (StatusCode, Value) {
    call(
        app,
        Method::POST,
        "/api/demo/sessions",
        Some(json!({ "project": project, "username": username })),
    )
    .await
}

#[tokio::test]
async fn test_health() {
    let h = Harness::new().await;
    let (status, body) = call(&h.app(), Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_session_lifecycle_over_http() {
    let h = Harness::new().await;
    let app = h.app();

    let (status, started) = start(&app, "demo-app", "alice").await;
    assert_eq!(status, StatusCode::CREATED);
    let session_id = started["sessionId"].as_str().unwrap().to_string();
    assert!(started["hostPort"].as_u64().unwrap() > 0);
    assert_eq!(started["credentials"]["username"], "alice");

    let (status, view) = call(&app, Method::GET, &format!("/api/demo/sessions/{session_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["state"], "running");
    assert_eq!(view["projectName"], "demo-app");

    let (status, list) = call(&app, Method::GET, "/api/demo/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, creds) = call(
        &app,
        Method::POST,
        &format!("/api/demo/sessions/{session_id}/switch"),
        Some(json!({ "username": "bob" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(creds["username"], "bob");

    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/api/demo/sessions/{session_id}/activity"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, history) = call(
        &app,
        Method::GET,
        &format!("/api/demo/sessions/{session_id}/history"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(history.as_array().unwrap().len() >= 6);

    let (status, _) = call(&app, Method::DELETE, &format!("/api/demo/sessions/{session_id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // A second delete is a no-op.
    let (status, _) = call(&app, Method::DELETE, &format!("/api/demo/sessions/{session_id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, stats) = call(&app, Method::GET, "/api/demo/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["totalSessions"], 1);
    assert_eq!(stats["activeSessions"], 0);
}

#[tokio::test]
async fn test_error_statuses() {
    let h = Harness::new().await;
    let app = h.app();

    let (status, body) = start(&app, "demo-app", "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    let (status, body) = start(&app, "missing", "alice").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, _) = call(&app, Method::GET, "/api/demo/sessions/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = start(&app, "demo-app", "alice").await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, body) = start(&app, "demo-app", "alice").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");
}

#[tokio::test]
async fn test_start_failure_is_internal_error() {
    let h = Harness::new().await;
    FakeRuntime::set(&h.runtime.fail_start, true);

    let (status, body) = start(&h.app(), "demo-app", "alice").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("failed to start"));
}

#[tokio::test]
async fn test_freeze_endpoints() {
    let h = Harness::new().await;
    let app = h.app();
    let (_, started) = start(&app, "demo-app", "alice").await;
    let session_id = started["sessionId"].as_str().unwrap();

    let (status, view) = call(
        &app,
        Method::POST,
        &format!("/api/demo/sessions/{session_id}/freeze"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["frozen"], true);

    let (status, view) = call(
        &app,
        Method::POST,
        &format!("/api/demo/sessions/{session_id}/unfreeze"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["frozen"], false);

    let (status, stats) = call(
        &app,
        Method::GET,
        &format!("/api/demo/sessions/{session_id}/stats"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["Pids"], "3");
}

#[tokio::test]
async fn test_manual_sweep() {
    let h = Harness::new().await;
    h.runtime
        .plant("vitrine-demo-app-0b7e3c52-4f7e-4c1a-8d0e-2b9a6f1d3c44");

    let (status, report) = call(&h.app(), Method::POST, "/api/demo/sweep", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["orphansRemoved"], 1);
    assert_eq!(report["terminated"], 0);
}
