//! Test utilities: a fake ingestion API and an app wired to it.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::Path,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde_json::{Value, json};
use tokio::net::TcpListener;

use docrelay::api::{AppState, create_router};
use docrelay::config::{RelayConfig, ServerConfig, TrackerConfig, UpstreamConfig};
use docrelay::relay::HttpUpstream;
use docrelay::tracker::ProgressClient;
use docrelay_protocol::{Frame, decode};

pub const TOKEN: &str = "secret-token";

fn authorized(headers: &HeaderMap) -> bool {
    let expected = format!("Bearer {TOKEN}");
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some(expected.as_str())
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"detail": "Not authenticated"})),
    )
        .into_response()
}

async fn bulk_ingest(headers: HeaderMap, body: String) -> Response {
    let echoed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    Json(json!({
        "ingested": 2,
        "authorized": authorized(&headers),
        "request": echoed,
    }))
    .into_response()
}

async fn invalid_upload() -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({"detail": [{"loc": ["body", "file"], "msg": "required"}]})),
    )
        .into_response()
}

async fn slow_scan() -> Response {
    tokio::time::sleep(Duration::from_millis(1500)).await;
    Json(json!({"scanned": 5})).into_response()
}

async fn binary_scan() -> Response {
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        vec![0xff_u8, 0xfe, 0x00, 0x01],
    )
        .into_response()
}

async fn broken_scan() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "").into_response()
}

fn progress(task_id: &str, batch_id: &str, status: &str, percent: f64) -> Value {
    json!({
        "task_id": task_id,
        "batch_id": batch_id,
        "filename": format!("{task_id}.pdf"),
        "status": status,
        "stage": "embedding",
        "progress_percent": percent,
        "current_step": "",
        "estimated_remaining_seconds": 12.4,
    })
}

async fn task_progress(Path(task_id): Path<String>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    match task_id.as_str() {
        "t1" => Json(json!({
            "success": true,
            "task_id": "t1",
            "progress": progress("t1", "b1", "running", 42.7),
        }))
        .into_response(),
        "t2" => Json(json!({
            "success": true,
            "task_id": "t2",
            "progress": {"status": "done", "progress_percent": 88},
        }))
        .into_response(),
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "Task not found"})),
        )
            .into_response(),
    }
}

async fn active_tasks(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    Json(json!({
        "success": true,
        "data": {
            "active_tasks": [
                progress("t1", "b1", "processing", 40.0),
                progress("t3", "b1", "queued", 0.0),
                progress("t4", "b2", "processing", 90.0),
                progress("t5", "b2", "completed", 100.0),
                progress("t6", "b3", "done", 100.0),
                progress("t7", "b3", "error", 35.0),
            ],
            "count": 6,
        }
    }))
    .into_response()
}

async fn clear_task(Path(task_id): Path<String>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    if task_id == "t1" {
        Json(json!({"success": true, "message": "Task t1 cleared"})).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "Task not found"})),
        )
            .into_response()
    }
}

/// A server that rejects every request with a validation error, before any
/// stream starts.
pub async fn spawn_rejecting() -> String {
    let app = Router::new().fallback(invalid_upload);
    serve(app).await
}

/// Serve the fake ingestion API on an ephemeral port and return its base URL.
pub async fn spawn_upstream() -> String {
    let app = Router::new()
        .route("/documents/bulk", post(bulk_ingest))
        .route("/documents/upload", post(invalid_upload))
        .route("/scan/slow", post(slow_scan))
        .route("/scan/broken", post(broken_scan))
        .route("/scan/binary", post(binary_scan))
        .route("/tasks/active", get(active_tasks))
        .route("/tasks/{task_id}/progress", get(task_progress))
        .route("/tasks/{task_id}", delete(clear_task));
    serve(app).await
}

pub async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn relay_config() -> RelayConfig {
    RelayConfig {
        heartbeat_interval_secs: 1,
        ..Default::default()
    }
}

/// The application as mounted by the binary, relaying to `upstream_url`.
pub fn test_app(upstream_url: &str) -> Router {
    let upstream_config = UpstreamConfig {
        base_url: upstream_url.to_string(),
        connect_timeout_secs: 2,
        request_timeout_secs: Some(10),
    };
    let tracker_config = TrackerConfig::default();
    let upstream = HttpUpstream::new(&upstream_config).unwrap();
    let progress = ProgressClient::new(upstream_url, None, &tracker_config).unwrap();

    let state = AppState::new(Arc::new(upstream), relay_config(), progress);
    Router::new().nest("/api", create_router(state, &ServerConfig::default()))
}

/// Decode a complete event-stream body.
pub fn frames(body: &[u8]) -> Vec<Frame> {
    let (frames, rest) = decode(body);
    assert!(rest.is_empty(), "trailing bytes: {:?}", String::from_utf8_lossy(rest));
    frames
}
