//! API integration tests.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;

use docrelay::config::RelayConfig;
use docrelay_protocol::StreamEvent;

mod common;
use common::{TOKEN, frames, spawn_upstream, test_app};

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}

fn relay_request(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .uri(format!("/api/relay/{path}"))
        .method(Method::POST)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri).method(Method::GET);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

fn events(body: &[u8]) -> Vec<StreamEvent> {
    frames(body).iter().map(|f| f.event).collect()
}

/// Test that the health endpoint reports the crate version.
#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app("http://127.0.0.1:1");

    let response = app.oneshot(get("/api/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_relay_success_streams_result_then_done() {
    let upstream = spawn_upstream().await;
    let app = test_app(&upstream);

    let response = app
        .oneshot(relay_request("documents/bulk?collection=handbook", json!({"files": ["a.pdf"]})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    assert_eq!(headers["x-accel-buffering"], "no");

    let body = body_bytes(response).await;
    let frames = frames(&body);
    assert_eq!(
        frames.iter().map(|f| f.event).collect::<Vec<_>>(),
        vec![StreamEvent::Started, StreamEvent::Result, StreamEvent::Done]
    );
    assert_eq!(frames[0].data, RelayConfig::default().started_message);

    let result: Value = serde_json::from_str(&frames[1].data).unwrap();
    assert_eq!(result["ingested"], 2);
    assert_eq!(result["authorized"], true);
    assert_eq!(result["request"]["files"][0], "a.pdf");
}

#[tokio::test]
async fn test_relay_validation_error_is_a_single_error_frame() {
    let upstream = spawn_upstream().await;
    let app = test_app(&upstream);

    let response = app
        .oneshot(relay_request("documents/upload", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_bytes(response).await;
    let frames = frames(&body);
    assert_eq!(
        frames.iter().map(|f| f.event).collect::<Vec<_>>(),
        vec![StreamEvent::Started, StreamEvent::Error]
    );
    assert_eq!(frames[1].data, "Missing fields: body.file");
}

#[tokio::test]
async fn test_relay_empty_error_body_mentions_status() {
    let upstream = spawn_upstream().await;
    let app = test_app(&upstream);

    let response = app.oneshot(relay_request("scan/broken", json!({}))).await.unwrap();
    let body = body_bytes(response).await;
    let frames = frames(&body);
    assert_eq!(frames.last().unwrap().data, "Upstream returned HTTP 500");
}

#[tokio::test]
async fn test_relay_rejects_non_utf8_result() {
    let upstream = spawn_upstream().await;
    let app = test_app(&upstream);

    let response = app.oneshot(relay_request("scan/binary", json!({}))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_bytes(response).await;
    let frames = frames(&body);
    assert_eq!(
        frames.iter().map(|f| f.event).collect::<Vec<_>>(),
        vec![StreamEvent::Started, StreamEvent::Error]
    );
    assert_eq!(frames[1].data, RelayConfig::default().transport_error_message);
}

#[tokio::test]
async fn test_relay_sends_keepalives_while_waiting() {
    let upstream = spawn_upstream().await;
    let app = test_app(&upstream);

    let response = app.oneshot(relay_request("scan/slow", json!({}))).await.unwrap();
    let body = body_bytes(response).await;
    assert_eq!(
        events(&body),
        vec![
            StreamEvent::Started,
            StreamEvent::Keepalive,
            StreamEvent::Result,
            StreamEvent::Done
        ]
    );
}

#[tokio::test]
async fn test_relay_unreachable_upstream_uses_fallback_message() {
    let app = test_app("http://127.0.0.1:1");

    let response = app.oneshot(relay_request("documents/bulk", json!({}))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_bytes(response).await;
    let frames = frames(&body);
    assert_eq!(
        frames.iter().map(|f| f.event).collect::<Vec<_>>(),
        vec![StreamEvent::Started, StreamEvent::Error]
    );
    assert_eq!(frames[1].data, RelayConfig::default().transport_error_message);
}

#[tokio::test]
async fn test_task_progress_is_normalized() {
    let upstream = spawn_upstream().await;
    let app = test_app(&upstream);

    let response = app
        .oneshot(get("/api/tasks/t1/progress", Some(TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["task_id"], "t1");
    let progress = &json["progress"];
    assert_eq!(progress["status"], "processing");
    assert_eq!(progress["stage"], "embed");
    assert_eq!(progress["progress_percent"], 42);
    assert_eq!(progress["total_steps"], 6);
    assert_eq!(progress["completed_steps"], 2);
    assert_eq!(progress["estimated_remaining_seconds"], 12);
    assert!(progress["current_step"].as_str().is_some_and(|s| !s.is_empty()));
}

#[tokio::test]
async fn test_completed_task_reports_full_progress() {
    let upstream = spawn_upstream().await;
    let app = test_app(&upstream);

    let response = app
        .oneshot(get("/api/tasks/t2/progress", Some(TOKEN)))
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["progress"]["status"], "completed");
    assert_eq!(json["progress"]["progress_percent"], 100);
    assert_eq!(json["progress"]["completed_steps"], 6);
    assert!(json["progress"].get("stage").is_none());
}

#[tokio::test]
async fn test_task_progress_without_credential_is_unauthorized() {
    let upstream = spawn_upstream().await;
    let app = test_app(&upstream);

    let response = app.oneshot(get("/api/tasks/t1/progress", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let json: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let upstream = spawn_upstream().await;
    let app = test_app(&upstream);

    let response = app
        .oneshot(get("/api/tasks/nope/progress", Some(TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_active_tasks_skip_terminal_records() {
    let upstream = spawn_upstream().await;
    let app = test_app(&upstream);

    let response = app.oneshot(get("/api/tasks/active", Some(TOKEN))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["data"]["count"], 3);
    let ids: Vec<&str> = json["data"]["active_tasks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["task_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["t1", "t3", "t4"]);
}

#[tokio::test]
async fn test_active_batches_are_aggregated() {
    let upstream = spawn_upstream().await;
    let app = test_app(&upstream);

    let response = app.oneshot(get("/api/tasks/batches", Some(TOKEN))).await.unwrap();
    let json: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();

    let batches = json["data"].as_array().unwrap();
    assert_eq!(batches.len(), 3);
    assert_eq!(batches[0]["batch_id"], "b1");
    assert_eq!(batches[0]["total_files"], 2);
    assert_eq!(batches[0]["queued_count"], 1);
    assert_eq!(batches[0]["processing_count"], 1);
    assert_eq!(batches[0]["batch_status"], "processing");
}

#[tokio::test]
async fn test_finished_members_stay_in_their_batch() {
    let upstream = spawn_upstream().await;
    let app = test_app(&upstream);

    let response = app.oneshot(get("/api/tasks/batches", Some(TOKEN))).await.unwrap();
    let json: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    let batches = json["data"].as_array().unwrap();

    let partly_done = &batches[1];
    assert_eq!(partly_done["batch_id"], "b2");
    assert_eq!(partly_done["total_files"], 2);
    assert_eq!(partly_done["completed_count"], 1);
    assert_eq!(partly_done["processing_count"], 1);
    assert_eq!(partly_done["overall_percent"], 95);
    assert_eq!(partly_done["batch_status"], "processing");

    let all_done = &batches[2];
    assert_eq!(all_done["batch_id"], "b3");
    assert_eq!(all_done["total_files"], 2);
    assert_eq!(all_done["completed_count"], 1);
    assert_eq!(all_done["failed_count"], 1);
    assert_eq!(all_done["overall_percent"], 100);
    assert_eq!(all_done["batch_status"], "completed");
}

#[tokio::test]
async fn test_clear_task_is_idempotent() {
    let upstream = spawn_upstream().await;

    for task_id in ["t1", "already-gone"] {
        let response = test_app(&upstream)
            .oneshot(
                Request::builder()
                    .uri(format!("/api/tasks/{task_id}"))
                    .method(Method::DELETE)
                    .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "clearing {task_id}");

        let json: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["success"], true);
    }
}
