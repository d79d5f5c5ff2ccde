#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use relay_broker::config::ServerConfig;
use relay_broker::router::build_app_router;
use relay_broker::state::AppState;
use tower::ServiceExt;

/// Multipart boundary used by [`post_multipart`].
const BOUNDARY: &str = "relay-test-boundary";

/// Build a test `ServerConfig` rooted at `dir`.
///
/// Upload verification uses a short fixed interval so failure paths finish
/// quickly.
pub fn test_config(dir: &Path) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        request_timeout_secs: 30,
        upload_dir: dir.join("uploads"),
        results_dir: dir.join("results"),
        upload_verify_retries: 2,
        upload_verify_delay: Duration::from_millis(5),
        upload_verify_backoff: 1.0,
        ..ServerConfig::default()
    }
}

/// Build the full application router plus a handle on its state.
///
/// The router goes through the same builder as `main.rs`, so tests exercise
/// the production middleware stack.
pub fn build_test_app(dir: &Path) -> (Router, AppState) {
    let config = test_config(dir);
    let state = AppState::new(config.clone());
    (build_app_router(state.clone(), &config), state)
}

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    send(
        app,
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    )
    .await
}

pub async fn post_json(app: &Router, uri: &str, json: serde_json::Value) -> Response<Body> {
    send(
        app,
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
    )
    .await
}

/// POST a multipart form with a single file field.
pub async fn post_multipart(
    app: &Router,
    uri: &str,
    field: &str,
    file_name: &str,
    content: &[u8],
) -> Response<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    send(
        app,
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap(),
    )
    .await
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

// ---------------------------------------------------------------------------
// Protocol shortcuts
// ---------------------------------------------------------------------------

pub async fn register(app: &Router, worker_id: &str) {
    let response = post_json(
        app,
        "/api/v1/register",
        serde_json::json!({ "worker_id": worker_id }),
    )
    .await;
    assert_eq!(response.status(), 200);
}

/// Submit a direct-ref job and return its id.
pub async fn submit(app: &Router, input_ref: &str) -> String {
    let response = post_json(
        app,
        "/api/v1/jobs",
        serde_json::json!({ "input_ref": input_ref, "config_ref": format!("{input_ref}.lua") }),
    )
    .await;
    assert_eq!(response.status(), 201);
    body_json(response).await["data"]["job_id"]
        .as_str()
        .unwrap()
        .to_string()
}

pub async fn claim(app: &Router, worker_id: &str) -> Response<Body> {
    get(app, &format!("/api/v1/jobs/next?worker={worker_id}")).await
}

pub async fn start(app: &Router, job_id: &str, worker_id: &str) -> Response<Body> {
    post_json(
        app,
        &format!("/api/v1/jobs/{job_id}/start"),
        serde_json::json!({ "worker_id": worker_id }),
    )
    .await
}

pub async fn report(app: &Router, job_id: &str, worker_id: &str, success: bool) -> Response<Body> {
    post_json(
        app,
        "/api/v1/jobs/result",
        serde_json::json!({
            "job_id": job_id,
            "worker_id": worker_id,
            "success": success,
            "elapsed_secs": 1.25,
            "error": if success { None } else { Some("backend failed") },
            "payload": { "output_path": "/tmp/out.jpg" },
        }),
    )
    .await
}

/// Drive a fresh job through claim, confirm and report.
pub async fn run_to_terminal(app: &Router, worker_id: &str, success: bool) -> String {
    let job_id = submit(app, "photo.dng").await;
    let claimed = body_json(claim(app, worker_id).await).await;
    assert_eq!(claimed["data"]["id"], job_id.as_str());
    assert_eq!(start(app, &job_id, worker_id).await.status(), 200);
    assert_eq!(report(app, &job_id, worker_id, success).await.status(), 200);
    job_id
}
