#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_core::estimation::TimeoutEstimator;
use relay_core::protocol::{RegisterWorker, ReportResult};
use relay_core::types::JobId;
use relay_worker::backend::{BackendError, ProcessOutput, ProcessRequest, ProcessingBackend};
use relay_worker::client::{BrokerClient, Timeouts};
use relay_worker::poller::{Poller, PollerSettings};
use relay_worker::pool::BrokerPool;
use relay_worker::runner::{JobRunner, RunnerSettings};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

pub const WORKER_ID: &str = "worker-test";

// ---------------------------------------------------------------------------
// Fake processing backend
// ---------------------------------------------------------------------------

/// What the fake backend does when asked to process a job.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Write `bytes` to `path` and report it as the output.
    Produce { path: PathBuf, bytes: Vec<u8> },
    /// Report `path` as the output without ever creating it.
    Phantom { path: PathBuf },
    /// Fail with the given message.
    Fail(String),
}

#[derive(Debug)]
pub struct FakeBackend {
    pub behavior: Behavior,
    pub reachable: AtomicBool,
    pub calls: Mutex<Vec<(ProcessRequest, Duration)>>,
    /// Input file contents as seen at processing time.
    pub inputs: Mutex<Vec<Vec<u8>>>,
}

impl FakeBackend {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            reachable: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            inputs: Mutex::new(Vec::new()),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn inputs(&self) -> Vec<Vec<u8>> {
        self.inputs.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<(ProcessRequest, Duration)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessingBackend for FakeBackend {
    async fn probe(&self) -> Result<(), BackendError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Failed {
                status: 404,
                body: "down".into(),
            })
        }
    }

    async fn process(
        &self,
        request: &ProcessRequest,
        timeout: Duration,
    ) -> Result<ProcessOutput, BackendError> {
        self.calls.lock().unwrap().push((request.clone(), timeout));
        if let Ok(bytes) = tokio::fs::read(&request.input_path).await {
            self.inputs.lock().unwrap().push(bytes);
        }
        match &self.behavior {
            Behavior::Produce { path, bytes } => {
                tokio::fs::write(path, bytes).await.unwrap();
                Ok(relay_worker::backend::parse_output(
                    &json!({ "output_path": path, "filter": "warm" }).to_string(),
                ))
            }
            Behavior::Phantom { path } => Ok(relay_worker::backend::parse_output(
                &json!({ "output_path": path }).to_string(),
            )),
            Behavior::Fail(message) => Err(BackendError::Failed {
                status: 500,
                body: message.clone(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire fixtures
// ---------------------------------------------------------------------------

pub fn job_json(id: JobId, input_ref: &str, config_ref: &str, transfer: bool) -> Value {
    json!({
        "id": id,
        "input_ref": input_ref,
        "config_ref": config_ref,
        "created_at": "2026-01-01T00:00:00Z",
        "status": "reading",
        "owner_worker_id": WORKER_ID,
        "read_at": "2026-01-01T00:00:01Z",
        "processing_started_at": null,
        "read_lease_secs": 10.0,
        "requires_file_transfer": transfer,
        "result": null,
    })
}

fn health_json() -> Value {
    json!({
        "status": "healthy",
        "version": "0.1.0",
        "timestamp": "2026-01-01T00:00:00Z",
        "active_workers": 0,
        "jobs": { "pending": 0, "reading": 0, "processing": 0, "completed": 0, "failed": 0 },
    })
}

fn worker_json() -> Value {
    json!({
        "data": {
            "worker_id": WORKER_ID,
            "capabilities": ["photo_processing"],
            "local_port": 7777,
            "registered_at": "2026-01-01T00:00:00Z",
            "last_seen": "2026-01-01T00:00:00Z",
            "online": true,
        }
    })
}

/// Mount `/health` and `/api/v1/register` answering 200.
pub async fn mount_healthy(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(health_json()))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(worker_json()))
        .mount(server)
        .await;
}

/// Mount start, result and upload endpoints for `job`.
pub async fn mount_lifecycle(server: &MockServer, job: &Value) {
    let id = job["id"].as_str().unwrap().to_string();
    Mock::given(method("POST"))
        .and(path(format!("/api/v1/jobs/{id}/start")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": job })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/jobs/result"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": job })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/api/v1/jobs/{id}/upload")))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "data": {
                "job_id": id,
                "path": format!("/results/{id}/processed.jpg"),
                "size_bytes": 9,
                "sha256": "00",
                "uploaded_at": "2026-01-01T00:00:05Z",
            }
        })))
        .mount(server)
        .await;
}

/// Make `/api/v1/jobs/next` hand out `job` on every poll.
pub async fn mount_next(server: &MockServer, job: &Value) {
    Mock::given(method("GET"))
        .and(path("/api/v1/jobs/next"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": job })))
        .mount(server)
        .await;
}

/// Make `/api/v1/jobs/next` answer with an empty body.
pub async fn mount_no_jobs(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/v1/jobs/next"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

pub async fn requests_to(server: &MockServer, verb: &str, route: &str) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.method.as_str() == verb && r.url.path() == route)
        .collect()
}

pub async fn reports(server: &MockServer) -> Vec<ReportResult> {
    requests_to(server, "POST", "/api/v1/jobs/result")
        .await
        .iter()
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn client(server: &MockServer) -> BrokerClient {
    client_for(&server.uri())
}

pub fn client_for(url: &str) -> BrokerClient {
    BrokerClient::with_client(
        reqwest::Client::new(),
        url.to_string(),
        Timeouts {
            request: Duration::from_secs(5),
            poll: Duration::from_secs(2),
            health: Duration::from_secs(1),
        },
    )
}

pub fn runner(work_dir: &Path, backend: Arc<FakeBackend>) -> JobRunner {
    JobRunner::new(
        RunnerSettings {
            worker_id: WORKER_ID.to_string(),
            work_dir: work_dir.to_path_buf(),
            estimator: TimeoutEstimator::default(),
            extra_buffer: Duration::from_secs(10),
            file_check_interval: Duration::from_millis(10),
            output_wait: Duration::from_millis(100),
        },
        backend,
    )
}

pub fn poller_settings() -> PollerSettings {
    PollerSettings {
        poll_interval: Duration::from_millis(10),
        health_check_interval: Duration::from_secs(3600),
        max_consecutive_failures: 3,
        connection_retry_delay: Duration::from_millis(10),
        max_startup_attempts: 2,
        max_empty_polls: 5,
    }
}

pub fn poller(urls: &[String], work_dir: &Path, backend: Arc<FakeBackend>) -> Poller {
    poller_with(poller_settings(), urls, work_dir, backend)
}

pub fn poller_with(
    settings: PollerSettings,
    urls: &[String],
    work_dir: &Path,
    backend: Arc<FakeBackend>,
) -> Poller {
    let pool = BrokerPool::new(urls.iter().map(|u| client_for(u)).collect());
    Poller::new(
        settings,
        pool,
        backend.clone(),
        runner(work_dir, backend),
        RegisterWorker {
            worker_id: WORKER_ID.to_string(),
            capabilities: vec!["photo_processing".into()],
            local_port: 7777,
        },
    )
}

/// Write a source file and return its path as a string.
pub fn write_file(dir: &Path, name: &str, content: &[u8]) -> String {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path.to_string_lossy().into_owned()
}

/// Poll `check` every 20ms for up to five seconds.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
