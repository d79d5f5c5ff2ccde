//! Request and response bodies exchanged between workers and the broker.
//!
//! Both sides depend on these types so the wire contract lives in one
//! place.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::job::{Payload, UploadMetadata};
use crate::types::{JobId, Timestamp, WorkerId};

/// Default advertised callback port of a worker's local backend.
pub const DEFAULT_LOCAL_PORT: u16 = 7777;

fn default_capabilities() -> Vec<String> {
    vec!["photo_processing".to_string()]
}

fn default_local_port() -> u16 {
    DEFAULT_LOCAL_PORT
}

/// Standard `{ "data": T }` response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct DataResponse<T> {
    pub data: T,
}

/// POST /register
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RegisterWorker {
    #[validate(length(min = 1, max = 128))]
    pub worker_id: WorkerId,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,
    #[serde(default = "default_local_port")]
    #[validate(range(min = 1))]
    pub local_port: u16,
}

/// POST /jobs/{id}/start
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ConfirmRequest {
    #[validate(length(min = 1))]
    pub worker_id: WorkerId,
}

/// POST /jobs/result
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReportResult {
    pub job_id: JobId,
    #[validate(length(min = 1))]
    pub worker_id: WorkerId,
    pub success: bool,
    #[validate(range(min = 0.0))]
    pub elapsed_secs: f64,
    pub error: Option<String>,
    #[serde(default)]
    pub payload: Payload,
}

/// POST /jobs
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubmitJob {
    #[validate(length(min = 1))]
    pub input_ref: String,
    #[validate(length(min = 1))]
    pub config_ref: String,
    /// Overrides the broker's default READING lease.
    #[validate(range(min = 1, max = 3600))]
    pub read_lease_secs: Option<u64>,
}

/// POST /jobs/transfer -- inputs live on the broker's filesystem.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubmitTransferJob {
    #[validate(length(min = 1))]
    pub input_path: String,
    #[validate(length(min = 1))]
    pub config_path: String,
    #[validate(range(min = 1, max = 3600))]
    pub read_lease_secs: Option<u64>,
}

/// Response to either submission endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub queue_position: usize,
}

/// Per-status job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: usize,
    pub reading: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// GET /health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: Timestamp,
    pub active_workers: usize,
    pub jobs: JobCounts,
}

/// Registration record as exposed by GET /workers and GET /stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerView {
    pub worker_id: WorkerId,
    pub capabilities: Vec<String>,
    pub local_port: u16,
    pub registered_at: Timestamp,
    pub last_seen: Timestamp,
    pub online: bool,
}

/// Short summary of an archived job for GET /stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentJob {
    pub job_id: JobId,
    pub status: crate::job::JobStatus,
    pub created_at: Timestamp,
    pub input_ref: String,
}

/// GET /stats
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub active_workers: Vec<WorkerView>,
    pub jobs: JobCounts,
    pub recent_jobs: Vec<RecentJob>,
}

/// POST /jobs/{id}/upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub job_id: JobId,
    #[serde(flatten)]
    pub upload: UploadMetadata,
}
