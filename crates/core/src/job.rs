//! Job model: status enumeration, active job records, result payloads and
//! the snapshot view handed out to workers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{JobId, Timestamp, WorkerId};

/// Default lease for the READING state.
pub const DEFAULT_READ_LEASE: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
///
/// ```text
/// pending -> reading -> processing -> completed | failed
///    ^          |            |
///    +----------+------------+   (lease expiry / stale reclaim)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Reading,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal jobs live in the archive and never change status again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Reading => "reading",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Result payload
// ---------------------------------------------------------------------------

/// A single primitive value inside a schema-free result payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Open key/value result payload reported by the worker.
pub type Payload = BTreeMap<String, PayloadValue>;

/// Metadata recorded after a result artifact upload is verified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
    pub uploaded_at: Timestamp,
}

/// Outcome stamped on a job by its terminal transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    pub elapsed_secs: f64,
    pub error: Option<String>,
    #[serde(default)]
    pub payload: Payload,
    pub completed_at: Timestamp,
    /// Set at most once, after the terminal transition.
    pub upload: Option<UploadMetadata>,
}

// ---------------------------------------------------------------------------
// Job record
// ---------------------------------------------------------------------------

/// Submission parameters beyond the two refs.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub read_lease: Duration,
    pub requires_file_transfer: bool,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            read_lease: DEFAULT_READ_LEASE,
            requires_file_transfer: false,
        }
    }
}

/// Job record owned by the store. Never handed out by reference.
#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub id: JobId,
    pub input_ref: String,
    pub config_ref: String,
    pub created_at: Timestamp,
    /// Insertion sequence, the FIFO tie-breaker for equal `created_at`.
    pub seq: u64,
    pub status: JobStatus,
    pub owner: Option<WorkerId>,
    pub read_at: Option<Timestamp>,
    pub processing_started_at: Option<Timestamp>,
    pub read_lease: Duration,
    pub requires_file_transfer: bool,
    pub result: Option<JobResult>,
}

impl Job {
    pub fn new(
        id: JobId,
        seq: u64,
        input_ref: String,
        config_ref: String,
        created_at: Timestamp,
        opts: SubmitOptions,
    ) -> Self {
        Self {
            id,
            input_ref,
            config_ref,
            created_at,
            seq,
            status: JobStatus::Pending,
            owner: None,
            read_at: None,
            processing_started_at: None,
            read_lease: opts.read_lease,
            requires_file_transfer: opts.requires_file_transfer,
            result: None,
        }
    }

    /// Return to PENDING, dropping every trace of the previous lease.
    pub fn release(&mut self) {
        self.status = JobStatus::Pending;
        self.owner = None;
        self.read_at = None;
        self.processing_started_at = None;
    }

    pub fn view(&self) -> JobView {
        JobView {
            id: self.id,
            input_ref: self.input_ref.clone(),
            config_ref: self.config_ref.clone(),
            created_at: self.created_at,
            status: self.status,
            owner_worker_id: self.owner.clone(),
            read_at: self.read_at,
            processing_started_at: self.processing_started_at,
            read_lease_secs: self.read_lease.as_secs_f64(),
            requires_file_transfer: self.requires_file_transfer,
            result: self.result.clone(),
        }
    }
}

/// Point-in-time snapshot of a job, safe to serialize and send to workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub input_ref: String,
    pub config_ref: String,
    pub created_at: Timestamp,
    pub status: JobStatus,
    pub owner_worker_id: Option<WorkerId>,
    pub read_at: Option<Timestamp>,
    pub processing_started_at: Option<Timestamp>,
    pub read_lease_secs: f64,
    pub requires_file_transfer: bool,
    pub result: Option<JobResult>,
}
