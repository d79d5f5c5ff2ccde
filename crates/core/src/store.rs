//! In-memory job store and lease state machine.
//!
//! [`JobStore`] owns the active job map, the terminal archive and the
//! worker registrations behind a single mutex. Every status change goes
//! through one of its methods; the lock is held only for the in-memory
//! transition and is never held across file or network I/O.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::CoreError;
use crate::job::{Job, JobResult, JobStatus, JobView, Payload, SubmitOptions, UploadMetadata};
use crate::protocol::{JobCounts, RecentJob, RegisterWorker, WorkerView};
use crate::types::{elapsed_between, JobId, Timestamp, WorkerId};

/// Workers seen within this window are reported as online by `list_workers`.
pub const WORKER_ONLINE_WINDOW: Duration = Duration::from_secs(30);

/// Number of archived jobs returned by [`JobStore::recent_archived`] callers.
pub const RECENT_JOBS_LIMIT: usize = 10;

/// Timeouts applied by the reaper.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Default READING lease for new jobs.
    pub read_lease: Duration,
    /// PROCESSING jobs older than this (since confirm) are reclaimed.
    pub processing_stale_after: Duration,
    /// Registrations without a heartbeat for this long are purged.
    pub worker_expiry: Duration,
    /// Window used for "active worker" counts.
    pub worker_active_window: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            read_lease: crate::job::DEFAULT_READ_LEASE,
            processing_stale_after: Duration::from_secs(1800),
            worker_expiry: Duration::from_secs(600),
            worker_active_window: Duration::from_secs(60),
        }
    }
}

/// Advisory bookkeeping for a registered worker.
#[derive(Debug, Clone)]
struct WorkerRecord {
    capabilities: Vec<String>,
    local_port: u16,
    registered_at: Timestamp,
    last_seen: Timestamp,
}

/// What one reaper sweep reclaimed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    pub expired_reads: Vec<JobId>,
    pub stale_processing: Vec<JobId>,
    pub purged_workers: Vec<WorkerId>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.expired_reads.is_empty()
            && self.stale_processing.is_empty()
            && self.purged_workers.is_empty()
    }
}

#[derive(Default)]
struct StoreInner {
    jobs: HashMap<JobId, Job>,
    archive: HashMap<JobId, Job>,
    workers: HashMap<WorkerId, WorkerRecord>,
    next_seq: u64,
}

impl StoreInner {
    /// Look up an active job and check the caller still owns it.
    fn owned_active_mut(&mut self, job_id: JobId, worker_id: &str) -> Result<&mut Job, CoreError> {
        if let Some(archived) = self.archive.get(&job_id) {
            return Err(if archived.owner.as_deref() == Some(worker_id) {
                CoreError::InvalidState(format!(
                    "Job {job_id} already finished with status {}",
                    archived.status
                ))
            } else {
                CoreError::Forbidden(format!("Job {job_id} does not belong to worker {worker_id}"))
            });
        }

        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| CoreError::job_not_found(job_id))?;

        if job.owner.as_deref() != Some(worker_id) {
            return Err(CoreError::Forbidden(format!(
                "Job {job_id} does not belong to worker {worker_id}"
            )));
        }
        Ok(job)
    }

    fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for job in self.jobs.values().chain(self.archive.values()) {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Reading => counts.reading += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

/// Single source of truth for job state.
///
/// Designed to be wrapped in `Arc` and shared between HTTP handlers and
/// the background reaper.
pub struct JobStore {
    inner: Mutex<StoreInner>,
    config: LeaseConfig,
}

impl JobStore {
    pub fn new(config: LeaseConfig) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            config,
        }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    // ---- submission ----

    /// Create a PENDING job and return its id.
    pub async fn submit(
        &self,
        input_ref: impl Into<String>,
        config_ref: impl Into<String>,
        opts: SubmitOptions,
    ) -> JobId {
        self.submit_with_id(uuid::Uuid::now_v7(), input_ref, config_ref, opts)
            .await
    }

    /// Create a PENDING job under a caller-chosen id.
    ///
    /// Lets the caller register side data (such as a transfer mapping) for
    /// the id before the job becomes claimable.
    pub async fn submit_with_id(
        &self,
        id: JobId,
        input_ref: impl Into<String>,
        config_ref: impl Into<String>,
        opts: SubmitOptions,
    ) -> JobId {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let job = Job::new(id, seq, input_ref.into(), config_ref.into(), Utc::now(), opts);
        tracing::info!(
            job_id = %id,
            input_ref = %job.input_ref,
            requires_file_transfer = job.requires_file_transfer,
            "Job submitted",
        );
        inner.jobs.insert(id, job);
        id
    }

    /// Submission options seeded with this store's default read lease.
    pub fn default_options(&self) -> SubmitOptions {
        SubmitOptions {
            read_lease: self.config.read_lease,
            ..SubmitOptions::default()
        }
    }

    /// Number of jobs currently waiting to be claimed.
    pub async fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .count()
    }

    // ---- worker registry ----

    /// Idempotent upsert of a worker registration.
    pub async fn register_worker(&self, reg: RegisterWorker) -> WorkerView {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let registered_at = inner
            .workers
            .get(&reg.worker_id)
            .map_or(now, |w| w.registered_at);

        tracing::info!(worker_id = %reg.worker_id, local_port = reg.local_port, "Worker registered");
        let view = WorkerView {
            worker_id: reg.worker_id.clone(),
            capabilities: reg.capabilities.clone(),
            local_port: reg.local_port,
            registered_at,
            last_seen: now,
            online: true,
        };
        inner.workers.insert(
            reg.worker_id,
            WorkerRecord {
                capabilities: reg.capabilities,
                local_port: reg.local_port,
                registered_at,
                last_seen: now,
            },
        );
        view
    }

    pub async fn is_registered(&self, worker_id: &str) -> bool {
        self.inner.lock().await.workers.contains_key(worker_id)
    }

    /// All registrations, with `online` computed against `now`.
    pub async fn list_workers(&self, now: Timestamp) -> Vec<WorkerView> {
        self.workers_seen_within(now, None).await
    }

    /// Registrations seen within the configured active window.
    pub async fn active_workers(&self, now: Timestamp) -> Vec<WorkerView> {
        self.workers_seen_within(now, Some(self.config.worker_active_window))
            .await
    }

    async fn workers_seen_within(&self, now: Timestamp, window: Option<Duration>) -> Vec<WorkerView> {
        let inner = self.inner.lock().await;
        let mut workers: Vec<WorkerView> = inner
            .workers
            .iter()
            .filter(|(_, w)| window.map_or(true, |win| elapsed_between(w.last_seen, now) < win))
            .map(|(id, w)| WorkerView {
                worker_id: id.clone(),
                capabilities: w.capabilities.clone(),
                local_port: w.local_port,
                registered_at: w.registered_at,
                last_seen: w.last_seen,
                online: elapsed_between(w.last_seen, now) < WORKER_ONLINE_WINDOW,
            })
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    // ---- state machine ----

    /// Lease the oldest PENDING job to `worker_id` (PENDING -> READING).
    ///
    /// Returns `Ok(None)` when nothing is pending. Unregistered workers get
    /// `Forbidden`. The caller's `last_seen` is refreshed on every call.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<JobView>, CoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        let worker = inner.workers.get_mut(worker_id).ok_or_else(|| {
            CoreError::Forbidden(format!(
                "Worker {worker_id} is not registered, register first"
            ))
        })?;
        worker.last_seen = now;

        let Some(job) = inner
            .jobs
            .values_mut()
            .filter(|j| j.status == JobStatus::Pending)
            .min_by_key(|j| (j.created_at, j.seq))
        else {
            return Ok(None);
        };

        job.status = JobStatus::Reading;
        job.owner = Some(worker_id.to_string());
        job.read_at = Some(now);

        tracing::info!(job_id = %job.id, worker_id, "Job claimed");
        Ok(Some(job.view()))
    }

    /// Confirm a claimed job (READING -> PROCESSING).
    pub async fn confirm(&self, job_id: JobId, worker_id: &str) -> Result<JobView, CoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let job = inner.owned_active_mut(job_id, worker_id)?;

        if job.status != JobStatus::Reading {
            return Err(CoreError::InvalidState(format!(
                "Job {job_id} is {}, expected reading",
                job.status
            )));
        }

        job.status = JobStatus::Processing;
        job.processing_started_at = Some(now);

        tracing::info!(job_id = %job_id, worker_id, "Job processing started");
        Ok(job.view())
    }

    /// Record a terminal outcome and move the job to the archive.
    ///
    /// Ownership is the only precondition: a result may arrive while the
    /// job is still nominally READING. Removal from the active map and
    /// insertion into the archive happen under the same lock acquisition.
    pub async fn report_result(
        &self,
        job_id: JobId,
        worker_id: &str,
        success: bool,
        elapsed_secs: f64,
        error: Option<String>,
        payload: Payload,
    ) -> Result<JobView, CoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.owned_active_mut(job_id, worker_id)?;

        let Some(mut job) = inner.jobs.remove(&job_id) else {
            return Err(CoreError::job_not_found(job_id));
        };

        job.status = if success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        job.result = Some(JobResult {
            success,
            elapsed_secs,
            error,
            payload,
            completed_at: now,
            upload: None,
        });

        if success {
            tracing::info!(job_id = %job_id, worker_id, elapsed_secs, "Job completed");
        } else {
            tracing::warn!(job_id = %job_id, worker_id, elapsed_secs, "Job failed");
        }

        let view = job.view();
        inner.archive.insert(job_id, job);
        Ok(view)
    }

    /// Look up a job in the active map, then the archive.
    pub async fn status(&self, job_id: JobId) -> Result<JobView, CoreError> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .get(&job_id)
            .or_else(|| inner.archive.get(&job_id))
            .map(Job::view)
            .ok_or_else(|| CoreError::job_not_found(job_id))
    }

    /// Check that a result artifact may be uploaded for `job_id`.
    ///
    /// Only archived COMPLETED jobs accept uploads.
    pub async fn ensure_uploadable(&self, job_id: JobId) -> Result<(), CoreError> {
        let inner = self.inner.lock().await;
        match inner.archive.get(&job_id) {
            Some(job) if job.status == JobStatus::Completed => Ok(()),
            Some(job) => Err(CoreError::InvalidState(format!(
                "Job {job_id} finished with status {}, uploads need completed",
                job.status
            ))),
            None => Err(CoreError::NotFound {
                entity: "Completed job",
                id: job_id.to_string(),
            }),
        }
    }

    /// Attach verified upload metadata to an archived COMPLETED job.
    ///
    /// This is the only mutation permitted after a terminal transition.
    pub async fn attach_upload(&self, job_id: JobId, upload: UploadMetadata) -> Result<JobView, CoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .archive
            .get_mut(&job_id)
            .filter(|j| j.status == JobStatus::Completed)
            .ok_or_else(|| CoreError::NotFound {
                entity: "Completed job",
                id: job_id.to_string(),
            })?;

        let result = job.result.as_mut().ok_or_else(|| {
            CoreError::Internal(format!("Archived job {job_id} has no result"))
        })?;
        result.upload = Some(upload);
        Ok(job.view())
    }

    // ---- reaper ----

    /// Reclaim expired READING leases and stale PROCESSING jobs, and purge
    /// expired worker registrations. O(active jobs + workers).
    pub async fn reap(&self, now: Timestamp) -> ReapReport {
        let mut report = ReapReport::default();
        let mut inner = self.inner.lock().await;

        for job in inner.jobs.values_mut() {
            match job.status {
                JobStatus::Reading => {
                    let expired = job
                        .read_at
                        .is_some_and(|at| elapsed_between(at, now) > job.read_lease);
                    if expired {
                        tracing::warn!(
                            job_id = %job.id,
                            worker_id = job.owner.as_deref().unwrap_or("-"),
                            "Read lease expired, job returned to pending",
                        );
                        job.release();
                        report.expired_reads.push(job.id);
                    }
                }
                JobStatus::Processing => {
                    let stale = job.processing_started_at.is_some_and(|at| {
                        elapsed_between(at, now) > self.config.processing_stale_after
                    });
                    if stale {
                        tracing::warn!(
                            job_id = %job.id,
                            worker_id = job.owner.as_deref().unwrap_or("-"),
                            "Processing went stale, job returned to pending",
                        );
                        job.release();
                        report.stale_processing.push(job.id);
                    }
                }
                _ => {}
            }
        }

        let expiry = self.config.worker_expiry;
        inner.workers.retain(|id, w| {
            let keep = elapsed_between(w.last_seen, now) <= expiry;
            if !keep {
                tracing::info!(worker_id = %id, "Purging offline worker registration");
                report.purged_workers.push(id.clone());
            }
            keep
        });

        report
    }

    // ---- reporting ----

    pub async fn counts(&self) -> JobCounts {
        self.inner.lock().await.counts()
    }

    /// Most recently finished jobs, newest first.
    pub async fn recent_archived(&self, limit: usize) -> Vec<RecentJob> {
        let inner = self.inner.lock().await;
        let mut archived: Vec<&Job> = inner.archive.values().collect();
        archived.sort_by_key(|j| {
            std::cmp::Reverse(j.result.as_ref().map(|r| r.completed_at))
        });
        archived
            .into_iter()
            .take(limit)
            .map(|j| RecentJob {
                job_id: j.id,
                status: j.status,
                created_at: j.created_at,
                input_ref: j.input_ref.clone(),
            })
            .collect()
    }

    /// Whether `job_id` is tracked in the active map and in the archive.
    #[cfg(test)]
    pub(crate) async fn location(&self, job_id: JobId) -> (bool, bool) {
        let inner = self.inner.lock().await;
        (
            inner.jobs.contains_key(&job_id),
            inner.archive.contains_key(&job_id),
        )
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new(LeaseConfig::default())
    }
}
