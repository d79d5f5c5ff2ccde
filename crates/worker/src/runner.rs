//! Runs one claimed job end to end: confirm, fetch inputs, process,
//! report, upload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_core::estimation::TimeoutEstimator;
use relay_core::job::JobView;
use relay_core::protocol::ReportResult;
use relay_core::transfer::{KIND_CONFIG, KIND_INPUT};

use crate::backend::{BackendError, ProcessRequest, ProcessingBackend};
use crate::client::{BrokerClient, BrokerError};
use crate::files;

/// Why a job attempt failed after the lease was confirmed. The display
/// text becomes the `error` of the failure report.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Failed to download {kind} file: {source}")]
    Download {
        kind: &'static str,
        #[source]
        source: BrokerError,
    },

    #[error("{kind} file not found: {}", .path.display())]
    MissingFile { kind: &'static str, path: PathBuf },

    #[error("Work directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// How a job attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Confirmation was refused; the lease is left to expire.
    Abandoned,
    /// A report was accepted by the broker.
    Reported { success: bool, uploaded: bool },
    /// The broker did not accept the report.
    ReportFailed { success: bool },
}

/// Settings that shape a single job attempt.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub worker_id: String,
    pub work_dir: PathBuf,
    pub estimator: TimeoutEstimator,
    /// Added to the estimate to form the backend request timeout.
    pub extra_buffer: Duration,
    pub file_check_interval: Duration,
    pub output_wait: Duration,
}

/// Successful processing, before reporting.
struct Processed {
    output: crate::backend::ProcessOutput,
    /// Set only when the output file is present and non-empty.
    artifact: Option<PathBuf>,
}

pub struct JobRunner {
    settings: RunnerSettings,
    backend: Arc<dyn ProcessingBackend>,
}

impl JobRunner {
    pub fn new(settings: RunnerSettings, backend: Arc<dyn ProcessingBackend>) -> Self {
        Self { settings, backend }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Drive `job`, claimed from `broker`, to a report.
    ///
    /// Any failure after confirmation is reported as a failed result.
    /// Upload failures are logged but never change the reported outcome.
    /// The working directory of a transfer job is removed once the
    /// attempt is over, whatever its outcome.
    pub async fn run(&self, broker: &BrokerClient, job: JobView) -> JobOutcome {
        if let Err(e) = broker.confirm(job.id, &self.settings.worker_id).await {
            tracing::warn!(job_id = %job.id, broker = %broker.base_url(), error = %e, "Lease confirmation refused, abandoning job");
            return JobOutcome::Abandoned;
        }
        tracing::info!(job_id = %job.id, broker = %broker.base_url(), "Processing job");

        let started = Instant::now();
        let (processed, work_dir) = if job.requires_file_transfer {
            match files::create_work_dir(&self.settings.work_dir, job.id).await {
                Ok(dir) => (self.process(broker, &job, Some(&dir)).await, Some(dir)),
                Err(e) => (Err(JobError::Io(e)), None),
            }
        } else {
            (self.process(broker, &job, None).await, None)
        };

        let outcome = self.report_and_upload(broker, &job, processed, started).await;

        if let Some(dir) = work_dir {
            files::remove_work_dir(&dir).await;
        }
        outcome
    }

    async fn report_and_upload(
        &self,
        broker: &BrokerClient,
        job: &JobView,
        processed: Result<Processed, JobError>,
        started: Instant,
    ) -> JobOutcome {
        let worker_id = self.settings.worker_id.as_str();
        let elapsed_secs = started.elapsed().as_secs_f64();

        let (success, report, artifact) = match processed {
            Ok(p) => (
                true,
                ReportResult {
                    job_id: job.id,
                    worker_id: worker_id.to_string(),
                    success: true,
                    elapsed_secs,
                    error: None,
                    payload: p.output.payload,
                },
                p.artifact,
            ),
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Job failed");
                (
                    false,
                    ReportResult {
                        job_id: job.id,
                        worker_id: worker_id.to_string(),
                        success: false,
                        elapsed_secs,
                        error: Some(e.to_string()),
                        payload: Default::default(),
                    },
                    None,
                )
            }
        };

        if let Err(e) = broker.report(&report).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to report result");
            return JobOutcome::ReportFailed { success };
        }
        tracing::info!(job_id = %job.id, success, elapsed_secs, "Result reported");

        let uploaded = match artifact {
            Some(path) => match broker.upload(job.id, &path).await {
                Ok(upload) => {
                    tracing::info!(job_id = %job.id, size_bytes = upload.upload.size_bytes, "Result uploaded");
                    true
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, path = %path.display(), error = %e, "Result upload failed");
                    false
                }
            },
            None => false,
        };

        JobOutcome::Reported { success, uploaded }
    }

    /// `work_dir` is set for transfer jobs; the inputs are downloaded
    /// into it.
    async fn process(
        &self,
        broker: &BrokerClient,
        job: &JobView,
        work_dir: Option<&Path>,
    ) -> Result<Processed, JobError> {
        let (input, config) = match work_dir {
            Some(dir) => self.fetch_inputs(broker, job, dir).await?,
            None => (PathBuf::from(&job.input_ref), PathBuf::from(&job.config_ref)),
        };

        for (kind, path) in [(KIND_INPUT, &input), (KIND_CONFIG, &config)] {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Err(JobError::MissingFile {
                    kind,
                    path: path.clone(),
                });
            }
        }

        let timeout = self.estimate_timeout(&config).await + self.settings.extra_buffer;
        let request = ProcessRequest {
            input_path: input.to_string_lossy().into_owned(),
            config_path: config.to_string_lossy().into_owned(),
            job_id: Some(job.id),
        };
        let output = self.backend.process(&request, timeout).await?;

        let artifact = match &output.output_path {
            Some(path) => {
                let size = match files::non_empty_size(path).await {
                    Some(size) => Some(size),
                    None => {
                        tracing::debug!(job_id = %job.id, path = %path.display(), "Waiting for output file");
                        files::wait_for_output(
                            path,
                            self.settings.file_check_interval,
                            self.settings.output_wait,
                        )
                        .await
                    }
                };
                if size.is_none() {
                    tracing::warn!(job_id = %job.id, path = %path.display(), "Output file never appeared, reporting success without upload");
                }
                size.map(|_| path.clone())
            }
            None => None,
        };

        Ok(Processed { output, artifact })
    }

    async fn fetch_inputs(
        &self,
        broker: &BrokerClient,
        job: &JobView,
        dir: &Path,
    ) -> Result<(PathBuf, PathBuf), JobError> {
        let input = dir.join(files::local_name(KIND_INPUT, &job.input_ref));
        let config = dir.join(files::local_name(KIND_CONFIG, &job.config_ref));

        for (kind, dest) in [(KIND_INPUT, &input), (KIND_CONFIG, &config)] {
            let size = broker
                .download(job.id, kind, dest)
                .await
                .map_err(|source| JobError::Download { kind, source })?;
            tracing::debug!(job_id = %job.id, kind, size_bytes = size, "Downloaded transfer file");
        }

        Ok((input, config))
    }

    async fn estimate_timeout(&self, config: &Path) -> Duration {
        match tokio::fs::read_to_string(config).await {
            Ok(content) => {
                let estimate = self.settings.estimator.estimate(&content);
                tracing::debug!(
                    timeout_secs = estimate.timeout.as_secs_f64(),
                    class = ?estimate.class,
                    units = estimate.units,
                    "Estimated processing timeout"
                );
                estimate.timeout
            }
            Err(e) => {
                tracing::warn!(path = %config.display(), error = %e, "Config unreadable, using fallback timeout");
                self.settings.estimator.fallback
            }
        }
    }
}
