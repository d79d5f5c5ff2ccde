//! HTTP client for a single broker.
//!
//! Wraps the broker's REST API (health, registration, polling, lease
//! confirmation, result reporting and file transfer) using [`reqwest`].

use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use relay_core::job::JobView;
use relay_core::protocol::{
    ConfirmRequest, DataResponse, HealthResponse, RegisterWorker, ReportResult, UploadResponse,
    WorkerView,
};
use relay_core::types::JobId;
use reqwest::multipart::{Form, Part};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// Multipart field the broker expects the result artifact under.
const UPLOAD_FIELD: &str = "file";

/// Errors from the broker API layer.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The HTTP request itself failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The broker returned a non-2xx status code.
    #[error("Broker API error ({status}): {body}")]
    ApiError { status: u16, body: String },

    /// A 200 body that is not the expected JSON.
    #[error("Malformed broker response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Local file I/O failed during a transfer.
    #[error("File I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// Whether the broker could not be reached or is temporarily
    /// overloaded, as opposed to rejecting the request.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Self::ApiError { status, .. } => matches!(status, 502..=504),
            Self::Decode(_) | Self::Io(_) => false,
        }
    }
}

/// Per-call timeouts applied by [`BrokerClient`].
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Registration, confirmation, reporting and transfers.
    pub request: Duration,
    pub poll: Duration,
    pub health: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(300),
            poll: Duration::from_secs(10),
            health: Duration::from_secs(5),
        }
    }
}

/// HTTP client for one broker instance.
#[derive(Debug, Clone)]
pub struct BrokerClient {
    client: reqwest::Client,
    base_url: String,
    timeouts: Timeouts,
}

impl BrokerClient {
    /// Create a client for the broker at `base_url` (e.g. `http://host:8081`).
    pub fn new(base_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, Timeouts::default())
    }

    /// Create a client reusing an existing [`reqwest::Client`] so every
    /// broker shares one connection pool.
    pub fn with_client(client: reqwest::Client, base_url: String, timeouts: Timeouts) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeouts,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    /// `GET /health`.
    pub async fn health(&self) -> Result<HealthResponse, BrokerError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(self.timeouts.health)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// `POST /api/v1/register`.
    pub async fn register(&self, registration: &RegisterWorker) -> Result<WorkerView, BrokerError> {
        let response = self
            .client
            .post(self.api("/register"))
            .json(registration)
            .timeout(self.timeouts.request)
            .send()
            .await?;

        let envelope: DataResponse<WorkerView> = Self::parse_response(response).await?;
        Ok(envelope.data)
    }

    /// `GET /api/v1/jobs/next`. An empty 200 body means no job is pending.
    pub async fn next_job(&self, worker_id: &str) -> Result<Option<JobView>, BrokerError> {
        let response = self
            .client
            .get(self.api("/jobs/next"))
            .query(&[("worker", worker_id)])
            .timeout(self.timeouts.poll)
            .send()
            .await?;

        let body = Self::ensure_success(response).await?.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let envelope: DataResponse<JobView> = serde_json::from_slice(&body)?;
        Ok(Some(envelope.data))
    }

    /// `POST /api/v1/jobs/{id}/start`.
    pub async fn confirm(&self, job_id: JobId, worker_id: &str) -> Result<JobView, BrokerError> {
        let response = self
            .client
            .post(self.api(&format!("/jobs/{job_id}/start")))
            .json(&ConfirmRequest {
                worker_id: worker_id.to_string(),
            })
            .timeout(self.timeouts.request)
            .send()
            .await?;

        let envelope: DataResponse<JobView> = Self::parse_response(response).await?;
        Ok(envelope.data)
    }

    /// `POST /api/v1/jobs/result`.
    pub async fn report(&self, report: &ReportResult) -> Result<JobView, BrokerError> {
        let response = self
            .client
            .post(self.api("/jobs/result"))
            .json(report)
            .timeout(self.timeouts.request)
            .send()
            .await?;

        let envelope: DataResponse<JobView> = Self::parse_response(response).await?;
        Ok(envelope.data)
    }

    /// `GET /api/v1/files/{id}/{kind}`, streamed into `dest`.
    ///
    /// Returns the number of bytes written. A partial file is removed on
    /// failure.
    pub async fn download(&self, job_id: JobId, kind: &str, dest: &Path) -> Result<u64, BrokerError> {
        let response = self
            .client
            .get(self.api(&format!("/files/{job_id}/{kind}")))
            .timeout(self.timeouts.request)
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;

        let written = Self::write_stream(response, dest).await;
        if written.is_err() {
            if let Err(e) = tokio::fs::remove_file(dest).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %dest.display(), error = %e, "Failed to remove partial download");
                }
            }
        }
        written
    }

    /// `POST /api/v1/jobs/{id}/upload` with the file at `path` as field
    /// `file`.
    pub async fn upload(&self, job_id: JobId, path: &Path) -> Result<UploadResponse, BrokerError> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "result".to_string());

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, len)
            .file_name(file_name)
            .mime_str("application/octet-stream")?;
        let form = Form::new().part(UPLOAD_FIELD, part);

        let response = self
            .client
            .post(self.api(&format!("/jobs/{job_id}/upload")))
            .multipart(form)
            .timeout(self.timeouts.request)
            .send()
            .await?;

        let envelope: DataResponse<UploadResponse> = Self::parse_response(response).await?;
        Ok(envelope.data)
    }

    // ---- private helpers ----

    async fn write_stream(response: reqwest::Response, dest: &Path) -> Result<u64, BrokerError> {
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`BrokerError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, BrokerError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(BrokerError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, BrokerError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}
