//! The local processing backend the worker hands jobs to.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::job::{Payload, PayloadValue};
use relay_core::types::JobId;
use serde::Serialize;

/// Key in the backend's JSON response naming the produced artifact.
pub const OUTPUT_PATH_KEY: &str = "output_path";

/// Placeholder paths sent by the reachability probe.
const PROBE_PATH: &str = "test_connection";

/// Request body sent to the backend for one job.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessRequest {
    pub input_path: String,
    pub config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

/// What the backend reported for a successful run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutput {
    pub output_path: Option<PathBuf>,
    /// Primitive fields of the backend's JSON response, forwarded to the
    /// broker as the result payload.
    pub payload: Payload,
}

/// Errors from the processing backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Backend timed out after {0:?}")]
    Timeout(Duration),

    /// The backend answered but reported a failure; `body` is its message.
    #[error("{body}")]
    Failed { status: u16, body: String },
}

/// A local processor that turns an input and config into an output file.
#[async_trait]
pub trait ProcessingBackend: Send + Sync {
    /// Check that the backend is reachable.
    async fn probe(&self) -> Result<(), BackendError>;

    /// Process one job, giving up after `timeout`.
    async fn process(
        &self,
        request: &ProcessRequest,
        timeout: Duration,
    ) -> Result<ProcessOutput, BackendError>;
}

/// Backend reached over HTTP with a JSON POST.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
    probe_timeout: Duration,
}

impl HttpBackend {
    pub fn new(url: String, probe_timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), url, probe_timeout)
    }

    pub fn with_client(client: reqwest::Client, url: String, probe_timeout: Duration) -> Self {
        Self {
            client,
            url,
            probe_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ProcessingBackend for HttpBackend {
    /// Any 200, 400 or 500 answer means the backend is up; it rejects the
    /// placeholder paths but is listening.
    async fn probe(&self) -> Result<(), BackendError> {
        let request = ProcessRequest {
            input_path: PROBE_PATH.to_string(),
            config_path: PROBE_PATH.to_string(),
            job_id: None,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .timeout(self.probe_timeout)
            .send()
            .await?;

        match response.status().as_u16() {
            200 | 400 | 500 => Ok(()),
            status => Err(BackendError::Failed {
                status,
                body: format!("Unexpected probe status {status}"),
            }),
        }
    }

    async fn process(
        &self,
        request: &ProcessRequest,
        timeout: Duration,
    ) -> Result<ProcessOutput, BackendError> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(timeout)
                } else {
                    BackendError::Request(e)
                }
            })?;

        let status = response.status();
        let body = response.text().await?;
        if status.as_u16() != 200 {
            return Err(BackendError::Failed {
                status: status.as_u16(),
                body,
            });
        }

        Ok(parse_output(&body))
    }
}

/// Interpret a 200 body. Anything that is not a JSON object still counts
/// as success, just without an output path or payload.
pub fn parse_output(body: &str) -> ProcessOutput {
    let parsed = serde_json::from_str::<serde_json::Value>(body);
    let Ok(serde_json::Value::Object(fields)) = parsed else {
        tracing::warn!("Backend response is not a JSON object");
        return ProcessOutput::default();
    };

    let payload: Payload = fields
        .into_iter()
        .filter_map(|(key, value)| {
            serde_json::from_value::<PayloadValue>(value)
                .ok()
                .map(|v| (key, v))
        })
        .collect();

    let output_path = match payload.get(OUTPUT_PATH_KEY) {
        Some(PayloadValue::Text(path)) if !path.is_empty() => Some(PathBuf::from(path)),
        _ => None,
    };

    ProcessOutput {
        output_path,
        payload,
    }
}
