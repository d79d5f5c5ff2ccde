//! File transfer subsystem.
//!
//! Serves a job's input and config files from the broker's filesystem and
//! accepts the worker's result upload. Uploads are streamed to a temporary
//! file beside the final path, renamed into place and then re-verified, so
//! readers never observe a partially written artifact.
//!
//! Nothing here touches the job store lock; the broker checks job state
//! before and after calling in.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::backoff::Backoff;
use crate::error::CoreError;
use crate::job::UploadMetadata;
use crate::types::JobId;

/// Download kind for the job's input payload.
pub const KIND_INPUT: &str = "input";

/// Download kind for the job's processing config.
pub const KIND_CONFIG: &str = "config";

/// Default streaming chunk size for downloads.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Stem of the committed result artifact inside a job's result directory.
const RESULT_STEM: &str = "processed";

/// Extension used when the uploaded file name carries none.
const DEFAULT_RESULT_EXT: &str = "jpg";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Directories and limits for the transfer subsystem.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Base directory for relative source paths in transfer submissions.
    pub upload_dir: PathBuf,
    /// Committed result artifacts live under `<results_dir>/<job_id>/`.
    pub results_dir: PathBuf,
    /// Read buffer size used when streaming downloads.
    pub chunk_size: usize,
    /// Accepted download kinds.
    pub kinds: Vec<String>,
    /// Retry policy for post-rename verification.
    pub verify: Backoff,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("./relay_data/uploads"),
            results_dir: PathBuf::from("./relay_data/results"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            kinds: vec![KIND_INPUT.to_string(), KIND_CONFIG.to_string()],
            verify: Backoff::exponential(Duration::from_millis(500), 1.5, Duration::from_secs(30))
                .with_max_attempts(5)
                .with_max_elapsed(Duration::from_secs(30)),
        }
    }
}

// ---------------------------------------------------------------------------
// Download handle
// ---------------------------------------------------------------------------

/// An opened file ready to be streamed to a client.
#[derive(Debug)]
pub struct Download {
    pub file: File,
    pub len: u64,
    pub file_name: String,
}

async fn open_existing(path: &Path, entity: &'static str) -> Result<Download, CoreError> {
    let not_found = || CoreError::NotFound {
        entity,
        id: path.display().to_string(),
    };

    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => return Err(not_found()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
        Err(e) => return Err(CoreError::Internal(format!("Failed to stat {}: {e}", path.display()))),
    };

    let file = File::open(path)
        .await
        .map_err(|e| CoreError::Internal(format!("Failed to open {}: {e}", path.display())))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());

    Ok(Download {
        file,
        len: meta.len(),
        file_name,
    })
}

// ---------------------------------------------------------------------------
// FileTransfer
// ---------------------------------------------------------------------------

/// Transfer mappings plus the upload commit path.
///
/// Mappings are written once at submission and only read afterwards, so
/// downloads can run concurrently with store transitions.
pub struct FileTransfer {
    config: TransferConfig,
    sources: RwLock<HashMap<JobId, BTreeMap<String, PathBuf>>>,
}

impl FileTransfer {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            sources: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Resolve a submitted source path; relative paths sit under `upload_dir`.
    pub fn resolve_source(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.upload_dir.join(path)
        }
    }

    /// Fail with `NotFound` unless `path` is an existing regular file.
    pub async fn ensure_source_exists(&self, path: &Path) -> Result<(), CoreError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(()),
            _ => Err(CoreError::NotFound {
                entity: "Source file",
                id: path.display().to_string(),
            }),
        }
    }

    /// Record the files a worker may download for `job_id`.
    pub async fn register_source(&self, job_id: JobId, files: BTreeMap<String, PathBuf>) {
        tracing::debug!(job_id = %job_id, kinds = ?files.keys().collect::<Vec<_>>(), "Transfer source registered");
        self.sources.write().await.insert(job_id, files);
    }

    pub async fn has_source(&self, job_id: JobId) -> bool {
        self.sources.read().await.contains_key(&job_id)
    }

    /// Open one of a job's source files for streaming.
    ///
    /// `Validation` for a kind outside the configured set, `NotFound` when
    /// the job has no mapping or the mapped file is gone.
    pub async fn open_download(&self, job_id: JobId, kind: &str) -> Result<Download, CoreError> {
        if !self.config.kinds.iter().any(|k| k == kind) {
            return Err(CoreError::Validation(format!(
                "Unknown file kind '{kind}', expected one of: {}",
                self.config.kinds.join(", ")
            )));
        }

        let path = {
            let sources = self.sources.read().await;
            let files = sources.get(&job_id).ok_or_else(|| CoreError::NotFound {
                entity: "Transfer mapping",
                id: job_id.to_string(),
            })?;
            files.get(kind).cloned().ok_or_else(|| CoreError::NotFound {
                entity: "Transfer file",
                id: format!("{job_id}/{kind}"),
            })?
        };

        open_existing(&path, "File").await
    }

    /// Open a committed result artifact.
    pub async fn open_result(&self, path: &Path) -> Result<Download, CoreError> {
        open_existing(path, "Result file").await
    }

    /// Final location of a job's result artifact.
    pub fn result_path(&self, job_id: JobId, file_name: Option<&str>) -> PathBuf {
        let ext = file_name
            .and_then(|n| Path::new(n).extension())
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_else(|| DEFAULT_RESULT_EXT.to_string());

        self.config
            .results_dir
            .join(job_id.to_string())
            .join(format!("{RESULT_STEM}.{ext}"))
    }

    /// Stream an upload to disk and commit it atomically.
    ///
    /// Bytes go to a temporary file beside the final path while a SHA-256
    /// digest is computed. An empty upload is rejected before it can
    /// replace anything. A previously committed artifact is moved aside
    /// for the rename and restored if the new file cannot be verified, so
    /// a failed re-upload never loses the result already attached to the
    /// job.
    pub async fn commit_upload<S, B, E>(
        &self,
        job_id: JobId,
        file_name: Option<&str>,
        stream: S,
    ) -> Result<UploadMetadata, CoreError>
    where
        S: Stream<Item = Result<B, E>> + Unpin,
        B: AsRef<[u8]>,
        E: Display,
    {
        let final_path = self.result_path(job_id, file_name);
        let dir = final_path
            .parent()
            .ok_or_else(|| CoreError::Internal(format!("Result path {} has no parent", final_path.display())))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CoreError::Internal(format!("Failed to create {}: {e}", dir.display())))?;

        let temp_path = dir.join(format!(".{}.part", uuid::Uuid::new_v4()));

        let written = match write_stream(&temp_path, stream).await {
            Ok(written) => written,
            Err(e) => {
                remove_quietly(&temp_path).await;
                return Err(e);
            }
        };

        if written.size_bytes == 0 {
            remove_quietly(&temp_path).await;
            tracing::warn!(job_id = %job_id, "Rejected empty result upload");
            return Err(CoreError::Internal(format!(
                "Upload for job {job_id} is empty"
            )));
        }

        let backup = match set_aside(&final_path, dir).await {
            Ok(backup) => backup,
            Err(e) => {
                remove_quietly(&temp_path).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            remove_quietly(&temp_path).await;
            restore(backup.as_deref(), &final_path).await;
            return Err(CoreError::Internal(format!(
                "Failed to commit upload to {}: {e}",
                final_path.display()
            )));
        }

        let verified = self
            .config
            .verify
            .retry(|attempt| verify_committed(&final_path, attempt))
            .await;

        match verified {
            Ok(size) => {
                if let Some(backup) = &backup {
                    remove_quietly(backup).await;
                }
                tracing::info!(
                    job_id = %job_id,
                    path = %final_path.display(),
                    size_bytes = size,
                    "Result upload committed",
                );
                Ok(UploadMetadata {
                    path: final_path,
                    size_bytes: size,
                    sha256: written.sha256,
                    uploaded_at: Utc::now(),
                })
            }
            Err(reason) => {
                tracing::error!(
                    job_id = %job_id,
                    path = %final_path.display(),
                    error = %reason,
                    restored_previous = backup.is_some(),
                    "Upload verification failed, discarding artifact",
                );
                remove_quietly(&final_path).await;
                restore(backup.as_deref(), &final_path).await;
                Err(CoreError::Internal(format!(
                    "Upload for job {job_id} could not be verified: {reason}"
                )))
            }
        }
    }
}

impl Default for FileTransfer {
    fn default() -> Self {
        Self::new(TransferConfig::default())
    }
}

struct Written {
    sha256: String,
    size_bytes: u64,
}

async fn write_stream<S, B, E>(path: &Path, mut stream: S) -> Result<Written, CoreError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let io_err = |e: std::io::Error| CoreError::Internal(format!("Failed to write {}: {e}", path.display()));

    let mut file = File::create(path).await.map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut size_bytes = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| CoreError::Validation(format!("Upload stream failed: {e}")))?;
        let bytes = chunk.as_ref();
        hasher.update(bytes);
        file.write_all(bytes).await.map_err(io_err)?;
        size_bytes += bytes.len() as u64;
    }

    file.flush().await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;

    Ok(Written {
        sha256: format!("{:x}", hasher.finalize()),
        size_bytes,
    })
}

/// Move an already committed artifact out of the way of a new upload.
/// Returns its temporary location, or `None` when there was nothing to move.
async fn set_aside(final_path: &Path, dir: &Path) -> Result<Option<PathBuf>, CoreError> {
    let backup = dir.join(format!(".{}.prev", uuid::Uuid::new_v4()));
    match tokio::fs::rename(final_path, &backup).await {
        Ok(()) => Ok(Some(backup)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CoreError::Internal(format!(
            "Failed to move previous result {} aside: {e}",
            final_path.display()
        ))),
    }
}

async fn restore(backup: Option<&Path>, final_path: &Path) {
    let Some(backup) = backup else { return };
    if let Err(e) = tokio::fs::rename(backup, final_path).await {
        tracing::error!(
            path = %final_path.display(),
            backup = %backup.display(),
            error = %e,
            "Failed to restore previous result",
        );
    }
}

async fn verify_committed(path: &Path, attempt: u32) -> Result<u64, String> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > 0 => Ok(meta.len()),
        Ok(_) => {
            tracing::debug!(path = %path.display(), attempt, "Committed file is empty");
            Err("file is empty".to_string())
        }
        Err(e) => {
            tracing::debug!(path = %path.display(), attempt, error = %e, "Committed file not visible yet");
            Err(format!("file not visible: {e}"))
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}
