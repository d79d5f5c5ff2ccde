//! Local file handling for jobs: per-job working directories and waiting
//! for the backend's output to land on disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use relay_core::backoff::Backoff;
use relay_core::types::JobId;

/// Create a fresh working directory `job_<id>_<ts>_<suffix>` under `root`.
///
/// The random suffix keeps two attempts at the same job apart.
pub async fn create_work_dir(root: &Path, job_id: JobId) -> std::io::Result<PathBuf> {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let dir = root.join(format!(
        "job_{}_{}_{}",
        job_id,
        Utc::now().timestamp(),
        &suffix[..8]
    ));
    tokio::fs::create_dir_all(&dir).await?;
    Ok(dir)
}

/// Remove a job's working directory and everything in it. Failures are
/// logged and otherwise ignored.
pub async fn remove_work_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::debug!(path = %dir.display(), "Removed work directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %dir.display(), error = %e, "Failed to remove work directory");
        }
    }
}

/// Local file name for a transferred file of `kind`, keeping the
/// extension of the broker-side reference.
pub fn local_name(kind: &str, reference: &str) -> String {
    match Path::new(reference).extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.chars().all(|c| c.is_ascii_alphanumeric()) => format!("{kind}.{ext}"),
        _ => kind.to_string(),
    }
}

/// Size of the file at `path` if it exists and is non-empty.
pub async fn non_empty_size(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Some(meta.len()),
        _ => None,
    }
}

/// Poll every `interval` until `path` exists with a non-zero size or
/// `max_wait` has passed. Returns the final size when the file showed up.
pub async fn wait_for_output(path: &Path, interval: Duration, max_wait: Duration) -> Option<u64> {
    let policy = Backoff::fixed(interval).with_max_elapsed(max_wait);
    policy
        .retry(|attempt| async move {
            match non_empty_size(path).await {
                Some(size) => {
                    if attempt > 1 {
                        tracing::debug!(path = %path.display(), attempt, "Output file appeared");
                    }
                    Ok(size)
                }
                None => Err(()),
            }
        })
        .await
        .ok()
}
