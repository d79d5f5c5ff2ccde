//! Handlers for file transfer: source downloads, result upload and result
//! download.
//!
//! Downloads are streamed in fixed-size chunks; uploads are streamed to
//! disk through the transfer subsystem. Neither holds the store lock while
//! moving bytes.

use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_core::error::CoreError;
use relay_core::protocol::UploadResponse;
use relay_core::transfer::Download;
use relay_core::types::JobId;
use tokio_util::io::ReaderStream;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// Multipart field carrying the result artifact.
const UPLOAD_FIELD: &str = "file";

fn stream_download(download: Download, chunk_size: usize) -> AppResult<Response> {
    let stream = ReaderStream::with_capacity(download.file, chunk_size);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, download.len.to_string())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", download.file_name.replace('"', "")),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| AppError::InternalError(e.to_string()))
}

/// GET /api/v1/files/{id}/{kind}
///
/// Stream one of a transfer job's source files.
pub async fn download_source(
    State(state): State<AppState>,
    Path((job_id, kind)): Path<(JobId, String)>,
) -> AppResult<Response> {
    let download = state.transfer.open_download(job_id, &kind).await?;
    tracing::info!(job_id = %job_id, kind = %kind, size_bytes = download.len, "Serving transfer file");
    stream_download(download, state.transfer.config().chunk_size)
}

/// POST /api/v1/jobs/{id}/upload
///
/// Accept the result artifact for a completed job as multipart field
/// `file`. The artifact is committed atomically and verified before its
/// metadata is attached to the job's result.
pub async fn upload_result(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
    mut multipart: Multipart,
) -> AppResult<impl IntoResponse> {
    state.store.ensure_uploadable(job_id).await?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let file_name = field.file_name().map(str::to_string);
        let upload = state
            .transfer
            .commit_upload(job_id, file_name.as_deref(), Box::pin(field))
            .await?;
        let job = state.store.attach_upload(job_id, upload.clone()).await?;

        tracing::info!(
            job_id = %job.id,
            size_bytes = upload.size_bytes,
            sha256 = %upload.sha256,
            "Result upload attached",
        );

        return Ok((
            StatusCode::CREATED,
            Json(DataResponse {
                data: UploadResponse { job_id, upload },
            }),
        ));
    }

    Err(AppError::BadRequest(format!(
        "Missing required '{UPLOAD_FIELD}' field"
    )))
}

/// GET /api/v1/jobs/{id}/result-file
///
/// Stream the uploaded result artifact of a completed job.
pub async fn download_result(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<Response> {
    let job = state.store.status(job_id).await?;
    let path = job
        .result
        .and_then(|r| r.upload)
        .map(|u| u.path)
        .ok_or_else(|| CoreError::NotFound {
            entity: "Result file",
            id: job_id.to_string(),
        })?;

    let download = state.transfer.open_result(&path).await?;
    stream_download(download, state.transfer.config().chunk_size)
}
