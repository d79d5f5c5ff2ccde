//! Handlers for the `/jobs` resource.
//!
//! Submission, the worker's claim/confirm/report cycle and status lookup.
//! Every state change is delegated to the job store; these handlers only
//! validate input and shape responses.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_core::error::CoreError;
use relay_core::job::{JobView, SubmitOptions};
use relay_core::protocol::{ConfirmRequest, ReportResult, SubmitJob, SubmitResponse, SubmitTransferJob};
use relay_core::transfer::{KIND_CONFIG, KIND_INPUT};
use relay_core::types::JobId;
use serde::Deserialize;
use validator::Validate;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// Query parameters for `GET /jobs/next`.
#[derive(Debug, Deserialize)]
pub struct NextJobQuery {
    pub worker: String,
}

fn options(state: &AppState, read_lease_secs: Option<u64>, requires_file_transfer: bool) -> SubmitOptions {
    SubmitOptions {
        read_lease: read_lease_secs.map_or(state.config.read_lease, Duration::from_secs),
        requires_file_transfer,
    }
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Submit a job whose refs the worker can resolve directly.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(input): Json<SubmitJob>,
) -> AppResult<impl IntoResponse> {
    input.validate().map_err(CoreError::from)?;

    let job_id = state
        .store
        .submit(
            input.input_ref,
            input.config_ref,
            options(&state, input.read_lease_secs, false),
        )
        .await;
    let queue_position = state.store.pending_count().await;

    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: SubmitResponse {
                job_id,
                queue_position,
            },
        }),
    ))
}

/// POST /api/v1/jobs/transfer
///
/// Submit a job whose input and config live on the broker's filesystem.
/// Both files must exist; workers download them via `/files/{id}/{kind}`.
pub async fn submit_transfer_job(
    State(state): State<AppState>,
    Json(input): Json<SubmitTransferJob>,
) -> AppResult<impl IntoResponse> {
    input.validate().map_err(CoreError::from)?;

    let input_path = state.transfer.resolve_source(&input.input_path);
    let config_path = state.transfer.resolve_source(&input.config_path);
    state.transfer.ensure_source_exists(&input_path).await?;
    state.transfer.ensure_source_exists(&config_path).await?;

    // The mapping must exist before the job becomes claimable.
    let job_id = uuid::Uuid::now_v7();
    state
        .transfer
        .register_source(
            job_id,
            BTreeMap::from([
                (KIND_INPUT.to_string(), input_path.clone()),
                (KIND_CONFIG.to_string(), config_path.clone()),
            ]),
        )
        .await;

    state
        .store
        .submit_with_id(
            job_id,
            input_path.display().to_string(),
            config_path.display().to_string(),
            options(&state, input.read_lease_secs, true),
        )
        .await;
    let queue_position = state.store.pending_count().await;

    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: SubmitResponse {
                job_id,
                queue_position,
            },
        }),
    ))
}

// ---------------------------------------------------------------------------
// Worker cycle
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs/next?worker={id}
///
/// Claim the oldest pending job. An empty 200 body means there is no work.
pub async fn next_job(
    State(state): State<AppState>,
    Query(query): Query<NextJobQuery>,
) -> AppResult<Response> {
    match state.store.claim(&query.worker).await? {
        Some(job) => Ok(Json(DataResponse { data: job }).into_response()),
        None => Ok((StatusCode::OK, Body::empty()).into_response()),
    }
}

/// POST /api/v1/jobs/{id}/start
///
/// Confirm a claimed job, moving it from reading to processing.
pub async fn start_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
    Json(input): Json<ConfirmRequest>,
) -> AppResult<Json<DataResponse<JobView>>> {
    input.validate().map_err(CoreError::from)?;
    let job = state.store.confirm(job_id, &input.worker_id).await?;
    Ok(Json(DataResponse { data: job }))
}

/// POST /api/v1/jobs/result
///
/// Record the terminal outcome reported by the owning worker.
pub async fn report_result(
    State(state): State<AppState>,
    Json(input): Json<ReportResult>,
) -> AppResult<Json<DataResponse<JobView>>> {
    input.validate().map_err(CoreError::from)?;
    let job = state
        .store
        .report_result(
            input.job_id,
            &input.worker_id,
            input.success,
            input.elapsed_secs,
            input.error,
            input.payload,
        )
        .await?;
    Ok(Json(DataResponse { data: job }))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<Json<DataResponse<JobView>>> {
    let job = state.store.status(job_id).await?;
    Ok(Json(DataResponse { data: job }))
}
