//! Handlers for worker registration and broker statistics.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use relay_core::error::CoreError;
use relay_core::protocol::{RegisterWorker, StatsResponse, WorkerView};
use relay_core::store::RECENT_JOBS_LIMIT;
use validator::Validate;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// POST /api/v1/register
///
/// Idempotent upsert of a worker registration.
pub async fn register(
    State(state): State<AppState>,
    Json(input): Json<RegisterWorker>,
) -> AppResult<Json<DataResponse<WorkerView>>> {
    input.validate().map_err(CoreError::from)?;
    let worker = state.store.register_worker(input).await;
    Ok(Json(DataResponse { data: worker }))
}

/// GET /api/v1/workers
///
/// Every registration with its online flag.
pub async fn list_workers(State(state): State<AppState>) -> Json<DataResponse<Vec<WorkerView>>> {
    let workers = state.store.list_workers(Utc::now()).await;
    Json(DataResponse { data: workers })
}

/// GET /api/v1/stats
///
/// Active workers, per-status counts and the most recently finished jobs.
pub async fn stats(State(state): State<AppState>) -> Json<DataResponse<StatsResponse>> {
    let now = Utc::now();
    let stats = StatsResponse {
        active_workers: state.store.active_workers(now).await,
        jobs: state.store.counts().await,
        recent_jobs: state.store.recent_archived(RECENT_JOBS_LIMIT).await,
    };
    Json(DataResponse { data: stats })
}
