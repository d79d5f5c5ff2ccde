//! Route definitions for the `/jobs` resource.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::handlers::{files, jobs};
use crate::state::AppState;

/// Routes mounted at `/jobs`.
///
/// ```text
/// POST   /                 -> submit_job
/// POST   /transfer         -> submit_transfer_job
/// GET    /next             -> next_job
/// POST   /result           -> report_result
/// GET    /{id}             -> get_job
/// POST   /{id}/start       -> start_job
/// POST   /{id}/upload      -> upload_result
/// GET    /{id}/result-file -> download_result
/// ```
pub fn router(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/", post(jobs::submit_job))
        .route("/transfer", post(jobs::submit_transfer_job))
        .route("/next", get(jobs::next_job))
        .route("/result", post(jobs::report_result))
        .route("/{id}", get(jobs::get_job))
        .route("/{id}/start", post(jobs::start_job))
        .route(
            "/{id}/upload",
            post(files::upload_result).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/{id}/result-file", get(files::download_result))
}
