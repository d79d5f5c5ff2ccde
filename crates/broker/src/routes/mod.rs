pub mod files;
pub mod health;
pub mod jobs;
pub mod workers;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /register                          register worker (POST)
/// /workers                           list registrations
/// /stats                             workers, counts, recent jobs
///
/// /jobs                              submit with direct refs (POST)
/// /jobs/transfer                     submit with broker-local files (POST)
/// /jobs/next?worker={id}             claim oldest pending job
/// /jobs/result                       report terminal outcome (POST)
/// /jobs/{id}                         status + result
/// /jobs/{id}/start                   confirm claim (POST)
/// /jobs/{id}/upload                  multipart result upload (POST)
/// /jobs/{id}/result-file             stream uploaded result
///
/// /files/{id}/{kind}                 stream transfer source file
/// ```
///
/// `max_upload_bytes` bounds the request body of the upload route only.
pub fn api_routes(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        .merge(workers::router())
        .nest("/jobs", jobs::router(max_upload_bytes))
        .nest("/files", files::router())
}
