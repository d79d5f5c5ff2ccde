//! Route definitions for worker registration and statistics.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::workers;
use crate::state::AppState;

/// Routes merged at the API root.
///
/// ```text
/// POST   /register         -> register
/// GET    /workers          -> list_workers
/// GET    /stats            -> stats
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(workers::register))
        .route("/workers", get(workers::list_workers))
        .route("/stats", get(workers::stats))
}
