//! Route definitions for the `/files` resource.

use axum::routing::get;
use axum::Router;

use crate::handlers::files;
use crate::state::AppState;

/// Routes mounted at `/files`.
///
/// ```text
/// GET    /{id}/{kind}      -> download_source
/// ```
pub fn router() -> Router<AppState> {
    Router::new().route("/{id}/{kind}", get(files::download_source))
}
