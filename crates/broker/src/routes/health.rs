use axum::extract::State;
use axum::{routing::get, Json, Router};
use chrono::Utc;
use relay_core::protocol::{HealthResponse, JobCounts};
use serde::Serialize;

use crate::state::AppState;

/// Root banner payload.
#[derive(Serialize)]
pub struct ServiceInfo {
    pub service: &'static str,
    pub version: &'static str,
    pub active_workers: usize,
    pub jobs: JobCounts,
}

/// GET /health -- liveness plus job counts, polled by workers and monitoring.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let now = Utc::now();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: now,
        active_workers: state.store.active_workers(now).await.len(),
        jobs: state.store.counts().await,
    })
}

/// GET / -- service banner.
async fn banner(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        active_workers: state.store.active_workers(Utc::now()).await.len(),
        jobs: state.store.counts().await,
    })
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(banner))
        .route("/health", get(health_check))
}
