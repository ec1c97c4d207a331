//! Sync progress polling and cancellation.

use super::{AppError, AppState};
use crate::error::BrokerError;
use crate::sync::SyncJob;
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

#[derive(Serialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<SyncJob>,
}

/// Create sync API router
pub fn create_sync_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/sync/jobs", get(list_active_jobs))
        .route("/api/sync/jobs/:id", get(get_job))
        .route("/api/sync/jobs/:id/cancel", post(cancel_job))
        .with_state(state)
}

/// Loads a job, hiding jobs of other sellers behind a 404.
pub(crate) fn owned_job(state: &AppState, seller_id: &str, job_id: &str) -> Result<SyncJob, AppError> {
    state
        .sync
        .tracker()
        .get(job_id)?
        .filter(|job| job.seller_id == seller_id)
        .ok_or_else(|| AppError::Broker(BrokerError::NotFound(format!("sync job {}", job_id))))
}

/// GET /api/sync/jobs - the seller's running jobs
async fn list_active_jobs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ListJobsResponse>, AppError> {
    let seller_id = state.seller(&headers)?;
    let jobs = state.sync.tracker().list_active(&seller_id)?;
    Ok(Json(ListJobsResponse { jobs }))
}

/// GET /api/sync/jobs/:id
async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SyncJob>, AppError> {
    let seller_id = state.seller(&headers)?;
    Ok(Json(owned_job(&state, &seller_id, &job_id)?))
}

/// POST /api/sync/jobs/:id/cancel
///
/// Cancelling a finished job is a no-op; the job is returned either way.
async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SyncJob>, AppError> {
    let seller_id = state.seller(&headers)?;
    owned_job(&state, &seller_id, &job_id)?;

    if state.sync.tracker().cancel(&job_id)? {
        info!(seller_id = %seller_id, job_id = %job_id, "Sync job cancel requested");
    }
    Ok(Json(owned_job(&state, &seller_id, &job_id)?))
}
