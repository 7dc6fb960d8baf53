//! Controller entry points: storage notifications, scheduled passes and
//! operator actions.

use crate::{
    errors::AppError,
    models::{bucket::BucketId, event::EventPayload, job::JobId},
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use serde_json::json;

/// `POST /events`
///
/// Accepts a notification envelope (`Records[]`) or a single flat event.
/// Handled and soft-failed events answer 200 with their outcomes; a hard
/// failure answers 5xx so the sender redelivers.
pub async fn post_events(
    State(state): State<AppState>,
    Json(payload): Json<EventPayload>,
) -> Result<impl IntoResponse, AppError> {
    let outcomes = state.controller.handle_payload(payload).await?;
    Ok(Json(outcomes))
}

/// `POST /scan`: run one selector + scheduler pass now.
pub async fn post_scan(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let report = state.controller.run_inventory_pass().await?;
    Ok(Json(report))
}

/// `POST /buckets/{bucket}/rearm`
pub async fn post_rearm(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let bucket = BucketId::new(bucket);
    let rearmed = state.controller.rearm_bucket(&bucket).await?;
    Ok(Json(json!({ "bucket": bucket, "rearmed": rearmed })))
}

/// `GET /ledger/jobs/{job_id}`: the inventory manifest a job was launched for.
pub async fn get_job_ledger(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let job_id = JobId::new(job_id);
    match state.controller.ledger_entry_for_job(&job_id).await? {
        Some(entry) => Ok(Json(entry)),
        None => Err(AppError::not_found(format!("no manifest launched job `{}`", job_id))),
    }
}
