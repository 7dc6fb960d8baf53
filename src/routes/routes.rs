use crate::{
    handlers::{
        event_handlers::{get_job_ledger, post_events, post_rearm, post_scan},
        fleet_handlers::{
            create_bucket, get_bucket, get_job, get_object, put_bucket_tags, run_inventory,
            run_jobs, upload_object,
        },
        health_handlers::{healthz, readyz},
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build the router for the controller and the local fleet.
///
/// Controller routes take notifications and operator actions; `/fleet`
/// routes drive the local storage, inventory and batch backends.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Controller
        .route("/events", post(post_events))
        .route("/scan", post(post_scan))
        .route("/buckets/{bucket}/rearm", post(post_rearm))
        .route("/ledger/jobs/{job_id}", get(get_job_ledger))
        // Local fleet
        .route("/fleet/buckets/{bucket}", put(create_bucket).get(get_bucket))
        .route("/fleet/buckets/{bucket}/tags", put(put_bucket_tags))
        .route("/fleet/objects/{bucket}/{*key}", put(upload_object).get(get_object))
        .route("/fleet/inventory/run", post(run_inventory))
        .route("/fleet/jobs/run", post(run_jobs))
        .route("/fleet/jobs/{job_id}", get(get_job))
}
