//! HTTP handlers for the local fleet: buckets, objects and the runners that
//! stand in for managed inventory delivery and batch execution.
//! Object bodies are streamed both ways rather than buffered.

use crate::{
    errors::{AppError, ControllerError},
    models::{
        bucket::{EncryptionStatus, Tag},
        job::JobId,
        object::ObjectRecord,
    },
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use std::io;
use tokio_util::io::ReaderStream;

/// Request body for `PUT /fleet/buckets/{bucket}`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBucketReq {
    /// Defaults to the deployment region.
    pub region: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub default_encryption: Option<EncryptionStatus>,
}

/// `PUT /fleet/buckets/{bucket}`: create a bucket with its tag set.
pub async fn create_bucket(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Json(payload): Json<Option<CreateBucketReq>>,
) -> Result<impl IntoResponse, AppError> {
    let req = payload.unwrap_or_default();
    let region = req
        .region
        .unwrap_or_else(|| state.controller.config().region.clone());
    let created = state
        .fleet
        .store
        .create_bucket(&bucket, &region, &req.tags, req.default_encryption)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `GET /fleet/buckets/{bucket}`: the bucket and its objects.
pub async fn get_bucket(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let record = state.fleet.store.fetch_bucket(&bucket).await?;
    let objects = state.fleet.store.list_objects(&bucket).await?;
    Ok(Json(serde_json::json!({ "bucket": record, "objects": objects })))
}

/// `PUT /fleet/buckets/{bucket}/tags`: replace the bucket's tag set.
pub async fn put_bucket_tags(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Json(tags): Json<Vec<Tag>>,
) -> Result<impl IntoResponse, AppError> {
    state.fleet.store.put_bucket_tags(&bucket, &tags).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /fleet/objects/{bucket}/{*key}`: upload an object.
pub async fn upload_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let object = state
        .fleet
        .store
        .upload_object_stream(&bucket, &key, stream)
        .await?;

    let mut response = Response::new(Body::empty());
    set_object_headers(response.headers_mut(), &object, false);
    Ok(response)
}

/// `GET /fleet/objects/{bucket}/{*key}`: download an object as a stream.
pub async fn get_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let (object, file) = state.fleet.store.get_object_reader(&bucket, &key).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    set_object_headers(response.headers_mut(), &object, true);
    Ok(response)
}

/// `POST /fleet/inventory/run`: deliver every configured inventory report
/// and hand the manifests to the controller.
pub async fn run_inventory(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let deliveries = state.run_inventory_cycle().await?;
    Ok(Json(deliveries))
}

/// `POST /fleet/jobs/run`: execute submitted batch jobs and hand their
/// completion reports to the controller.
pub async fn run_jobs(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let deliveries = state.run_job_cycle().await?;
    Ok(Json(deliveries))
}

/// `GET /fleet/jobs/{job_id}`
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let job_id = JobId::new(job_id);
    match state.fleet.batch.get_job(&job_id).await? {
        Some(job) => Ok(Json(job)),
        None => Err(ControllerError::NotFound(format!("job `{}`", job_id)).into()),
    }
}

fn set_object_headers(headers: &mut HeaderMap, object: &ObjectRecord, with_length: bool) {
    if with_length {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(object.size_bytes.max(0)));
        if let Ok(value) = HeaderValue::from_str(&object.last_modified.to_rfc2822()) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", object.etag)) {
        headers.insert(header::ETAG, value);
    }
    headers.insert(
        HeaderName::from_static("x-amz-server-side-encryption"),
        HeaderValue::from_static(object.encryption.as_str()),
    );
    if let Some(version) = object.version_id.as_deref() {
        if let Ok(value) = HeaderValue::from_str(version) {
            headers.insert(HeaderName::from_static("x-amz-version-id"), value);
        }
    }
    if let Some(key_id) = object.kms_key_id.as_deref() {
        if let Ok(value) = HeaderValue::from_str(key_id) {
            headers.insert(
                HeaderName::from_static("x-amz-server-side-encryption-aws-kms-key-id"),
                value,
            );
        }
    }
}
