//! Local batch service: persists submitted jobs and runs them on demand,
//! writing completion reports the way the managed service does.

use super::fleet_store::{FleetError, FleetStore};
use crate::{
    errors::{ControllerError, ControllerResult},
    models::{
        event::StorageEvent,
        job::{BatchJob, JobId, JobRequest, JobStatus, ReportingLevel},
        manifest::{ObjectLocation, ReportEntry, TaskStatus, url_encode},
    },
    services::{
        gateways::{BatchService, StorageGateway},
        manifest_reader::{REPORT_FORMAT, REPORT_SCHEMA, ReportManifestDoc, ReportResultDoc, write_csv},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(FromRow)]
struct JobRow {
    id: String,
    request: String,
    status: String,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn into_job(self) -> ControllerResult<BatchJob> {
        Ok(BatchJob {
            id: JobId::new(self.id),
            request: serde_json::from_str(&self.request)?,
            status: self
                .status
                .parse()
                .map_err(|e: String| ControllerError::Configuration(format!("job row corrupt: {}", e)))?,
            created_at: self.created_at,
            finished_at: self.finished_at,
        })
    }
}

#[derive(Clone)]
pub struct LocalBatchService {
    db: Arc<SqlitePool>,
    store: FleetStore,
    /// Notification id fired when a completion report lands.
    event_id: String,
}

impl LocalBatchService {
    pub fn new(db: Arc<SqlitePool>, store: FleetStore, event_id: impl Into<String>) -> Self {
        Self {
            db,
            store,
            event_id: event_id.into(),
        }
    }

    pub async fn get_job(&self, id: &JobId) -> ControllerResult<Option<BatchJob>> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT id, request, status, created_at, finished_at FROM batch_jobs WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&*self.db)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    /// Run every submitted job to completion and return the report events.
    ///
    /// A job whose run fails goes back to `submitted` for the next call; the
    /// remaining jobs still run.
    pub async fn run_pending(&self) -> ControllerResult<Vec<StorageEvent>> {
        let pending = sqlx::query_as::<_, JobRow>(
            "SELECT id, request, status, created_at, finished_at FROM batch_jobs
             WHERE status = 'submitted' ORDER BY created_at",
        )
        .fetch_all(&*self.db)
        .await?;

        let mut events = Vec::with_capacity(pending.len());
        for row in pending {
            let job = row.into_job()?;
            let started = sqlx::query("UPDATE batch_jobs SET status = 'running' WHERE id = ? AND status = 'submitted'")
                .bind(job.id.as_str())
                .execute(&*self.db)
                .await?;
            if started.rows_affected() == 0 {
                continue;
            }
            match self.run_job(&job).await {
                Ok(event) => events.push(event),
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "local batch job failed to run, requeued");
                    sqlx::query("UPDATE batch_jobs SET status = 'submitted' WHERE id = ? AND status = 'running'")
                        .bind(job.id.as_str())
                        .execute(&*self.db)
                        .await?;
                }
            }
        }
        Ok(events)
    }

    async fn run_job(&self, job: &BatchJob) -> ControllerResult<StorageEvent> {
        let request = &job.request;
        let mut entries = Vec::with_capacity(request.tasks.len());
        for task in &request.tasks {
            let result = self
                .store
                .copy_in_place(
                    task.bucket.as_str(),
                    &task.key,
                    &request.operation.encryption,
                    &request.operation.tags,
                )
                .await;
            let (status, error_code, http_status, message) = match result {
                Ok(_) => (TaskStatus::Succeeded, None, Some(200), Some("Successful".to_string())),
                Err(err @ FleetError::ObjectNotFound { .. }) => (
                    TaskStatus::Failed,
                    Some("NoSuchKey".to_string()),
                    Some(404),
                    Some(err.to_string()),
                ),
                Err(err) => (
                    TaskStatus::Failed,
                    Some("InternalError".to_string()),
                    Some(500),
                    Some(err.to_string()),
                ),
            };
            entries.push(ReportEntry {
                bucket: task.bucket.clone(),
                key: task.key.clone(),
                version_id: task.version_id.clone(),
                status,
                error_code,
                http_status,
                message,
            });
        }

        let failed = entries.iter().filter(|e| e.status == TaskStatus::Failed).count();
        let manifest = self.write_report(job, &entries).await?;

        let status = if !entries.is_empty() && failed == entries.len() {
            JobStatus::Failed
        } else {
            JobStatus::Complete
        };
        sqlx::query("UPDATE batch_jobs SET status = ?, finished_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(job.id.as_str())
            .execute(&*self.db)
            .await?;

        info!(
            job_id = %job.id,
            tasks = entries.len(),
            failed,
            status = status.as_str(),
            report = %manifest,
            "local batch job finished"
        );
        Ok(StorageEvent::new(self.event_id.clone(), manifest))
    }

    /// Write result CSVs (one per task status) and the report manifest.
    async fn write_report(&self, job: &BatchJob, entries: &[ReportEntry]) -> ControllerResult<ObjectLocation> {
        let report = &job.request.report;
        let job_prefix = format!("{}/job-{}", report.prefix.trim_end_matches('/'), job.id);

        let mut results = Vec::new();
        for status in [TaskStatus::Succeeded, TaskStatus::Failed] {
            if status == TaskStatus::Succeeded && report.level == ReportingLevel::FailedTasksOnly {
                continue;
            }
            let rows: Vec<[String; 7]> = entries
                .iter()
                .filter(|e| e.status == status)
                .map(report_record)
                .collect();
            if rows.is_empty() {
                continue;
            }
            let lines = rows.len();
            let body = Bytes::from(write_csv(rows)?);
            let location = ObjectLocation::new(
                report.bucket.clone(),
                format!("{}/results/{}.csv", job_prefix, Uuid::new_v4().simple()),
            );
            let md5 = self.store.put_object(&location, body).await?;
            debug!(job_id = %job.id, file = %location, lines, "wrote report file");
            results.push(ReportResultDoc {
                task_execution_status: status.as_str().to_string(),
                bucket: format!("arn:aws:s3:::{}", report.bucket),
                md5_checksum: Some(md5),
                key: location.key,
            });
        }

        let doc = ReportManifestDoc {
            format: REPORT_FORMAT.to_string(),
            report_creation_date: Utc::now(),
            results,
            report_schema: REPORT_SCHEMA.to_string(),
        };
        let location = ObjectLocation::new(report.bucket.clone(), format!("{}/manifest.json", job_prefix));
        self.store
            .put_object(&location, Bytes::from(serde_json::to_vec(&doc)?))
            .await?;
        Ok(location)
    }
}

fn report_record(entry: &ReportEntry) -> [String; 7] {
    [
        entry.bucket.to_string(),
        url_encode(&entry.key),
        entry.version_id.clone().unwrap_or_default(),
        entry.status.as_str().to_string(),
        entry.error_code.clone().unwrap_or_default(),
        entry.http_status.map(|s| s.to_string()).unwrap_or_default(),
        entry.message.clone().unwrap_or_default(),
    ]
}

#[async_trait]
impl BatchService for LocalBatchService {
    async fn create_job(&self, request: &JobRequest) -> ControllerResult<JobId> {
        if request.role_arn.is_empty() {
            return Err(ControllerError::Configuration("job submitted without a role".into()));
        }
        self.store
            .fetch_bucket(request.report.bucket.as_str())
            .await
            .map_err(|e| ControllerError::Configuration(format!("report destination: {}", e)))?;

        let id = Uuid::new_v4().simple().to_string();
        let inserted = sqlx::query(
            "INSERT INTO batch_jobs (
                id, client_request_token, source_bucket, request, status, task_count, created_at
             ) VALUES (?, ?, ?, ?, 'submitted', ?, ?)
             ON CONFLICT(client_request_token) DO NOTHING",
        )
        .bind(&id)
        .bind(&request.client_request_token)
        .bind(request.source_bucket.as_str())
        .bind(serde_json::to_string(request)?)
        .bind(request.tasks.len() as i64)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        let job_id = sqlx::query_scalar::<_, String>("SELECT id FROM batch_jobs WHERE client_request_token = ?")
            .bind(&request.client_request_token)
            .fetch_one(&*self.db)
            .await?;
        if inserted.rows_affected() == 1 {
            debug!(job_id = %job_id, tasks = request.tasks.len(), "accepted batch job");
        } else {
            debug!(job_id = %job_id, "request token reused, returning existing job");
        }
        Ok(JobId::new(job_id))
    }
}
