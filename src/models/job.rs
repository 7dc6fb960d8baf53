//! Batch jobs submitted to the batch-processing service.

use super::{
    bucket::{BucketId, EncryptionScheme, Tag},
    manifest::ObjectLocation,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Identifier assigned to a job by the batch service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Submitted,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status `{}`", other)),
        }
    }
}

/// Which task outcomes end up in the completion report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportingLevel {
    AllTasks,
    FailedTasksOnly,
}

impl ReportingLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllTasks => "AllTasks",
            Self::FailedTasksOnly => "FailedTasksOnly",
        }
    }
}

impl FromStr for ReportingLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AllTasks" => Ok(Self::AllTasks),
            "FailedTasksOnly" => Ok(Self::FailedTasksOnly),
            other => Err(format!(
                "reporting level must be AllTasks or FailedTasksOnly, got `{}`",
                other
            )),
        }
    }
}

impl fmt::Display for ReportingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format of the manifest a job reads its tasks from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestFormat {
    /// An inventory `manifest.json`, consumed as-is.
    #[serde(rename = "S3InventoryReport_CSV_20161130")]
    InventoryReport,
    /// A plain `bucket,key[,version]` CSV written by the launcher.
    #[serde(rename = "S3BatchOperations_CSV_20180820")]
    Csv,
}

/// Copy every listed object onto itself with the given encryption applied.
///
/// `tags` are merged into each object's existing tag set as part of the same
/// copy; existing keys keep their values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyInPlace {
    pub encryption: EncryptionScheme,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReportConfig {
    pub bucket: BucketId,
    pub prefix: String,
    pub level: ReportingLevel,
}

/// One object the job will rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTask {
    pub bucket: BucketId,
    pub key: String,
    pub version_id: Option<String>,
}

/// Everything the batch service needs to create a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Idempotency token; the service returns the existing job when a token
    /// is reused.
    pub client_request_token: String,
    pub source_bucket: BucketId,
    pub manifest: ObjectLocation,
    pub manifest_format: ManifestFormat,
    pub manifest_etag: Option<String>,
    pub operation: CopyInPlace,
    pub report: JobReportConfig,
    pub role_arn: String,
    pub description: String,
    pub tasks: Vec<JobTask>,
}

/// A job as recorded by the batch service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: JobId,
    pub request: JobRequest,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
