//! Manifests delivered by the inventory subsystem and by the batch service.
//!
//! A manifest is immutable once delivered. Everything keyed on a manifest
//! (ledger rows, idempotency tokens, catalog partitions) derives from its
//! [`ManifestIdentity`]: the storage location plus the generation timestamp.

use super::{
    bucket::{BucketId, EncryptionStatus},
    job::JobId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Bucket + key of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: BucketId,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<BucketId>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Key of the "directory" holding this object, with a trailing slash.
    pub fn parent_prefix(&self) -> String {
        match self.key.rfind('/') {
            Some(pos) => self.key[..=pos].to_string(),
            None => String::new(),
        }
    }

    /// Parse an `s3://bucket/key` URI.
    pub fn parse_uri(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix("s3://")?;
        let (bucket, key) = rest.split_once('/')?;
        if bucket.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self::new(bucket, key))
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Strip an `arn:aws:s3:::` prefix from a bucket reference.
pub fn bucket_from_arn(value: &str) -> BucketId {
    BucketId::new(value.strip_prefix("arn:aws:s3:::").unwrap_or(value))
}

/// Percent-encode an object key the way inventory reports do; `/` is kept.
pub fn url_encode(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Inverse of [`url_encode`]; also maps `+` to a space. Keys that do not
/// decode to UTF-8 are returned unchanged.
pub fn url_decode(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestKind {
    Inventory,
    BatchReport,
}

impl ManifestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inventory => "inventory",
            Self::BatchReport => "batch_report",
        }
    }
}

impl FromStr for ManifestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inventory" => Ok(Self::Inventory),
            "batch_report" => Ok(Self::BatchReport),
            other => Err(format!("unknown manifest kind `{}`", other)),
        }
    }
}

/// Identity used for idempotent handling of redelivered manifests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestIdentity {
    pub location: ObjectLocation,
    pub generated_at: DateTime<Utc>,
}

impl ManifestIdentity {
    pub fn new(location: ObjectLocation, generated_at: DateTime<Utc>) -> Self {
        Self {
            location,
            generated_at,
        }
    }

    /// Primary key of the ledger row for this manifest.
    pub fn ledger_key(&self) -> String {
        format!("{}@{}", self.location, self.generated_at.timestamp_millis())
    }

    /// Idempotency token handed to the batch service. Fixed-width so it
    /// fits the service's token length limit regardless of key length.
    pub fn request_token(&self) -> String {
        format!("{:x}", md5::compute(self.ledger_key()))
    }
}

impl fmt::Display for ManifestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ledger_key())
    }
}

/// A data file referenced from a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub location: ObjectLocation,
    pub size: u64,
    pub md5: Option<String>,
}

/// One object listed by an inventory report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub bucket: BucketId,
    pub key: String,
    pub version_id: Option<String>,
    pub encryption: Option<EncryptionStatus>,
}

/// A parsed inventory manifest with its entries loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryManifest {
    pub identity: ManifestIdentity,
    pub source_bucket: BucketId,
    pub destination_bucket: BucketId,
    /// Id of the inventory configuration that produced this report.
    pub inventory_id: String,
    pub file_schema: Vec<String>,
    pub files: Vec<ManifestFile>,
    pub entries: Vec<InventoryEntry>,
}

impl InventoryManifest {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Succeeded,
    Failed,
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status `{}`", other)),
        }
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// One task line of a batch completion report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub bucket: BucketId,
    pub key: String,
    pub version_id: Option<String>,
    pub status: TaskStatus,
    pub error_code: Option<String>,
    pub http_status: Option<u16>,
    pub message: Option<String>,
}

/// A parsed batch completion report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub identity: ManifestIdentity,
    pub job_id: JobId,
    pub format: String,
    /// Result files listed by the report manifest, with the status the
    /// service filed them under.
    pub result_files: Vec<(ManifestFile, TaskStatus)>,
    pub entries: Vec<ReportEntry>,
}

impl BatchReport {
    /// Prefix under which the report's result files live.
    pub fn results_prefix(&self) -> ObjectLocation {
        ObjectLocation::new(
            self.identity.location.bucket.clone(),
            format!("{}results/", self.identity.location.parent_prefix()),
        )
    }
}
