//! Loading inventory manifests and batch completion reports.
//!
//! Both formats are a `manifest.json` pointing at headerless CSV data files.
//! Inventory data files are usually gzip-compressed and list one object per
//! line with URL-encoded keys; report files list one task per line.

use crate::{
    errors::{ControllerError, ControllerResult},
    models::{
        bucket::{BucketId, EncryptionStatus},
        job::JobId,
        manifest::{
            BatchReport, InventoryEntry, InventoryManifest, ManifestFile, ManifestIdentity,
            ObjectLocation, ReportEntry, TaskStatus, bucket_from_arn, url_decode,
        },
    },
    services::gateways::StorageGateway,
};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use csv::StringRecord;
use std::{
    io::{self, Read},
    sync::Arc,
};
use tracing::debug;

pub const INVENTORY_MANIFEST_VERSION: &str = "2016-11-30";
pub const REPORT_FORMAT: &str = "Report_CSV_20180820";
pub const REPORT_SCHEMA: &str =
    "Bucket, Key, VersionId, TaskStatus, ErrorCode, HTTPStatusCode, ResultMessage";

/// `manifest.json` written by the inventory subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryManifestDoc {
    pub source_bucket: String,
    pub destination_bucket: String,
    pub version: String,
    /// Milliseconds since the epoch, as a string.
    pub creation_timestamp: String,
    pub file_format: String,
    pub file_schema: String,
    pub files: Vec<InventoryFileDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryFileDoc {
    pub key: String,
    pub size: u64,
    #[serde(rename = "MD5checksum")]
    pub md5_checksum: Option<String>,
}

/// `manifest.json` written by the batch service next to a job's results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReportManifestDoc {
    pub format: String,
    pub report_creation_date: DateTime<Utc>,
    pub results: Vec<ReportResultDoc>,
    pub report_schema: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReportResultDoc {
    pub task_execution_status: String,
    pub bucket: String,
    #[serde(rename = "MD5Checksum")]
    pub md5_checksum: Option<String>,
    pub key: String,
}

#[derive(Clone)]
pub struct ManifestReader {
    storage: Arc<dyn StorageGateway>,
}

impl ManifestReader {
    pub fn new(storage: Arc<dyn StorageGateway>) -> Self {
        Self { storage }
    }

    /// Load an inventory manifest and every entry of its data files.
    ///
    /// # Errors
    ///
    /// `ManifestFormat` when the manifest or a data file cannot be parsed or
    /// fails its checksum; storage errors pass through.
    pub async fn read_inventory(&self, location: &ObjectLocation) -> ControllerResult<InventoryManifest> {
        let raw = self.storage.get_object(location).await?;
        let doc: InventoryManifestDoc = serde_json::from_slice(&raw)
            .map_err(|e| ControllerError::manifest_format(location, e.to_string()))?;

        if !doc.file_format.eq_ignore_ascii_case("CSV") {
            return Err(ControllerError::manifest_format(
                location,
                format!("unsupported inventory file format `{}`", doc.file_format),
            ));
        }
        let millis = doc.creation_timestamp.trim().parse::<i64>().map_err(|_| {
            ControllerError::manifest_format(
                location,
                format!("bad creationTimestamp `{}`", doc.creation_timestamp),
            )
        })?;
        let generated_at = Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
            ControllerError::manifest_format(location, "creationTimestamp out of range")
        })?;

        let source_bucket = BucketId::new(doc.source_bucket.clone());
        let inventory_id = inventory_id_from_key(&location.key, &source_bucket)
            .ok_or_else(|| {
                ControllerError::manifest_format(
                    location,
                    "key does not follow <source>/<inventory id>/<date>/manifest.json",
                )
            })?;
        let schema = split_schema(&doc.file_schema);
        let columns = InventoryColumns::resolve(&schema)
            .ok_or_else(|| ControllerError::manifest_format(location, "schema lacks Bucket/Key"))?;

        // Data files live in the bucket the manifest was delivered to.
        let data_bucket = if doc.destination_bucket.is_empty() {
            location.bucket.clone()
        } else {
            bucket_from_arn(&doc.destination_bucket)
        };

        let mut files = Vec::with_capacity(doc.files.len());
        let mut entries = Vec::new();
        for file in &doc.files {
            let file_loc = ObjectLocation::new(data_bucket.clone(), file.key.clone());
            let body = self.storage.get_object(&file_loc).await?;
            verify_md5(&file_loc, &body, file.md5_checksum.as_deref())?;
            let data = decode_body(&file_loc, body)?;
            for record in csv_records(&file_loc, &data)? {
                let entry = columns.entry(&record).ok_or_else(|| {
                    ControllerError::manifest_format(
                        &file_loc,
                        format!("line {}: expected {} columns", line_of(&record), schema.len()),
                    )
                })?;
                entries.push(entry);
            }
            files.push(ManifestFile {
                location: file_loc,
                size: file.size,
                md5: file.md5_checksum.clone(),
            });
        }

        debug!(
            manifest = %location,
            files = files.len(),
            entries = entries.len(),
            "loaded inventory manifest"
        );

        Ok(InventoryManifest {
            identity: ManifestIdentity::new(location.clone(), generated_at),
            source_bucket,
            destination_bucket: data_bucket,
            inventory_id,
            file_schema: schema,
            files,
            entries,
        })
    }

    /// Load a batch completion report and its result files.
    ///
    /// # Errors
    ///
    /// `ManifestFormat` when the report cannot be parsed or its key does not
    /// name a job.
    pub async fn read_batch_report(&self, location: &ObjectLocation) -> ControllerResult<BatchReport> {
        let raw = self.storage.get_object(location).await?;
        let doc: ReportManifestDoc = serde_json::from_slice(&raw)
            .map_err(|e| ControllerError::manifest_format(location, e.to_string()))?;
        if doc.format != REPORT_FORMAT {
            return Err(ControllerError::manifest_format(
                location,
                format!("unsupported report format `{}`", doc.format),
            ));
        }
        let job_id = job_id_from_key(&location.key).ok_or_else(|| {
            ControllerError::manifest_format(location, "key does not contain job-<id>/manifest.json")
        })?;

        let mut result_files = Vec::with_capacity(doc.results.len());
        let mut entries = Vec::new();
        for result in &doc.results {
            let status = result
                .task_execution_status
                .parse::<TaskStatus>()
                .map_err(|e| ControllerError::manifest_format(location, e))?;
            let file_loc = ObjectLocation::new(bucket_from_arn(&result.bucket), result.key.clone());
            let body = self.storage.get_object(&file_loc).await?;
            verify_md5(&file_loc, &body, result.md5_checksum.as_deref())?;
            let size = body.len() as u64;
            let data = decode_body(&file_loc, body)?;
            for record in csv_records(&file_loc, &data)? {
                let entry = parse_report_record(&record).ok_or_else(|| {
                    ControllerError::manifest_format(
                        &file_loc,
                        format!("line {} is malformed", line_of(&record)),
                    )
                })?;
                entries.push(entry);
            }
            result_files.push((
                ManifestFile {
                    location: file_loc,
                    size,
                    md5: result.md5_checksum.clone(),
                },
                status,
            ));
        }

        Ok(BatchReport {
            identity: ManifestIdentity::new(location.clone(), doc.report_creation_date),
            job_id,
            format: doc.format,
            result_files,
            entries,
        })
    }
}

/// Column positions of the inventory fields the launcher uses.
struct InventoryColumns {
    bucket: usize,
    key: usize,
    version_id: Option<usize>,
    encryption: Option<usize>,
    width: usize,
}

impl InventoryColumns {
    fn resolve(schema: &[String]) -> Option<Self> {
        let position = |name: &str| schema.iter().position(|c| c.eq_ignore_ascii_case(name));
        Some(Self {
            bucket: position("Bucket")?,
            key: position("Key")?,
            version_id: position("VersionId"),
            encryption: position("EncryptionStatus"),
            width: schema.len(),
        })
    }

    fn entry(&self, record: &StringRecord) -> Option<InventoryEntry> {
        if record.len() < self.width {
            return None;
        }
        let optional = |idx: Option<usize>| {
            idx.and_then(|i| record.get(i))
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Some(InventoryEntry {
            bucket: BucketId::new(record.get(self.bucket)?),
            key: url_decode(record.get(self.key)?),
            version_id: optional(self.version_id),
            encryption: optional(self.encryption).and_then(|v| v.parse::<EncryptionStatus>().ok()),
        })
    }
}

fn parse_report_record(record: &StringRecord) -> Option<ReportEntry> {
    if record.len() < 4 {
        return None;
    }
    let field = |i: usize| record.get(i).filter(|v| !v.is_empty()).map(str::to_string);
    Some(ReportEntry {
        bucket: BucketId::new(record.get(0)?),
        key: url_decode(record.get(1)?),
        version_id: field(2),
        status: record.get(3)?.parse().ok()?,
        error_code: field(4),
        http_status: field(5).and_then(|v| v.parse().ok()),
        message: field(6),
    })
}

fn split_schema(schema: &str) -> Vec<String> {
    schema
        .split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

fn verify_md5(location: &ObjectLocation, body: &Bytes, expected: Option<&str>) -> ControllerResult<()> {
    if let Some(expected) = expected.filter(|e| !e.is_empty()) {
        let actual = format!("{:x}", md5::compute(body));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(ControllerError::manifest_format(
                location,
                format!("checksum mismatch: expected {}, got {}", expected, actual),
            ));
        }
    }
    Ok(())
}

fn decode_body(location: &ObjectLocation, body: Bytes) -> ControllerResult<Vec<u8>> {
    if location.key.ends_with(".gz") {
        let mut data = Vec::new();
        GzDecoder::new(body.as_ref())
            .read_to_end(&mut data)
            .map_err(|e| ControllerError::manifest_format(location, format!("gzip: {}", e)))?;
        Ok(data)
    } else {
        Ok(body.to_vec())
    }
}

/// Every record of a headerless CSV body. Blank lines are skipped and rows
/// may differ in width; callers check the columns they need.
fn csv_records(location: &ObjectLocation, data: &[u8]) -> ControllerResult<Vec<StringRecord>> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(data)
        .records()
        .map(|record| record.map_err(|e| ControllerError::manifest_format(location, e.to_string())))
        .collect()
}

fn line_of(record: &StringRecord) -> u64 {
    record.position().map_or(0, |p| p.line())
}

/// Serialize rows as headerless CSV; fields are quoted only when needed.
pub fn write_csv<R, F>(rows: impl IntoIterator<Item = R>) -> ControllerResult<Vec<u8>>
where
    R: IntoIterator<Item = F>,
    F: AsRef<[u8]>,
{
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_writer(Vec::new());
    for row in rows {
        writer.write_record(row).map_err(io::Error::from)?;
    }
    writer.into_inner().map_err(|e| ControllerError::Io(e.into_error()))
}

/// `<prefix>/<source bucket>/<inventory id>/<date>/manifest.json`
pub fn inventory_id_from_key(key: &str, source_bucket: &BucketId) -> Option<String> {
    let parts: Vec<&str> = key.split('/').collect();
    if parts.len() < 4 || parts[parts.len() - 1] != "manifest.json" {
        return None;
    }
    let bucket = parts[parts.len() - 4];
    let id = parts[parts.len() - 3];
    (bucket == source_bucket.as_str() && !id.is_empty()).then(|| id.to_string())
}

/// `<prefix>/job-<id>/manifest.json`
pub fn job_id_from_key(key: &str) -> Option<JobId> {
    let mut parts = key.rsplit('/');
    if parts.next()? != "manifest.json" {
        return None;
    }
    parts
        .next()?
        .strip_prefix("job-")
        .filter(|id| !id.is_empty())
        .map(JobId::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(key: &str) -> ObjectLocation {
        ObjectLocation::new(BucketId::new("inv-reports"), key)
    }

    #[test]
    fn reads_quoted_csv_and_skips_blank_lines() {
        let data = b"\"data-1\",\"a,b.txt\",\"\",\"SSE-S3\"\n\nx,\"say \"\"hi\"\"\",z\nplain\n";
        let records = csv_records(&location("data/x.csv"), data).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(&records[0], vec!["data-1", "a,b.txt", "", "SSE-S3"]);
        assert_eq!(&records[1], vec!["x", r#"say "hi""#, "z"]);
        assert_eq!(&records[2], vec!["plain"]);
    }

    #[test]
    fn written_rows_read_back_unchanged() {
        let rows = vec![
            vec!["data-1", "a,b.txt", "v1"],
            vec!["data-1", r#"quote"d"#],
        ];
        let data = write_csv(rows.clone()).unwrap();
        assert!(data.starts_with(b"data-1,\"a,b.txt\",v1\n"));
        let records = csv_records(&location("data/x.csv"), &data).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(&records[0], rows[0]);
        assert_eq!(&records[1], rows[1]);
    }

    #[test]
    fn short_inventory_rows_are_rejected_with_their_line() {
        let schema = split_schema("Bucket, Key, VersionId, EncryptionStatus");
        let columns = InventoryColumns::resolve(&schema).unwrap();
        let records = csv_records(&location("data/x.csv"), b"data-1,a.txt,,SSE-S3\ndata-1,b.txt\n").unwrap();
        let first = columns.entry(&records[0]).unwrap();
        assert_eq!(first.key, "a.txt");
        assert_eq!(first.version_id, None);
        assert_eq!(first.encryption, Some(EncryptionStatus::SseS3));
        assert!(columns.entry(&records[1]).is_none());
        assert_eq!(line_of(&records[1]), 2);
    }

    #[test]
    fn extracts_inventory_id_and_job_id_from_keys() {
        let bucket = BucketId::new("data-1");
        assert_eq!(
            inventory_id_from_key(
                "data-1/ObjectEncryptionInventoryReport/2024-03-01T00-00Z/manifest.json",
                &bucket
            ),
            Some("ObjectEncryptionInventoryReport".to_string())
        );
        assert_eq!(
            inventory_id_from_key("other/Report/2024-03-01T00-00Z/manifest.json", &bucket),
            None
        );
        assert_eq!(
            job_id_from_key("reports/job-42ab/manifest.json"),
            Some(JobId::new("42ab"))
        );
        assert_eq!(job_id_from_key("reports/job-/manifest.json"), None);
        assert_eq!(job_id_from_key("reports/job-1/results/x.csv"), None);
    }

    #[test]
    fn report_lines_parse_status_and_errors() {
        let records = csv_records(
            &location("reports/job-1/results/r.csv"),
            b"data-1,a.txt,,failed,NoSuchKey,404,object disappeared\ndata-1,a.txt\n",
        )
        .unwrap();
        let entry = parse_report_record(&records[0]).unwrap();
        assert_eq!(entry.status, TaskStatus::Failed);
        assert_eq!(entry.http_status, Some(404));
        assert_eq!(entry.error_code.as_deref(), Some("NoSuchKey"));
        assert_eq!(entry.message.as_deref(), Some("object disappeared"));
        assert!(parse_report_record(&records[1]).is_none());
    }
}
