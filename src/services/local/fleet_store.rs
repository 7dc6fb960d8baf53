//! src/services/local/fleet_store.rs
//!
//! FleetStore: the local stand-in for the storage service. Bucket, tag,
//! inventory-configuration and object metadata live in SQLite; object
//! payloads live on disk sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}`.

use crate::{
    errors::{ControllerError, ControllerResult},
    models::{
        bucket::{Bucket, BucketId, EncryptionScheme, EncryptionStatus, Tag},
        inventory::{InventoryConfiguration, InventoryFrequency},
        manifest::ObjectLocation,
        object::{ObjectRecord, ObjectRow},
    },
    services::gateways::StorageGateway,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut, stream};
use md5::Context;
use sqlx::{FromRow, SqlitePool};
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("region `{0}` is not supported")]
    UnsupportedRegion(String),
    #[error("bucket `{bucket}` is in {region}, outside the deployment region {deployment}")]
    CrossRegion {
        bucket: String,
        region: String,
        deployment: String,
    },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type FleetResult<T> = Result<T, FleetError>;

impl From<FleetError> for ControllerError {
    fn from(err: FleetError) -> Self {
        match err {
            FleetError::BucketNotFound(name) => ControllerError::NotFound(format!("bucket `{}`", name)),
            FleetError::ObjectNotFound { bucket, key } => {
                ControllerError::NotFound(format!("object `{}` in bucket `{}`", key, bucket))
            }
            FleetError::CrossRegion { ref bucket, .. } => ControllerError::Permission {
                bucket: bucket.clone(),
                message: err.to_string(),
            },
            FleetError::BucketAlreadyExists(_)
            | FleetError::InvalidBucketName { .. }
            | FleetError::UnsupportedRegion(_)
            | FleetError::InvalidObjectKey => ControllerError::InvalidInput(err.to_string()),
            FleetError::Sqlx(e) => ControllerError::Sqlx(e),
            FleetError::Io(e) => ControllerError::Io(e),
        }
    }
}

/// FleetStore provides the bucket and object operations the controller and
/// the local runners need:
/// - buckets with tags, region and default encryption
/// - inventory configuration CRUD, restricted to the deployment region
/// - streamed object upload/download with MD5 ETags
/// - copy-in-place re-encryption with additive tag merge
///
/// Encryption is tracked as object metadata; payload bytes stay as stored.
#[derive(Clone)]
pub struct FleetStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    /// Region inventory configurations can be managed in.
    pub region: String,
}

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const SUPPORTED_REGIONS: [&str; 17] = [
    "local",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "eu-central-1",
    "ap-southeast-1",
    "ap-northeast-1",
    "ap-south-1",
    "ap-south-2",
    "ap-southeast-2",
    "ap-southeast-3",
    "ap-southeast-4",
    "ap-northeast-2",
    "ap-northeast-3",
    "me-south-1",
];

#[derive(FromRow)]
struct BucketRow {
    name: String,
    region: String,
    default_encryption: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct InventoryConfigRow {
    bucket: String,
    report_name: String,
    destination_bucket: String,
    frequency: String,
    optional_fields: String,
    created_at: DateTime<Utc>,
}

impl From<InventoryConfigRow> for InventoryConfiguration {
    fn from(row: InventoryConfigRow) -> Self {
        Self {
            bucket: BucketId::new(row.bucket),
            report_name: row.report_name,
            destination_bucket: BucketId::new(row.destination_bucket),
            frequency: row
                .frequency
                .parse()
                .unwrap_or(InventoryFrequency::Daily),
            optional_fields: row
                .optional_fields
                .split(',')
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect(),
            created_at: row.created_at,
        }
    }
}

const OBJECT_COLUMNS: &str =
    "SELECT bucket, key, version_id, size_bytes, etag, encryption, kms_key_id, last_modified FROM objects";

const CONFIG_COLUMNS: &str = "SELECT bucket, report_name, destination_bucket, frequency, \
     optional_fields, created_at FROM inventory_configurations";

impl FleetStore {
    /// Create a FleetStore backed by the provided SQLite pool, using
    /// `base_path` as the root directory for object payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>, region: impl Into<String>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            region: region.into().to_lowercase(),
        }
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Rejects keys that begin with `/` or contain `..`.
    fn ensure_key_safe(&self, key: &str) -> FleetResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(FleetError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(FleetError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(FleetError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// Enforces S3-like naming rules:
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    fn ensure_bucket_name_safe(&self, name: &str) -> FleetResult<()> {
        let invalid = |reason: &str| FleetError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if name.trim() != name {
            return Err(invalid("cannot begin or end with whitespace"));
        }
        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }
        if name.starts_with('.')
            || name.ends_with('.')
            || name.starts_with('-')
            || name.ends_with('-')
        {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }
        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }
        if is_ipv4_like(name) {
            return Err(invalid("must not be formatted like an IP address"));
        }
        Ok(())
    }

    /// Case-insensitive check against SUPPORTED_REGIONS.
    fn ensure_region_valid(&self, region: &str) -> FleetResult<()> {
        if SUPPORTED_REGIONS
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(region))
        {
            Ok(())
        } else {
            Err(FleetError::UnsupportedRegion(region.to_string()))
        }
    }

    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        path.push(bucket_name);
        path
    }

    /// Two-level shard directories from MD5(bucket/key), 00–ff each.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// `base_path/bucket/{shard}/{shard}/{key}`; parents may not exist yet.
    fn object_path(&self, bucket_name: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket_name, key);
        let mut path = self.bucket_root(bucket_name);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn bucket_tags(&self, bucket: &str) -> FleetResult<Vec<Tag>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT tag_key, tag_value FROM bucket_tags WHERE bucket = ? ORDER BY tag_key",
        )
        .bind(bucket)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows.into_iter().map(|(k, v)| Tag::new(k, v)).collect())
    }

    async fn object_tags(&self, bucket: &str, key: &str) -> FleetResult<Vec<Tag>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT tag_key, tag_value FROM object_tags WHERE bucket = ? AND key = ? ORDER BY tag_key",
        )
        .bind(bucket)
        .bind(key)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows.into_iter().map(|(k, v)| Tag::new(k, v)).collect())
    }

    fn bucket_from_row(row: BucketRow, tags: Vec<Tag>) -> Bucket {
        Bucket {
            name: BucketId::new(row.name),
            region: row.region,
            tags,
            default_encryption: row.default_encryption.and_then(|e| e.parse().ok()),
            created_at: row.created_at,
        }
    }

    /// Fetch bucket metadata and tags. Returns BucketNotFound if missing.
    pub async fn fetch_bucket(&self, bucket: &str) -> FleetResult<Bucket> {
        self.ensure_bucket_name_safe(bucket)?;
        let row = sqlx::query_as::<_, BucketRow>(
            "SELECT name, region, default_encryption, created_at FROM buckets WHERE name = ?",
        )
        .bind(bucket)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => FleetError::BucketNotFound(bucket.to_string()),
            other => FleetError::Sqlx(other),
        })?;
        let tags = self.bucket_tags(bucket).await?;
        Ok(Self::bucket_from_row(row, tags))
    }

    async fn fetch_object(&self, bucket: &str, key: &str) -> FleetResult<ObjectRecord> {
        let row = sqlx::query_as::<_, ObjectRow>(&format!("{} WHERE bucket = ? AND key = ?", OBJECT_COLUMNS))
            .bind(bucket)
            .bind(key)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => FleetError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                },
                other => FleetError::Sqlx(other),
            })?;
        let tags = self.object_tags(bucket, key).await?;
        Ok(row.into_record(tags))
    }

    /// Buckets outside the deployment region cannot carry an inventory
    /// configuration managed from here.
    fn ensure_same_region(&self, bucket: &Bucket) -> FleetResult<()> {
        if bucket.region.eq_ignore_ascii_case(&self.region) {
            Ok(())
        } else {
            Err(FleetError::CrossRegion {
                bucket: bucket.name.to_string(),
                region: bucket.region.clone(),
                deployment: self.region.clone(),
            })
        }
    }

    /// Create a bucket with its tag set and initialize its directory.
    ///
    /// Returns BucketAlreadyExists if the name is taken.
    pub async fn create_bucket(
        &self,
        name: &str,
        region: &str,
        tags: &[Tag],
        default_encryption: Option<EncryptionStatus>,
    ) -> FleetResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        let normalized_region = region.to_lowercase();
        self.ensure_region_valid(&normalized_region)?;
        fs::create_dir_all(self.bucket_root(name)).await?;

        let created_at = Utc::now();
        let mut tx = self.db.begin().await?;
        match sqlx::query(
            "INSERT INTO buckets (name, region, default_encryption, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(&normalized_region)
        .bind(default_encryption.map(|e| e.as_str()))
        .bind(created_at)
        .execute(&mut *tx)
        .await
        {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(FleetError::BucketAlreadyExists(name.to_string()));
            }
            Err(err) => return Err(FleetError::Sqlx(err)),
        }
        for tag in tags {
            sqlx::query("INSERT INTO bucket_tags (bucket, tag_key, tag_value) VALUES (?, ?, ?)")
                .bind(name)
                .bind(&tag.key)
                .bind(&tag.value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!(bucket = name, region = %normalized_region, tags = tags.len(), "created bucket");
        Ok(Bucket {
            name: BucketId::new(name),
            region: normalized_region,
            tags: tags.to_vec(),
            default_encryption,
            created_at,
        })
    }

    /// Replace a bucket's tag set.
    pub async fn put_bucket_tags(&self, name: &str, tags: &[Tag]) -> FleetResult<()> {
        self.fetch_bucket(name).await?;
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM bucket_tags WHERE bucket = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        for tag in tags {
            sqlx::query("INSERT INTO bucket_tags (bucket, tag_key, tag_value) VALUES (?, ?, ?)")
                .bind(name)
                .bind(&tag.key)
                .bind(&tag.value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Stream-upload an object to disk and update metadata.
    ///
    /// - Writes bytes incrementally to a temporary file.
    /// - Computes MD5/etag and size while streaming.
    /// - Atomically renames into final location.
    /// - Upserts metadata row with the bucket's default encryption and
    ///   clears the object's tags (S3-like overwrite semantics).
    pub async fn upload_object_stream<S>(&self, bucket: &str, key: &str, stream: S) -> FleetResult<ObjectRecord>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let file_path = self.object_path(bucket, key);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| FleetError::Io(io::Error::other("object path missing parent directory")))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(FleetError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(FleetError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(FleetError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(FleetError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(FleetError::Io(err));
            }
        }

        let encryption = bucket_rec.default_encryption.unwrap_or(EncryptionStatus::NotSse);
        let record = ObjectRecord {
            bucket: bucket_rec.name.clone(),
            key: key.to_string(),
            version_id: Some(Uuid::new_v4().simple().to_string()),
            size_bytes,
            etag: format!("{:x}", digest.compute()),
            encryption,
            kms_key_id: None,
            last_modified: Utc::now(),
            tags: Vec::new(),
        };

        let mut tx = self.db.begin().await?;
        let upsert = sqlx::query(
            r#"
            INSERT INTO objects (
                bucket, key, version_id, size_bytes, etag, encryption, kms_key_id, last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, NULL, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET
                version_id = excluded.version_id,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                encryption = excluded.encryption,
                kms_key_id = NULL,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(bucket)
        .bind(key)
        .bind(&record.version_id)
        .bind(record.size_bytes)
        .bind(&record.etag)
        .bind(record.encryption.as_str())
        .bind(record.last_modified)
        .execute(&mut *tx)
        .await;
        if let Err(err) = upsert {
            let _ = fs::remove_file(&file_path).await;
            return Err(FleetError::Sqlx(err));
        }
        sqlx::query("DELETE FROM object_tags WHERE bucket = ? AND key = ?")
            .bind(bucket)
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(record)
    }

    /// Returns metadata and an opened File handle ready for streaming out.
    /// ObjectNotFound if the metadata exists but the payload is missing.
    pub async fn get_object_reader(&self, bucket: &str, key: &str) -> FleetResult<(ObjectRecord, File)> {
        self.ensure_key_safe(key)?;
        self.fetch_bucket(bucket).await?;
        let object = self.fetch_object(bucket, key).await?;

        let file_path = self.object_path(bucket, key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                FleetError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                FleetError::Io(err)
            }
        })?;

        Ok((object, file))
    }

    /// Object metadata with its tag set.
    pub async fn object_state(&self, bucket: &str, key: &str) -> FleetResult<ObjectRecord> {
        self.ensure_key_safe(key)?;
        self.fetch_object(bucket, key).await
    }

    /// Every object in a bucket in key order, with tags.
    pub async fn list_objects(&self, bucket: &str) -> FleetResult<Vec<ObjectRecord>> {
        self.fetch_bucket(bucket).await?;
        let rows = sqlx::query_as::<_, ObjectRow>(&format!("{} WHERE bucket = ? ORDER BY key ASC", OBJECT_COLUMNS))
            .bind(bucket)
            .fetch_all(&*self.db)
            .await?;
        let tag_rows = sqlx::query_as::<_, (String, String, String)>(
            "SELECT key, tag_key, tag_value FROM object_tags WHERE bucket = ? ORDER BY tag_key",
        )
        .bind(bucket)
        .fetch_all(&*self.db)
        .await?;
        let mut tags: HashMap<String, Vec<Tag>> = HashMap::new();
        for (key, k, v) in tag_rows {
            tags.entry(key).or_default().push(Tag::new(k, v));
        }
        Ok(rows
            .into_iter()
            .map(|row| {
                let object_tags = tags.remove(&row.key).unwrap_or_default();
                row.into_record(object_tags)
            })
            .collect())
    }

    /// Rewrite an object onto itself with `encryption`, merging `tags` into
    /// its existing tag set in the same step.
    pub async fn copy_in_place(
        &self,
        bucket: &str,
        key: &str,
        encryption: &EncryptionScheme,
        tags: &[Tag],
    ) -> FleetResult<ObjectRecord> {
        self.ensure_key_safe(key)?;
        if fs::metadata(self.object_path(bucket, key)).await.is_err() {
            return Err(FleetError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        let mut tx = self.db.begin().await?;
        let updated = sqlx::query(
            "UPDATE objects SET encryption = ?, kms_key_id = ?, version_id = ?, last_modified = ?
             WHERE bucket = ? AND key = ?",
        )
        .bind(encryption.status().as_str())
        .bind(encryption.key_id())
        .bind(Uuid::new_v4().simple().to_string())
        .bind(Utc::now())
        .bind(bucket)
        .bind(key)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(FleetError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        for tag in tags {
            sqlx::query(
                "INSERT INTO object_tags (bucket, key, tag_key, tag_value) VALUES (?, ?, ?, ?)
                 ON CONFLICT(bucket, key, tag_key) DO UPDATE SET tag_value = excluded.tag_value",
            )
            .bind(bucket)
            .bind(key)
            .bind(&tag.key)
            .bind(&tag.value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.fetch_object(bucket, key).await
    }

    /// Inventory configurations across the whole fleet.
    pub async fn all_inventory_configurations(&self) -> FleetResult<Vec<InventoryConfiguration>> {
        let rows = sqlx::query_as::<_, InventoryConfigRow>(&format!(
            "{} ORDER BY bucket, report_name",
            CONFIG_COLUMNS
        ))
        .fetch_all(&*self.db)
        .await?;
        Ok(rows.into_iter().map(InventoryConfiguration::from).collect())
    }
}

#[async_trait]
impl StorageGateway for FleetStore {
    async fn list_buckets(&self) -> ControllerResult<Vec<Bucket>> {
        let rows = sqlx::query_as::<_, BucketRow>(
            "SELECT name, region, default_encryption, created_at FROM buckets ORDER BY name",
        )
        .fetch_all(&*self.db)
        .await?;
        let tag_rows = sqlx::query_as::<_, (String, String, String)>(
            "SELECT bucket, tag_key, tag_value FROM bucket_tags ORDER BY tag_key",
        )
        .fetch_all(&*self.db)
        .await?;
        let mut tags: HashMap<String, Vec<Tag>> = HashMap::new();
        for (bucket, k, v) in tag_rows {
            tags.entry(bucket).or_default().push(Tag::new(k, v));
        }
        Ok(rows
            .into_iter()
            .map(|row| {
                let bucket_tags = tags.remove(&row.name).unwrap_or_default();
                Self::bucket_from_row(row, bucket_tags)
            })
            .collect())
    }

    async fn get_inventory_configuration(
        &self,
        bucket: &BucketId,
        report_name: &str,
    ) -> ControllerResult<Option<InventoryConfiguration>> {
        let bucket_rec = self.fetch_bucket(bucket.as_str()).await?;
        self.ensure_same_region(&bucket_rec)?;
        let row = sqlx::query_as::<_, InventoryConfigRow>(&format!(
            "{} WHERE bucket = ? AND report_name = ?",
            CONFIG_COLUMNS
        ))
        .bind(bucket.as_str())
        .bind(report_name)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row.map(InventoryConfiguration::from))
    }

    async fn list_inventory_configurations(
        &self,
        bucket: &BucketId,
    ) -> ControllerResult<Vec<InventoryConfiguration>> {
        let rows = sqlx::query_as::<_, InventoryConfigRow>(&format!(
            "{} WHERE bucket = ? ORDER BY report_name",
            CONFIG_COLUMNS
        ))
        .bind(bucket.as_str())
        .fetch_all(&*self.db)
        .await?;
        Ok(rows.into_iter().map(InventoryConfiguration::from).collect())
    }

    async fn put_inventory_configuration(&self, config: &InventoryConfiguration) -> ControllerResult<()> {
        let bucket_rec = self.fetch_bucket(config.bucket.as_str()).await?;
        self.ensure_same_region(&bucket_rec)?;
        sqlx::query(
            "INSERT INTO inventory_configurations (
                bucket, report_name, destination_bucket, frequency, optional_fields, created_at
             ) VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(bucket, report_name) DO UPDATE SET
                destination_bucket = excluded.destination_bucket,
                frequency = excluded.frequency,
                optional_fields = excluded.optional_fields",
        )
        .bind(config.bucket.as_str())
        .bind(&config.report_name)
        .bind(config.destination_bucket.as_str())
        .bind(config.frequency.as_str())
        .bind(config.optional_fields.join(","))
        .bind(config.created_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn delete_inventory_configuration(&self, bucket: &BucketId, report_name: &str) -> ControllerResult<bool> {
        let result = sqlx::query("DELETE FROM inventory_configurations WHERE bucket = ? AND report_name = ?")
            .bind(bucket.as_str())
            .bind(report_name)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_object(&self, location: &ObjectLocation) -> ControllerResult<Bytes> {
        let (object, mut file) = self
            .get_object_reader(location.bucket.as_str(), &location.key)
            .await?;
        let mut buf = Vec::with_capacity(object.size_bytes.max(0) as usize);
        file.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn put_object(&self, location: &ObjectLocation, data: Bytes) -> ControllerResult<String> {
        let body = stream::once(async move { Ok::<_, io::Error>(data) });
        let record = self
            .upload_object_stream(location.bucket.as_str(), &location.key, body)
            .await?;
        Ok(record.etag)
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Check if a string matches IPv4-like dotted decimal form.
/// Rejects names formatted like `1.2.3.4`.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|segment| {
        !segment.is_empty()
            && segment.len() <= 3
            && segment.chars().all(|c| c.is_ascii_digit())
            && segment.parse::<u8>().is_ok()
    })
}
