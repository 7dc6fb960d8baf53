//! Represents an object (file) stored in a fleet bucket.

use super::bucket::{BucketId, EncryptionStatus, Tag};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Metadata of a single stored object; the payload lives on disk.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ObjectRecord {
    pub bucket: BucketId,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Version identifier, changed by every rewrite.
    pub version_id: Option<String>,

    pub size_bytes: i64,

    /// MD5 of the payload.
    pub etag: String,

    /// Server-side encryption currently applied.
    pub encryption: EncryptionStatus,

    pub kms_key_id: Option<String>,

    pub last_modified: DateTime<Utc>,

    pub tags: Vec<Tag>,
}

/// Row shape of the `objects` table.
#[derive(FromRow)]
pub(crate) struct ObjectRow {
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
    pub size_bytes: i64,
    pub etag: String,
    pub encryption: String,
    pub kms_key_id: Option<String>,
    pub last_modified: DateTime<Utc>,
}

impl ObjectRow {
    pub(crate) fn into_record(self, tags: Vec<Tag>) -> ObjectRecord {
        ObjectRecord {
            bucket: BucketId::new(self.bucket),
            key: self.key,
            version_id: self.version_id,
            size_bytes: self.size_bytes,
            etag: self.etag,
            encryption: self.encryption.parse().unwrap_or(EncryptionStatus::NotSse),
            kms_key_id: self.kms_key_id,
            last_modified: self.last_modified,
            tags,
        }
    }
}
