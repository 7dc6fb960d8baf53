//! Buckets as the controller sees them: identity, tags and encryption state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Name of a bucket. Bucket names are globally unique, so the name alone
/// identifies a bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketId(String);

impl BucketId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BucketId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for BucketId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A single key/value tag on a bucket or object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Server-side encryption applied to objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EncryptionScheme {
    /// SSE with a key managed by the storage provider (`AES256`).
    #[serde(rename = "SSE-S3")]
    SseS3,
    /// SSE with a customer-selected KMS key.
    #[serde(rename = "SSE-KMS")]
    SseKms { key_id: String },
}

impl EncryptionScheme {
    pub fn status(&self) -> EncryptionStatus {
        match self {
            Self::SseS3 => EncryptionStatus::SseS3,
            Self::SseKms { .. } => EncryptionStatus::SseKms,
        }
    }

    pub fn key_id(&self) -> Option<&str> {
        match self {
            Self::SseS3 => None,
            Self::SseKms { key_id } => Some(key_id),
        }
    }
}

/// Encryption state of an object as reported by an inventory listing.
///
/// Inventory reports only carry the scheme, never the key id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionStatus {
    #[serde(rename = "NOT-SSE")]
    NotSse,
    #[serde(rename = "SSE-S3")]
    SseS3,
    #[serde(rename = "SSE-KMS")]
    SseKms,
    #[serde(rename = "SSE-C")]
    SseC,
}

impl EncryptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotSse => "NOT-SSE",
            Self::SseS3 => "SSE-S3",
            Self::SseKms => "SSE-KMS",
            Self::SseC => "SSE-C",
        }
    }

    /// Whether an object in this state can be left alone for `target`.
    ///
    /// SSE-KMS objects only count as satisfied when the target is the
    /// account's default key, since the listing cannot tell keys apart.
    pub fn satisfies(&self, target: &EncryptionScheme, default_kms_key: bool) -> bool {
        match (self, target) {
            (Self::SseS3, EncryptionScheme::SseS3) => true,
            (Self::SseKms, EncryptionScheme::SseKms { .. }) => default_kms_key,
            _ => false,
        }
    }
}

impl FromStr for EncryptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "NOT-SSE" | "" => Ok(Self::NotSse),
            "SSE-S3" | "AES256" => Ok(Self::SseS3),
            "SSE-KMS" | "aws:kms" => Ok(Self::SseKms),
            "SSE-C" => Ok(Self::SseC),
            other => Err(format!("unknown encryption status `{}`", other)),
        }
    }
}

impl fmt::Display for EncryptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A storage bucket in the fleet.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Bucket {
    pub name: BucketId,

    /// Region where the bucket is hosted (e.g. "eu-central-1").
    pub region: String,

    pub tags: Vec<Tag>,

    /// Bucket-level default encryption, if any.
    pub default_encryption: Option<EncryptionStatus>,

    pub created_at: DateTime<Utc>,
}

impl Bucket {
    /// Exact key + value match against the bucket's tag set.
    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.tags.iter().any(|t| t.key == key && t.value == value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kms_objects_only_satisfy_default_key_targets() {
        let target = EncryptionScheme::SseKms {
            key_id: "1232d31d".into(),
        };
        assert!(EncryptionStatus::SseKms.satisfies(&target, true));
        assert!(!EncryptionStatus::SseKms.satisfies(&target, false));
        assert!(!EncryptionStatus::SseS3.satisfies(&target, true));
        assert!(!EncryptionStatus::NotSse.satisfies(&EncryptionScheme::SseS3, true));
        assert!(EncryptionStatus::SseS3.satisfies(&EncryptionScheme::SseS3, false));
    }

    #[test]
    fn parses_inventory_and_header_spellings() {
        assert_eq!("AES256".parse(), Ok(EncryptionStatus::SseS3));
        assert_eq!("aws:kms".parse(), Ok(EncryptionStatus::SseKms));
        assert_eq!("NOT-SSE".parse(), Ok(EncryptionStatus::NotSse));
        assert!("rot13".parse::<EncryptionStatus>().is_err());
    }
}
