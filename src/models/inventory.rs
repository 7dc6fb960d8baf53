//! Inventory configurations installed on target buckets.

use super::bucket::BucketId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Optional inventory fields the launcher relies on.
///
/// `EncryptionStatus` lets the launcher skip objects that are already in the
/// target state.
pub const DEFAULT_OPTIONAL_FIELDS: [&str; 3] = ["Size", "LastModifiedDate", "EncryptionStatus"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryFrequency {
    Daily,
    Weekly,
}

impl InventoryFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "Daily",
            Self::Weekly => "Weekly",
        }
    }
}

impl FromStr for InventoryFrequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            other => Err(format!("unknown inventory frequency `{}`", other)),
        }
    }
}

impl fmt::Display for InventoryFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inventory configuration on a bucket, identified by `(bucket, report_name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryConfiguration {
    pub bucket: BucketId,

    /// Configuration id; also the path segment under which manifests land.
    pub report_name: String,

    /// Bucket that receives the generated manifests.
    pub destination_bucket: BucketId,

    pub frequency: InventoryFrequency,

    pub optional_fields: Vec<String>,

    pub created_at: DateTime<Utc>,
}

impl InventoryConfiguration {
    pub fn new(
        bucket: BucketId,
        report_name: impl Into<String>,
        destination_bucket: BucketId,
        frequency: InventoryFrequency,
    ) -> Self {
        Self {
            bucket,
            report_name: report_name.into(),
            destination_bucket,
            frequency,
            optional_fields: DEFAULT_OPTIONAL_FIELDS
                .iter()
                .map(|f| f.to_string())
                .collect(),
            created_at: Utc::now(),
        }
    }
}
