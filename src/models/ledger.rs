//! Durable per-manifest state kept by the de-duplication ledger.

use super::{bucket::BucketId, job::JobId, manifest::ManifestKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Where a manifest is in the inventory → job → report chain.
///
/// ```text
/// claimed ──► submitted ──► reconciled
///    │  ▲
///    │  └── (takeover after failure or expired claim)
///    ├──► skipped
///    └──► failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestState {
    /// An invocation owns the manifest and is working on it.
    Claimed,
    /// A job was submitted for an inventory manifest.
    Submitted,
    /// Nothing to launch (empty or already encrypted).
    Skipped,
    /// Processing failed; a redelivery may claim it again.
    Failed,
    /// The job's completion report has been processed.
    Reconciled,
}

impl ManifestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::Submitted => "submitted",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Reconciled => "reconciled",
        }
    }
}

impl FromStr for ManifestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claimed" => Ok(Self::Claimed),
            "submitted" => Ok(Self::Submitted),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            "reconciled" => Ok(Self::Reconciled),
            other => Err(format!("unknown ledger state `{}`", other)),
        }
    }
}

impl fmt::Display for ManifestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final verdict recorded when a job's report is reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Succeeded,
    Failed,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub manifest_key: String,
    pub kind: ManifestKind,
    pub source_bucket: BucketId,
    pub inventory_id: Option<String>,
    pub job_id: Option<JobId>,
    pub state: ManifestState,
    pub outcome: Option<JobOutcome>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}
