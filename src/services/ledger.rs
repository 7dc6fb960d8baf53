//! De-duplication ledger.
//!
//! One row per manifest identity, holding where that manifest is in the
//! inventory → job → report chain. Every transition is a single conditional
//! statement, so concurrent invocations racing on the same manifest resolve
//! inside SQLite rather than in memory:
//!
//! - `claim` inserts with `ON CONFLICT DO NOTHING`; a loser only wins later
//!   by taking over a `failed` row or a `claimed` row whose owner exceeded
//!   its invocation budget.
//! - Every follow-up update is fenced on the claim token, so an invocation
//!   whose claim was taken over cannot overwrite the new owner's progress.
//!
//! The same store keeps the per-bucket "enforced" marks that keep the
//! scheduler from re-inventorying buckets whose chain completed.

use crate::{
    errors::{ControllerError, ControllerResult},
    models::{
        bucket::BucketId,
        job::JobId,
        ledger::{JobOutcome, LedgerEntry, ManifestState},
        manifest::{ManifestIdentity, ManifestKind},
    },
};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::{sync::Arc, time::Duration};
use tracing::debug;
use uuid::Uuid;

/// Proof of ownership returned by a successful claim.
#[derive(Debug, Clone)]
pub struct ClaimTicket {
    pub manifest_key: String,
    pub token: String,
    pub attempt: i64,
}

#[derive(Debug)]
pub enum Claim {
    Acquired(ClaimTicket),
    /// Another invocation owns or already finished this manifest.
    Held(LedgerEntry),
}

#[derive(FromRow)]
struct LedgerRow {
    manifest_key: String,
    kind: String,
    source_bucket: String,
    inventory_id: Option<String>,
    job_id: Option<String>,
    state: String,
    outcome: Option<String>,
    attempts: i64,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = ControllerError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        let corrupt = |e: String| ControllerError::Configuration(format!("ledger row corrupt: {}", e));
        Ok(Self {
            kind: row.kind.parse::<ManifestKind>().map_err(corrupt)?,
            state: row.state.parse::<ManifestState>().map_err(corrupt)?,
            outcome: match row.outcome.as_deref() {
                None => None,
                Some("succeeded") => Some(JobOutcome::Succeeded),
                Some("failed") => Some(JobOutcome::Failed),
                Some(other) => return Err(corrupt(format!("outcome `{}`", other))),
            },
            manifest_key: row.manifest_key,
            source_bucket: BucketId::new(row.source_bucket),
            inventory_id: row.inventory_id,
            job_id: row.job_id.map(JobId::new),
            attempts: row.attempts,
            last_error: row.last_error,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT manifest_key, kind, source_bucket, inventory_id, job_id, \
     state, outcome, attempts, last_error, updated_at FROM manifest_ledger";

#[derive(Clone)]
pub struct ManifestLedger {
    db: Arc<SqlitePool>,
    /// Claims older than this belong to an invocation that ran out of budget.
    claim_ttl: Duration,
}

impl ManifestLedger {
    pub fn new(db: Arc<SqlitePool>, claim_ttl: Duration) -> Self {
        Self { db, claim_ttl }
    }

    /// Atomically claim `identity` for processing.
    pub async fn claim(
        &self,
        identity: &ManifestIdentity,
        kind: ManifestKind,
        source_bucket: &BucketId,
        inventory_id: Option<&str>,
    ) -> ControllerResult<Claim> {
        let key = identity.ledger_key();
        let token = Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_ms = now.timestamp_millis();

        let inserted = sqlx::query(
            "INSERT INTO manifest_ledger (
                manifest_key, kind, source_bucket, inventory_id, state,
                claim_token, attempts, claimed_at_ms, updated_at
             ) VALUES (?, ?, ?, ?, 'claimed', ?, 1, ?, ?)
             ON CONFLICT(manifest_key) DO NOTHING",
        )
        .bind(&key)
        .bind(kind.as_str())
        .bind(source_bucket.as_str())
        .bind(inventory_id)
        .bind(&token)
        .bind(now_ms)
        .bind(now)
        .execute(&*self.db)
        .await?;

        if inserted.rows_affected() == 1 {
            debug!(manifest = %key, "claimed manifest");
            return Ok(Claim::Acquired(ClaimTicket {
                manifest_key: key,
                token,
                attempt: 1,
            }));
        }

        let stale_before = now_ms - self.claim_ttl.as_millis() as i64;
        let taken = sqlx::query_scalar::<_, i64>(
            "UPDATE manifest_ledger
             SET state = 'claimed', claim_token = ?, attempts = attempts + 1,
                 claimed_at_ms = ?, updated_at = ?
             WHERE manifest_key = ?
               AND (state = 'failed' OR (state = 'claimed' AND claimed_at_ms < ?))
             RETURNING attempts",
        )
        .bind(&token)
        .bind(now_ms)
        .bind(now)
        .bind(&key)
        .bind(stale_before)
        .fetch_optional(&*self.db)
        .await?;

        if let Some(attempt) = taken {
            debug!(manifest = %key, attempt, "took over manifest claim");
            return Ok(Claim::Acquired(ClaimTicket {
                manifest_key: key,
                token,
                attempt,
            }));
        }

        let entry = self
            .get(&key)
            .await?
            .ok_or_else(|| ControllerError::NotFound(format!("ledger entry {}", key)))?;
        Ok(Claim::Held(entry))
    }

    /// Record the job launched for a claimed manifest.
    ///
    /// # Errors
    ///
    /// `DuplicateSubmission` when the claim was taken over in the meantime.
    pub async fn mark_submitted(&self, ticket: &ClaimTicket, job_id: &JobId) -> ControllerResult<()> {
        self.transition(
            ticket,
            "state = 'submitted', job_id = ?, last_error = NULL",
            Some(job_id.as_str()),
        )
        .await
    }

    /// Record that the manifest needed no job.
    pub async fn mark_skipped(&self, ticket: &ClaimTicket, reason: &str) -> ControllerResult<()> {
        self.transition(ticket, "state = 'skipped', last_error = ?", Some(reason))
            .await
    }

    /// Release the claim so a redelivery can retry.
    pub async fn mark_failed(&self, ticket: &ClaimTicket, error: &str) -> ControllerResult<()> {
        self.transition(ticket, "state = 'failed', last_error = ?", Some(error))
            .await
    }

    /// Close a claimed batch-report row.
    pub async fn mark_reconciled(
        &self,
        ticket: &ClaimTicket,
        job_id: &JobId,
        outcome: JobOutcome,
    ) -> ControllerResult<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE manifest_ledger
             SET state = 'reconciled', job_id = ?, outcome = ?, updated_at = ?
             WHERE manifest_key = ? AND claim_token = ? AND state = 'claimed'",
        )
        .bind(job_id.as_str())
        .bind(outcome.as_str())
        .bind(now)
        .bind(&ticket.manifest_key)
        .bind(&ticket.token)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ControllerError::DuplicateSubmission {
                manifest: ticket.manifest_key.clone(),
            });
        }
        Ok(())
    }

    /// Close the inventory row whose job produced a report. Returns `false`
    /// when the row was already closed or is not in `submitted` state.
    pub async fn complete_job(&self, job_id: &JobId, outcome: JobOutcome) -> ControllerResult<bool> {
        let result = sqlx::query(
            "UPDATE manifest_ledger
             SET state = 'reconciled', outcome = ?, updated_at = ?
             WHERE job_id = ? AND kind = 'inventory' AND state = 'submitted'",
        )
        .bind(outcome.as_str())
        .bind(Utc::now())
        .bind(job_id.as_str())
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn transition(
        &self,
        ticket: &ClaimTicket,
        set_clause: &str,
        value: Option<&str>,
    ) -> ControllerResult<()> {
        let sql = format!(
            "UPDATE manifest_ledger SET {}, updated_at = ?
             WHERE manifest_key = ? AND claim_token = ? AND state = 'claimed'",
            set_clause
        );
        let result = sqlx::query(&sql)
            .bind(value)
            .bind(Utc::now())
            .bind(&ticket.manifest_key)
            .bind(&ticket.token)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ControllerError::DuplicateSubmission {
                manifest: ticket.manifest_key.clone(),
            });
        }
        Ok(())
    }

    pub async fn get(&self, manifest_key: &str) -> ControllerResult<Option<LedgerEntry>> {
        let row = sqlx::query_as::<_, LedgerRow>(&format!("{} WHERE manifest_key = ?", SELECT_COLUMNS))
            .bind(manifest_key)
            .fetch_optional(&*self.db)
            .await?;
        row.map(LedgerEntry::try_from).transpose()
    }

    /// The inventory row that launched `job_id`.
    pub async fn find_by_job(&self, job_id: &JobId) -> ControllerResult<Option<LedgerEntry>> {
        let row = sqlx::query_as::<_, LedgerRow>(&format!(
            "{} WHERE job_id = ? AND kind = 'inventory'",
            SELECT_COLUMNS
        ))
        .bind(job_id.as_str())
        .fetch_optional(&*self.db)
        .await?;
        row.map(LedgerEntry::try_from).transpose()
    }

    pub async fn mark_bucket_enforced(&self, bucket: &BucketId, job_id: &JobId) -> ControllerResult<()> {
        sqlx::query(
            "INSERT INTO bucket_enforcement (bucket, job_id, enforced_at) VALUES (?, ?, ?)
             ON CONFLICT(bucket) DO UPDATE SET job_id = excluded.job_id,
                                               enforced_at = excluded.enforced_at",
        )
        .bind(bucket.as_str())
        .bind(job_id.as_str())
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn is_bucket_enforced(&self, bucket: &BucketId) -> ControllerResult<bool> {
        let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM bucket_enforcement WHERE bucket = ?")
            .bind(bucket.as_str())
            .fetch_optional(&*self.db)
            .await?;
        Ok(found.is_some())
    }

    /// Clear a bucket's enforced mark so the next pass inventories it again.
    /// Returns `false` when the bucket was not marked.
    pub async fn rearm_bucket(&self, bucket: &BucketId) -> ControllerResult<bool> {
        let result = sqlx::query("DELETE FROM bucket_enforcement WHERE bucket = ?")
            .bind(bucket.as_str())
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, models::manifest::ObjectLocation};
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn ledger(ttl: Duration) -> (ManifestLedger, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
        let pool = db::connect(&url).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        (ManifestLedger::new(pool, ttl), dir)
    }

    fn identity() -> ManifestIdentity {
        ManifestIdentity::new(
            ObjectLocation::new("inv", "data-1/Report/2024-03-01T00-00Z/manifest.json"),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn second_claim_sees_the_first() {
        let (ledger, _dir) = ledger(Duration::from_secs(900)).await;
        let bucket = BucketId::new("data-1");
        let first = ledger
            .claim(&identity(), ManifestKind::Inventory, &bucket, Some("Report"))
            .await
            .unwrap();
        let Claim::Acquired(ticket) = first else {
            panic!("first claim should win");
        };
        ledger.mark_submitted(&ticket, &JobId::new("job-a")).await.unwrap();

        match ledger
            .claim(&identity(), ManifestKind::Inventory, &bucket, Some("Report"))
            .await
            .unwrap()
        {
            Claim::Held(entry) => {
                assert_eq!(entry.state, ManifestState::Submitted);
                assert_eq!(entry.job_id, Some(JobId::new("job-a")));
            }
            Claim::Acquired(_) => panic!("manifest was claimed twice"),
        }
    }

    #[tokio::test]
    async fn failed_claims_can_be_taken_over() {
        let (ledger, _dir) = ledger(Duration::from_secs(900)).await;
        let bucket = BucketId::new("data-1");
        let Claim::Acquired(ticket) = ledger
            .claim(&identity(), ManifestKind::Inventory, &bucket, None)
            .await
            .unwrap()
        else {
            panic!("first claim should win");
        };
        ledger.mark_failed(&ticket, "throttled").await.unwrap();

        let Claim::Acquired(retry) = ledger
            .claim(&identity(), ManifestKind::Inventory, &bucket, None)
            .await
            .unwrap()
        else {
            panic!("failed manifest should be reclaimable");
        };
        assert_eq!(retry.attempt, 2);

        // The stale ticket is fenced off.
        let err = ledger
            .mark_submitted(&ticket, &JobId::new("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::DuplicateSubmission { .. }));
    }

    #[tokio::test]
    async fn expired_claims_are_reclaimable() {
        let (ledger, _dir) = ledger(Duration::ZERO).await;
        let bucket = BucketId::new("data-1");
        let first = ledger
            .claim(&identity(), ManifestKind::Inventory, &bucket, None)
            .await
            .unwrap();
        assert!(matches!(first, Claim::Acquired(_)));
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = ledger
            .claim(&identity(), ManifestKind::Inventory, &bucket, None)
            .await
            .unwrap();
        assert!(matches!(second, Claim::Acquired(ClaimTicket { attempt: 2, .. })));
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let (ledger, _dir) = ledger(Duration::from_secs(900)).await;
        let bucket = BucketId::new("data-1");
        let attempts = (0..8).map(|_| {
            let ledger = ledger.clone();
            let bucket = bucket.clone();
            tokio::spawn(async move {
                ledger
                    .claim(&identity(), ManifestKind::Inventory, &bucket, None)
                    .await
                    .unwrap()
            })
        });
        let results = futures::future::join_all(attempts).await;
        let winners = results
            .into_iter()
            .filter(|r| matches!(r.as_ref().unwrap(), Claim::Acquired(_)))
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn bucket_marks_can_be_rearmed() {
        let (ledger, _dir) = ledger(Duration::from_secs(900)).await;
        let bucket = BucketId::new("data-1");
        assert!(!ledger.is_bucket_enforced(&bucket).await.unwrap());
        ledger
            .mark_bucket_enforced(&bucket, &JobId::new("j1"))
            .await
            .unwrap();
        assert!(ledger.is_bucket_enforced(&bucket).await.unwrap());
        assert!(ledger.rearm_bucket(&bucket).await.unwrap());
        assert!(!ledger.rearm_bucket(&bucket).await.unwrap());
    }
}
