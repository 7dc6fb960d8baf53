//! Turns a delivered inventory manifest into one copy-in-place encryption
//! job.
//!
//! Exactly-once launch rests on two layers:
//!
//! 1. The ledger claim taken before anything is submitted, so concurrent or
//!    redelivered invocations for the same manifest identity back off.
//! 2. The client request token derived from the manifest identity, so a
//!    retried submission after a lost response or a taken-over claim maps
//!    onto the job that already exists.

use super::{
    gateways::{BatchService, StorageGateway},
    ledger::{Claim, ClaimTicket, ManifestLedger},
    manifest_reader::write_csv,
    retry::RetryPolicy,
};
use crate::{
    config::ControllerConfig,
    errors::{ControllerError, ControllerResult},
    models::{
        job::{CopyInPlace, JobId, JobReportConfig, JobRequest, JobTask, ManifestFormat},
        ledger::ManifestState,
        manifest::{InventoryManifest, ManifestKind, ObjectLocation, url_encode},
    },
};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LaunchOutcome {
    Launched {
        job_id: JobId,
        task_count: usize,
        /// Objects left out because they already had the target encryption.
        already_encrypted: usize,
    },
    /// The manifest identity was claimed before; nothing was submitted.
    AlreadyLaunched {
        job_id: Option<JobId>,
        state: ManifestState,
    },
    /// The inventory listed no objects.
    Empty,
    /// Every listed object was already encrypted as required.
    NothingToEncrypt { already_encrypted: usize },
    /// `Encrypt` is off; manifests are acknowledged without a job.
    EncryptionDisabled,
}

/// Objects a job will rewrite, and how many were filtered out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPlan {
    pub tasks: Vec<JobTask>,
    pub already_encrypted: usize,
}

/// One task per listed object, minus objects already in the target state
/// when the listing can vouch for the key.
pub fn plan_tasks(manifest: &InventoryManifest, config: &ControllerConfig) -> TaskPlan {
    let mut tasks = Vec::with_capacity(manifest.entries.len());
    let mut already_encrypted = 0;
    for entry in &manifest.entries {
        let satisfied = entry
            .encryption
            .is_some_and(|status| status.satisfies(&config.encryption, config.is_default_kms_key));
        if satisfied {
            already_encrypted += 1;
            continue;
        }
        tasks.push(JobTask {
            bucket: entry.bucket.clone(),
            key: entry.key.clone(),
            version_id: entry.version_id.clone(),
        });
    }
    TaskPlan {
        tasks,
        already_encrypted,
    }
}

/// Assemble the submission for `manifest`. `job_manifest` is the object
/// the service reads tasks from, either the inventory manifest itself or a
/// filtered CSV.
pub fn build_job_request(
    manifest: &InventoryManifest,
    config: &ControllerConfig,
    plan: TaskPlan,
    job_manifest: ObjectLocation,
    manifest_format: ManifestFormat,
    manifest_etag: Option<String>,
) -> JobRequest {
    let tags = if config.add_tag {
        vec![config.object_tag.clone()]
    } else {
        Vec::new()
    };
    JobRequest {
        client_request_token: manifest.identity.request_token(),
        source_bucket: manifest.source_bucket.clone(),
        manifest: job_manifest,
        manifest_format,
        manifest_etag,
        operation: CopyInPlace {
            encryption: config.encryption.clone(),
            tags,
        },
        report: JobReportConfig {
            bucket: config.batch_reports_bucket.clone(),
            prefix: config.report_prefix.clone(),
            level: config.reporting_level,
        },
        role_arn: config.role_arn.clone(),
        description: format!(
            "encrypt {} ({}) from {}",
            manifest.source_bucket,
            config.encryption.status(),
            manifest.identity
        ),
        tasks: plan.tasks,
    }
}

#[derive(Clone)]
pub struct BatchJobLauncher {
    batch: Arc<dyn BatchService>,
    storage: Arc<dyn StorageGateway>,
    ledger: ManifestLedger,
    config: Arc<ControllerConfig>,
    retry: RetryPolicy,
}

impl BatchJobLauncher {
    pub fn new(
        batch: Arc<dyn BatchService>,
        storage: Arc<dyn StorageGateway>,
        ledger: ManifestLedger,
        config: Arc<ControllerConfig>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            batch,
            storage,
            ledger,
            config,
            retry,
        }
    }

    /// Launch the encryption job for an inventory manifest, at most once per
    /// manifest identity.
    ///
    /// # Errors
    ///
    /// Submission errors after the retry budget is spent. The ledger row is
    /// released to `failed` first so a redelivery can try again.
    pub async fn launch(&self, manifest: &InventoryManifest) -> ControllerResult<LaunchOutcome> {
        if !self.config.encrypt {
            info!(manifest = %manifest.identity, "encryption disabled, not launching");
            return Ok(LaunchOutcome::EncryptionDisabled);
        }

        let ticket = match self
            .ledger
            .claim(
                &manifest.identity,
                ManifestKind::Inventory,
                &manifest.source_bucket,
                Some(&manifest.inventory_id),
            )
            .await?
        {
            Claim::Acquired(ticket) => ticket,
            Claim::Held(entry) => {
                info!(
                    manifest = %manifest.identity,
                    state = %entry.state,
                    job_id = ?entry.job_id,
                    "manifest already handled"
                );
                return Ok(LaunchOutcome::AlreadyLaunched {
                    job_id: entry.job_id,
                    state: entry.state,
                });
            }
        };

        if manifest.is_empty() {
            info!(bucket = %manifest.source_bucket, manifest = %manifest.identity, "inventory is empty, no job");
            self.ledger.mark_skipped(&ticket, "empty manifest").await?;
            return Ok(LaunchOutcome::Empty);
        }

        let plan = plan_tasks(manifest, &self.config);
        if plan.tasks.is_empty() {
            info!(
                bucket = %manifest.source_bucket,
                already_encrypted = plan.already_encrypted,
                "all objects already encrypted, no job"
            );
            self.ledger
                .mark_skipped(&ticket, "all objects already encrypted")
                .await?;
            return Ok(LaunchOutcome::NothingToEncrypt {
                already_encrypted: plan.already_encrypted,
            });
        }

        match self.submit(manifest, plan, &ticket).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if let Err(release_err) = self.ledger.mark_failed(&ticket, &err.to_string()).await {
                    warn!(
                        manifest = %manifest.identity,
                        error = %release_err,
                        "could not release ledger claim"
                    );
                }
                Err(err)
            }
        }
    }

    async fn submit(
        &self,
        manifest: &InventoryManifest,
        plan: TaskPlan,
        ticket: &ClaimTicket,
    ) -> ControllerResult<LaunchOutcome> {
        let already_encrypted = plan.already_encrypted;
        let task_count = plan.tasks.len();

        let (job_manifest, format, etag) = if already_encrypted == 0 {
            (
                manifest.identity.location.clone(),
                ManifestFormat::InventoryReport,
                None,
            )
        } else {
            let location = ObjectLocation::new(
                self.config.batch_reports_bucket.clone(),
                format!(
                    "{}/manifests/{}.csv",
                    self.config.report_prefix.trim_end_matches('/'),
                    manifest.identity.request_token()
                ),
            );
            let body = task_manifest_csv(&plan.tasks)?;
            let etag = self
                .retry
                .run("put_object", |_| self.storage.put_object(&location, body.clone()))
                .await?;
            (location, ManifestFormat::Csv, Some(etag))
        };

        let request = build_job_request(manifest, &self.config, plan, job_manifest, format, etag);
        let job_id = self
            .retry
            .run("create_job", |_| self.batch.create_job(&request))
            .await?;

        match self.ledger.mark_submitted(ticket, &job_id).await {
            Ok(()) => {}
            Err(ControllerError::DuplicateSubmission { manifest: key }) => {
                // Our claim was taken over; the request token made the
                // takeover's submission land on this same job.
                info!(manifest = %key, job_id = %job_id, "lost ledger race after submission");
                return Ok(LaunchOutcome::AlreadyLaunched {
                    job_id: Some(job_id),
                    state: ManifestState::Submitted,
                });
            }
            Err(err) => return Err(err),
        }

        info!(
            bucket = %manifest.source_bucket,
            job_id = %job_id,
            tasks = task_count,
            already_encrypted,
            encryption = %self.config.encryption.status(),
            tagged = self.config.add_tag,
            "launched encryption job"
        );
        Ok(LaunchOutcome::Launched {
            job_id,
            task_count,
            already_encrypted,
        })
    }
}

/// `bucket,key[,version]` rows with URL-encoded keys.
fn task_manifest_csv(tasks: &[JobTask]) -> ControllerResult<Bytes> {
    let rows = tasks.iter().map(|task| {
        let mut row = vec![task.bucket.to_string(), url_encode(&task.key)];
        row.extend(task.version_id.clone());
        row
    });
    Ok(Bytes::from(write_csv(rows)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{
            bucket::{BucketId, EncryptionScheme, EncryptionStatus, Tag},
            manifest::{InventoryEntry, ManifestIdentity},
        },
        services::testing::{self, Fakes, config, config_with},
    };
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::Ordering;

    fn manifest(entries: &[(&str, Option<EncryptionStatus>)]) -> InventoryManifest {
        InventoryManifest {
            identity: ManifestIdentity::new(
                ObjectLocation::new("inv-reports", "data-1/Report/2024-03-01T00-00Z/manifest.json"),
                Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            ),
            source_bucket: BucketId::new("data-1"),
            destination_bucket: BucketId::new("inv-reports"),
            inventory_id: "Report".into(),
            file_schema: vec!["Bucket".into(), "Key".into(), "EncryptionStatus".into()],
            files: Vec::new(),
            entries: entries
                .iter()
                .map(|(key, encryption)| InventoryEntry {
                    bucket: BucketId::new("data-1"),
                    key: key.to_string(),
                    version_id: None,
                    encryption: *encryption,
                })
                .collect(),
        }
    }

    async fn launcher(
        fakes: &Fakes,
        cfg: ControllerConfig,
    ) -> (BatchJobLauncher, ManifestLedger, tempfile::TempDir) {
        let (ledger, dir) = testing::ledger().await;
        let launcher = BatchJobLauncher::new(
            fakes.batch.clone(),
            fakes.storage.clone(),
            ledger.clone(),
            Arc::new(cfg),
            RetryPolicy::immediate(3),
        );
        (launcher, ledger, dir)
    }

    #[tokio::test]
    async fn one_task_per_object_with_tag_and_kms() {
        let fakes = Fakes::new(Vec::new());
        let (launcher, _ledger, _dir) = launcher(&fakes, config()).await;
        let outcome = launcher
            .launch(&manifest(&[("a", None), ("b", None), ("c", Some(EncryptionStatus::NotSse))]))
            .await
            .unwrap();
        assert!(matches!(outcome, LaunchOutcome::Launched { task_count: 3, .. }));

        let jobs = fakes.batch.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        let request = &jobs[0].1;
        assert_eq!(request.tasks.len(), 3);
        assert_eq!(
            request.operation.encryption,
            EncryptionScheme::SseKms {
                key_id: "1232d31d".into()
            }
        );
        assert_eq!(request.operation.tags, vec![Tag::new("__ObjectEncrypted", "no")]);
        assert_eq!(request.manifest_format, ManifestFormat::InventoryReport);
    }

    #[tokio::test]
    async fn launching_twice_submits_once() {
        let fakes = Fakes::new(Vec::new());
        let (launcher, _ledger, _dir) = launcher(&fakes, config()).await;
        let manifest = manifest(&[("a", None)]);
        let first = launcher.launch(&manifest).await.unwrap();
        let second = launcher.launch(&manifest).await.unwrap();
        let LaunchOutcome::Launched { job_id, .. } = first else {
            panic!("first launch should submit");
        };
        assert_eq!(
            second,
            LaunchOutcome::AlreadyLaunched {
                job_id: Some(job_id),
                state: ManifestState::Submitted
            }
        );
        assert_eq!(fakes.batch.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_launches_submit_once() {
        let fakes = Fakes::new(Vec::new());
        let (launcher, _ledger, _dir) = launcher(&fakes, config()).await;
        let manifest = manifest(&[("a", None), ("b", None)]);
        let runs = (0..6).map(|_| launcher.launch(&manifest));
        let outcomes = futures::future::join_all(runs).await;
        let launched = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(LaunchOutcome::Launched { .. })))
            .count();
        assert_eq!(launched, 1);
        assert_eq!(fakes.batch.job_count(), 1);
    }

    #[tokio::test]
    async fn empty_manifest_is_a_no_op() {
        let fakes = Fakes::new(Vec::new());
        let (launcher, ledger, _dir) = launcher(&fakes, config()).await;
        let manifest = manifest(&[]);
        assert_eq!(launcher.launch(&manifest).await.unwrap(), LaunchOutcome::Empty);
        assert_eq!(fakes.batch.job_count(), 0);
        let entry = ledger.get(&manifest.identity.ledger_key()).await.unwrap().unwrap();
        assert_eq!(entry.state, ManifestState::Skipped);
    }

    #[tokio::test]
    async fn default_key_short_circuit_filters_encrypted_objects() {
        let fakes = Fakes::new(Vec::new());
        let (launcher, _ledger, _dir) = launcher(&fakes, config()).await;
        let outcome = launcher
            .launch(&manifest(&[
                ("a", Some(EncryptionStatus::SseKms)),
                ("b", Some(EncryptionStatus::NotSse)),
            ]))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            LaunchOutcome::Launched {
                task_count: 1,
                already_encrypted: 1,
                ..
            }
        ));
        let jobs = fakes.batch.jobs.lock().unwrap();
        let request = &jobs[0].1;
        assert_eq!(request.manifest_format, ManifestFormat::Csv);
        assert!(request.manifest_etag.is_some());
        let csv = fakes.storage.objects.lock().unwrap()[&request.manifest].clone();
        assert_eq!(&csv[..], b"data-1,b\n");
    }

    #[test]
    fn task_rows_carry_versions_only_when_present() {
        let tasks = vec![
            JobTask {
                bucket: BucketId::new("data-1"),
                key: "q1,q2/report one.csv".into(),
                version_id: Some("v7".into()),
            },
            JobTask {
                bucket: BucketId::new("data-1"),
                key: "b".into(),
                version_id: None,
            },
        ];
        let csv = task_manifest_csv(&tasks).unwrap();
        assert_eq!(&csv[..], b"data-1,q1%2Cq2/report%20one.csv,v7\ndata-1,b\n");
    }

    #[tokio::test]
    async fn custom_key_rewrites_kms_objects() {
        let fakes = Fakes::new(Vec::new());
        let cfg = config_with(&[("IsDefaultS3KMSKey", "false")]);
        let (launcher, _ledger, _dir) = launcher(&fakes, cfg).await;
        let outcome = launcher
            .launch(&manifest(&[("a", Some(EncryptionStatus::SseKms))]))
            .await
            .unwrap();
        assert!(matches!(outcome, LaunchOutcome::Launched { task_count: 1, .. }));
    }

    #[tokio::test]
    async fn fully_encrypted_bucket_needs_no_job() {
        let fakes = Fakes::new(Vec::new());
        let cfg = config_with(&[("SSEType", "SSE-S3")]);
        let (launcher, _ledger, _dir) = launcher(&fakes, cfg).await;
        let outcome = launcher
            .launch(&manifest(&[("a", Some(EncryptionStatus::SseS3))]))
            .await
            .unwrap();
        assert_eq!(outcome, LaunchOutcome::NothingToEncrypt { already_encrypted: 1 });
        assert_eq!(fakes.batch.job_count(), 0);
    }

    #[tokio::test]
    async fn tagging_can_be_disabled() {
        let fakes = Fakes::new(Vec::new());
        let (launcher, _ledger, _dir) = launcher(&fakes, config_with(&[("AddTag", "false")])).await;
        launcher.launch(&manifest(&[("a", None)])).await.unwrap();
        assert!(fakes.batch.jobs.lock().unwrap()[0].1.operation.tags.is_empty());
    }

    #[tokio::test]
    async fn retries_transient_submission_failures() {
        let fakes = Fakes::new(Vec::new());
        fakes.batch.flaky_submits.store(2, Ordering::SeqCst);
        let (launcher, _ledger, _dir) = launcher(&fakes, config()).await;
        let outcome = launcher.launch(&manifest(&[("a", None)])).await.unwrap();
        assert!(matches!(outcome, LaunchOutcome::Launched { .. }));
        assert_eq!(fakes.batch.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_submission_releases_the_claim() {
        let fakes = Fakes::new(Vec::new());
        fakes.batch.flaky_submits.store(3, Ordering::SeqCst);
        let (launcher, ledger, _dir) = launcher(&fakes, config()).await;
        let manifest = manifest(&[("a", None)]);

        let err = launcher.launch(&manifest).await.unwrap_err();
        assert!(err.is_transient());
        let entry = ledger.get(&manifest.identity.ledger_key()).await.unwrap().unwrap();
        assert_eq!(entry.state, ManifestState::Failed);

        // Redelivery claims the failed row and launches.
        let retry = launcher.launch(&manifest).await.unwrap();
        assert!(matches!(retry, LaunchOutcome::Launched { .. }));
        assert_eq!(fakes.batch.job_count(), 1);
    }

    #[tokio::test]
    async fn disabled_encryption_skips_everything() {
        let fakes = Fakes::new(Vec::new());
        let (launcher, _ledger, _dir) = launcher(&fakes, config_with(&[("Encrypt", "false")])).await;
        let outcome = launcher.launch(&manifest(&[("a", None)])).await.unwrap();
        assert_eq!(outcome, LaunchOutcome::EncryptionDisabled);
        assert_eq!(fakes.batch.job_count(), 0);
    }
}
