//! Job completion: consume a batch report, register it in the catalog and
//! decide whether the originating inventory configuration can go.

use super::{
    gateways::{CatalogService, StorageGateway},
    ledger::{Claim, ManifestLedger},
    retry::RetryPolicy,
};
use crate::{
    config::ControllerConfig,
    errors::{ControllerError, ControllerResult},
    models::{
        bucket::BucketId,
        job::{JobId, ReportingLevel},
        ledger::{JobOutcome, ManifestState},
        manifest::{BatchReport, ManifestKind, ReportEntry, TaskStatus},
        partition::{CatalogPartition, CatalogTable},
    },
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Failed keys kept in an assessment for logs and responses.
const FAILED_SAMPLE_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportAssessment {
    pub total: usize,
    pub failed: usize,
    pub failed_keys: Vec<String>,
}

impl ReportAssessment {
    pub fn outcome(&self) -> JobOutcome {
        if self.failed == 0 {
            JobOutcome::Succeeded
        } else {
            JobOutcome::Failed
        }
    }
}

/// Count failures in a report. A `FailedTasksOnly` report lists nothing
/// but failures, so every entry counts regardless of its status column.
pub fn assess(level: ReportingLevel, entries: &[ReportEntry]) -> ReportAssessment {
    let failures: Vec<&ReportEntry> = match level {
        ReportingLevel::FailedTasksOnly => entries.iter().collect(),
        ReportingLevel::AllTasks => entries
            .iter()
            .filter(|e| e.status == TaskStatus::Failed)
            .collect(),
    };
    ReportAssessment {
        total: entries.len(),
        failed: failures.len(),
        failed_keys: failures
            .iter()
            .take(FAILED_SAMPLE_LIMIT)
            .map(|e| format!("{}/{}", e.bucket, e.key))
            .collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Succeeded {
        job_id: JobId,
        bucket: Option<BucketId>,
        partition_registered: bool,
        inventory_removed: bool,
    },
    Failed {
        job_id: JobId,
        bucket: Option<BucketId>,
        assessment: ReportAssessment,
        partition_registered: bool,
    },
    /// The report was processed by an earlier invocation.
    Duplicate {
        job_id: JobId,
        state: ManifestState,
    },
}

#[derive(Clone)]
pub struct JobCompletionReconciler {
    storage: Arc<dyn StorageGateway>,
    catalog: Arc<dyn CatalogService>,
    ledger: ManifestLedger,
    config: Arc<ControllerConfig>,
    retry: RetryPolicy,
}

impl JobCompletionReconciler {
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        catalog: Arc<dyn CatalogService>,
        ledger: ManifestLedger,
        config: Arc<ControllerConfig>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            storage,
            catalog,
            ledger,
            config,
            retry,
        }
    }

    pub async fn reconcile(&self, report: &BatchReport) -> ControllerResult<ReconcileOutcome> {
        let origin = self.ledger.find_by_job(&report.job_id).await?;
        let source_bucket = origin
            .as_ref()
            .map(|entry| entry.source_bucket.clone())
            .unwrap_or_else(|| report.identity.location.bucket.clone());

        let ticket = match self
            .ledger
            .claim(
                &report.identity,
                ManifestKind::BatchReport,
                &source_bucket,
                origin.as_ref().and_then(|e| e.inventory_id.as_deref()),
            )
            .await?
        {
            Claim::Acquired(ticket) => ticket,
            Claim::Held(entry) => {
                info!(job_id = %report.job_id, state = %entry.state, "report already handled");
                return Ok(ReconcileOutcome::Duplicate {
                    job_id: report.job_id.clone(),
                    state: entry.state,
                });
            }
        };

        let origin = origin
            .as_ref()
            .map(|e| (&e.source_bucket, e.inventory_id.as_deref()));
        match self.apply(report, origin).await {
            Ok(outcome) => {
                let verdict = match &outcome {
                    ReconcileOutcome::Failed { .. } => JobOutcome::Failed,
                    _ => JobOutcome::Succeeded,
                };
                match self.ledger.mark_reconciled(&ticket, &report.job_id, verdict).await {
                    Ok(()) => Ok(outcome),
                    Err(ControllerError::DuplicateSubmission { .. }) => Ok(ReconcileOutcome::Duplicate {
                        job_id: report.job_id.clone(),
                        state: ManifestState::Reconciled,
                    }),
                    Err(err) => Err(err),
                }
            }
            Err(err) => {
                if let Err(release_err) = self.ledger.mark_failed(&ticket, &err.to_string()).await {
                    warn!(job_id = %report.job_id, error = %release_err, "could not release ledger claim");
                }
                Err(err)
            }
        }
    }

    async fn apply(
        &self,
        report: &BatchReport,
        origin: Option<(&BucketId, Option<&str>)>,
    ) -> ControllerResult<ReconcileOutcome> {
        let assessment = assess(self.config.reporting_level, &report.entries);
        let outcome = assessment.outcome();

        let partition = CatalogPartition::dated(
            &self.config.database_name,
            self.config.table_name(CatalogTable::BatchReport),
            report.identity.generated_at,
            report.results_prefix(),
        )
        .with_value("job", report.job_id.as_str());
        let partition_registered = self
            .retry
            .run("add_partition", |_| self.catalog.add_partition(&partition))
            .await?;

        if !self.ledger.complete_job(&report.job_id, outcome).await? {
            warn!(job_id = %report.job_id, "no submitted ledger row for job");
        }

        let bucket = origin.map(|(bucket, _)| bucket.clone());
        if outcome == JobOutcome::Failed {
            warn!(
                job_id = %report.job_id,
                bucket = ?bucket,
                failed = assessment.failed,
                total = assessment.total,
                sample = ?assessment.failed_keys,
                "encryption job reported failed tasks, keeping inventory configuration"
            );
            return Ok(ReconcileOutcome::Failed {
                job_id: report.job_id.clone(),
                bucket,
                assessment,
                partition_registered,
            });
        }

        let mut inventory_removed = false;
        match origin {
            Some((bucket, inventory_id)) if self.config.remove_inventory_after_success => {
                let report_name = inventory_id.unwrap_or(self.config.inventory_name.as_str());
                inventory_removed = self
                    .retry
                    .run("delete_inventory_configuration", |_| {
                        self.storage.delete_inventory_configuration(bucket, report_name)
                    })
                    .await?;
                self.ledger.mark_bucket_enforced(bucket, &report.job_id).await?;
                info!(
                    bucket = %bucket,
                    job_id = %report.job_id,
                    report_name,
                    removed = inventory_removed,
                    "encryption complete, inventory configuration removed"
                );
            }
            Some((bucket, _)) => {
                info!(bucket = %bucket, job_id = %report.job_id, "encryption complete");
            }
            None => {
                warn!(
                    job_id = %report.job_id,
                    "job not found in ledger, cannot locate its inventory configuration"
                );
            }
        }

        Ok(ReconcileOutcome::Succeeded {
            job_id: report.job_id.clone(),
            bucket,
            partition_registered,
            inventory_removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{
            inventory::{InventoryConfiguration, InventoryFrequency},
            manifest::{ManifestIdentity, ObjectLocation},
        },
        services::testing::{self, Fakes, config, config_with},
    };
    use chrono::{TimeZone, Utc};

    fn entry(key: &str, status: TaskStatus) -> ReportEntry {
        ReportEntry {
            bucket: BucketId::new("data-1"),
            key: key.to_string(),
            version_id: None,
            status,
            error_code: (status == TaskStatus::Failed).then(|| "NoSuchKey".to_string()),
            http_status: (status == TaskStatus::Failed).then_some(404),
            message: None,
        }
    }

    fn report(job: &str, entries: Vec<ReportEntry>) -> BatchReport {
        BatchReport {
            identity: ManifestIdentity::new(
                ObjectLocation::new("batch-reports", format!("reports/job-{}/manifest.json", job)),
                Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap(),
            ),
            job_id: JobId::new(job),
            format: "Report_CSV_20180820".into(),
            result_files: Vec::new(),
            entries,
        }
    }

    /// Ledger with an inventory manifest submitted as `job`, and the
    /// inventory configuration still installed on `data-1`.
    async fn setup(
        cfg: ControllerConfig,
        job: &str,
    ) -> (Fakes, JobCompletionReconciler, ManifestLedger, tempfile::TempDir) {
        let fakes = Fakes::new(Vec::new());
        let (ledger, dir) = testing::ledger().await;
        let bucket = BucketId::new("data-1");
        let identity = ManifestIdentity::new(
            ObjectLocation::new("inv-reports", "data-1/Report/2024-03-01T00-00Z/manifest.json"),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        );
        let Claim::Acquired(ticket) = ledger
            .claim(&identity, ManifestKind::Inventory, &bucket, Some("Report"))
            .await
            .unwrap()
        else {
            panic!("fresh ledger");
        };
        ledger.mark_submitted(&ticket, &JobId::new(job)).await.unwrap();

        let config = InventoryConfiguration::new(
            bucket.clone(),
            "Report",
            BucketId::new("inv-reports"),
            InventoryFrequency::Daily,
        );
        fakes
            .storage
            .configs
            .lock()
            .unwrap()
            .insert((bucket, "Report".into()), config);

        let reconciler = JobCompletionReconciler::new(
            fakes.storage.clone(),
            fakes.catalog.clone(),
            ledger.clone(),
            Arc::new(cfg),
            RetryPolicy::immediate(3),
        );
        (fakes, reconciler, ledger, dir)
    }

    #[test]
    fn failed_tasks_only_counts_every_entry() {
        let entries = vec![entry("a", TaskStatus::Succeeded), entry("b", TaskStatus::Failed)];
        let assessment = assess(ReportingLevel::FailedTasksOnly, &entries);
        assert_eq!(assessment.failed, 2);
        assert_eq!(assess(ReportingLevel::AllTasks, &entries).failed, 1);
        assert_eq!(assess(ReportingLevel::FailedTasksOnly, &[]).outcome(), JobOutcome::Succeeded);
    }

    #[tokio::test]
    async fn success_removes_configuration_and_registers_partition() {
        let (fakes, reconciler, ledger, _dir) = setup(config(), "j1").await;
        let outcome = reconciler.reconcile(&report("j1", Vec::new())).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Succeeded {
                job_id: JobId::new("j1"),
                bucket: Some(BucketId::new("data-1")),
                partition_registered: true,
                inventory_removed: true,
            }
        );
        assert_eq!(fakes.storage.config_count(), 0);

        let partitions = fakes.catalog.in_table("batch_reports");
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].spec(), "dt=2024-03-01-06-00/job=j1");
        assert_eq!(partitions[0].location.key, "reports/job-j1/results/");

        assert!(ledger.is_bucket_enforced(&BucketId::new("data-1")).await.unwrap());
        let origin = ledger.find_by_job(&JobId::new("j1")).await.unwrap().unwrap();
        assert_eq!(origin.state, ManifestState::Reconciled);
        assert_eq!(origin.outcome, Some(JobOutcome::Succeeded));
    }

    #[tokio::test]
    async fn failed_tasks_only_report_keeps_configuration() {
        let (fakes, reconciler, ledger, _dir) = setup(config(), "j2").await;
        let outcome = reconciler
            .reconcile(&report("j2", vec![entry("b", TaskStatus::Failed)]))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Failed { .. }));
        assert_eq!(fakes.storage.config_count(), 1);
        assert_eq!(fakes.catalog.in_table("batch_reports").len(), 1);
        assert!(!ledger.is_bucket_enforced(&BucketId::new("data-1")).await.unwrap());
    }

    #[tokio::test]
    async fn all_tasks_partial_failure_keeps_configuration() {
        let (fakes, reconciler, _ledger, _dir) =
            setup(config_with(&[("ReportingLevel", "AllTasks")]), "j3").await;
        let outcome = reconciler
            .reconcile(&report(
                "j3",
                vec![
                    entry("a", TaskStatus::Succeeded),
                    entry("b", TaskStatus::Succeeded),
                    entry("c", TaskStatus::Failed),
                ],
            ))
            .await
            .unwrap();
        let ReconcileOutcome::Failed {
            assessment,
            partition_registered,
            ..
        } = outcome
        else {
            panic!("expected failure, got {:?}", outcome);
        };
        assert_eq!((assessment.total, assessment.failed), (3, 1));
        assert!(partition_registered);
        assert_eq!(fakes.storage.config_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_report_is_processed_once() {
        let (fakes, reconciler, _ledger, _dir) = setup(config(), "j4").await;
        let report = report("j4", Vec::new());
        reconciler.reconcile(&report).await.unwrap();
        let second = reconciler.reconcile(&report).await.unwrap();
        assert!(matches!(second, ReconcileOutcome::Duplicate { .. }));
        assert_eq!(fakes.catalog.in_table("batch_reports").len(), 1);
    }

    #[tokio::test]
    async fn keeps_configuration_when_removal_disabled() {
        let (fakes, reconciler, ledger, _dir) =
            setup(config_with(&[("RemoveS3InvConfig", "false")]), "j5").await;
        let outcome = reconciler.reconcile(&report("j5", Vec::new())).await.unwrap();
        assert!(matches!(
            outcome,
            ReconcileOutcome::Succeeded {
                inventory_removed: false,
                ..
            }
        ));
        assert_eq!(fakes.storage.config_count(), 1);
        assert!(!ledger.is_bucket_enforced(&BucketId::new("data-1")).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_job_still_registers_partition() {
        let (fakes, reconciler, _ledger, _dir) = setup(config(), "j6").await;
        let outcome = reconciler.reconcile(&report("other", Vec::new())).await.unwrap();
        assert!(matches!(
            outcome,
            ReconcileOutcome::Succeeded {
                bucket: None,
                inventory_removed: false,
                ..
            }
        ));
        assert_eq!(fakes.catalog.in_table("batch_reports").len(), 1);
        assert_eq!(fakes.storage.config_count(), 1);
    }
}
