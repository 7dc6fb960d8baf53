//! Invocation entry points: one storage event, or one scheduled pass.

use super::{
    ledger::ManifestLedger,
    reconciler::ReconcileOutcome,
    router::{ManifestEventRouter, RouteOutcome},
    scheduler::{InventoryScheduler, SchedulePassReport},
    selector::TargetSelector,
};
use crate::{
    config::ControllerConfig,
    errors::{ControllerError, ControllerResult},
    models::{
        bucket::BucketId,
        event::{EventPayload, StorageEvent},
        job::JobId,
        ledger::LedgerEntry,
    },
};
use serde::Serialize;
use std::{collections::BTreeSet, sync::Arc};
use tracing::{error, info, warn};

/// What an invocation reports back to the transport.
///
/// Both variants are acknowledged; only an `Err` from
/// [`Controller::handle_event`] asks the transport to redeliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationOutcome {
    Handled { outcome: Option<RouteOutcome> },
    /// Recorded and acknowledged; redelivery would not help.
    SoftFailure { kind: &'static str, reason: String },
}

#[derive(Clone)]
pub struct Controller {
    config: Arc<ControllerConfig>,
    selector: TargetSelector,
    scheduler: InventoryScheduler,
    router: ManifestEventRouter,
    ledger: ManifestLedger,
}

impl Controller {
    pub fn new(
        config: Arc<ControllerConfig>,
        selector: TargetSelector,
        scheduler: InventoryScheduler,
        router: ManifestEventRouter,
        ledger: ManifestLedger,
    ) -> Self {
        Self {
            config,
            selector,
            scheduler,
            router,
            ledger,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Handle one notification within the invocation budget.
    ///
    /// # Errors
    ///
    /// Systemic failures (exhausted retries, storage or database errors,
    /// running out of budget). Bucket- and manifest-scoped failures come
    /// back as [`InvocationOutcome::SoftFailure`].
    pub async fn handle_event(&self, event: &StorageEvent) -> ControllerResult<InvocationOutcome> {
        let budget = self.config.invocation_timeout;
        let routed = match tokio::time::timeout(budget, self.router.route(event)).await {
            Ok(result) => result,
            Err(_) => {
                error!(event_id = %event.event_id, manifest = %event.manifest, "invocation budget exhausted");
                return Err(ControllerError::Timeout(budget));
            }
        };

        match routed {
            Ok(RouteOutcome::BatchReport {
                outcome: ReconcileOutcome::Failed { job_id, assessment, .. },
            }) => Ok(InvocationOutcome::SoftFailure {
                kind: "job_failed",
                reason: format!(
                    "job {} reported {} failed of {} tasks",
                    job_id, assessment.failed, assessment.total
                ),
            }),
            Ok(outcome) => Ok(InvocationOutcome::Handled {
                outcome: Some(outcome),
            }),
            Err(ControllerError::DuplicateSubmission { manifest }) => {
                info!(manifest = %manifest, "duplicate delivery, already handled");
                Ok(InvocationOutcome::Handled { outcome: None })
            }
            Err(err) if err.is_soft() => {
                warn!(
                    event_id = %event.event_id,
                    manifest = %event.manifest,
                    kind = err.kind(),
                    error = %err,
                    "event failed, not retrying"
                );
                Ok(InvocationOutcome::SoftFailure {
                    kind: err.kind(),
                    reason: err.to_string(),
                })
            }
            Err(err) => {
                error!(
                    event_id = %event.event_id,
                    manifest = %event.manifest,
                    kind = err.kind(),
                    error = %err,
                    "event failed"
                );
                Err(err)
            }
        }
    }

    /// Handle every record of a payload in order, stopping at the first
    /// hard failure. Already-handled records are deduplicated on redelivery.
    pub async fn handle_payload(&self, payload: EventPayload) -> ControllerResult<Vec<InvocationOutcome>> {
        let mut outcomes = Vec::new();
        for event in payload.into_events() {
            outcomes.push(self.handle_event(&event).await?);
        }
        Ok(outcomes)
    }

    /// Scheduled pass: select tagged buckets and make sure each one that
    /// still needs enforcing has its inventory configured.
    pub async fn run_inventory_pass(&self) -> ControllerResult<SchedulePassReport> {
        let tag = &self.config.target_tag;
        let eligible = self.selector.select_eligible_buckets(&tag.key, &tag.value).await?;

        let mut pending = BTreeSet::new();
        let mut skipped = Vec::new();
        for bucket in eligible {
            if self.ledger.is_bucket_enforced(&bucket).await? {
                skipped.push(bucket);
            } else {
                pending.insert(bucket);
            }
        }

        let mut report = self.scheduler.configure_all(&pending).await?;
        report.skipped = skipped;
        if !report.is_clean() {
            warn!(failures = report.failures.len(), "inventory pass finished with failures");
        }
        Ok(report)
    }

    /// Let the next pass inventory `bucket` again.
    pub async fn rearm_bucket(&self, bucket: &BucketId) -> ControllerResult<bool> {
        let cleared = self.ledger.rearm_bucket(bucket).await?;
        info!(bucket = %bucket, cleared, "re-armed bucket");
        Ok(cleared)
    }

    pub async fn ledger_entry_for_job(&self, job_id: &JobId) -> ControllerResult<Option<LedgerEntry>> {
        self.ledger.find_by_job(job_id).await
    }
}
