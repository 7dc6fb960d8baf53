//! Inventory scheduling: make sure every selected bucket produces a
//! recurring inventory report into the reports bucket.

use super::{gateways::StorageGateway, retry::RetryPolicy};
use crate::{
    config::ControllerConfig,
    errors::{ControllerError, ControllerResult},
    models::{bucket::BucketId, inventory::InventoryConfiguration},
};
use futures::{StreamExt, stream};
use serde::Serialize;
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsureOutcome {
    Created,
    AlreadyPresent,
}

/// A bucket whose configuration could not be ensured during a pass.
#[derive(Debug, Clone, Serialize)]
pub struct BucketFailure {
    pub bucket: BucketId,
    pub kind: &'static str,
    pub error: String,
}

/// Result of one pass over the selected buckets.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SchedulePassReport {
    pub created: Vec<BucketId>,
    pub unchanged: Vec<BucketId>,
    /// Buckets left alone because their chain already completed.
    pub skipped: Vec<BucketId>,
    pub failures: Vec<BucketFailure>,
}

impl SchedulePassReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone)]
pub struct InventoryScheduler {
    storage: Arc<dyn StorageGateway>,
    config: Arc<ControllerConfig>,
    retry: RetryPolicy,
}

impl InventoryScheduler {
    pub fn new(storage: Arc<dyn StorageGateway>, config: Arc<ControllerConfig>, retry: RetryPolicy) -> Self {
        Self {
            storage,
            config,
            retry,
        }
    }

    /// Install the inventory configuration `report_name` on `bucket` unless
    /// one with that id already exists. An existing configuration is never
    /// modified.
    pub async fn ensure_inventory_configured(
        &self,
        bucket: &BucketId,
        report_name: &str,
        destination_bucket: &BucketId,
    ) -> ControllerResult<EnsureOutcome> {
        if let Some(existing) = self
            .retry
            .run("get_inventory_configuration", |_| {
                self.storage.get_inventory_configuration(bucket, report_name)
            })
            .await?
        {
            debug!(
                bucket = %bucket,
                report_name,
                destination = %existing.destination_bucket,
                "inventory configuration already present"
            );
            return Ok(EnsureOutcome::AlreadyPresent);
        }

        let config = InventoryConfiguration::new(
            bucket.clone(),
            report_name,
            destination_bucket.clone(),
            self.config.inventory_frequency,
        );
        self.retry
            .run("put_inventory_configuration", |_| {
                self.storage.put_inventory_configuration(&config)
            })
            .await?;
        info!(
            bucket = %bucket,
            report_name,
            destination = %destination_bucket,
            frequency = %config.frequency,
            notification = %self.config.inventory_event_id,
            "created inventory configuration"
        );
        Ok(EnsureOutcome::Created)
    }

    /// Ensure the configured inventory on every bucket, at most
    /// `scan_concurrency` at a time. A bucket's failure is recorded in the
    /// report and does not stop the others; only configuration errors abort
    /// the pass.
    pub async fn configure_all(&self, buckets: &BTreeSet<BucketId>) -> ControllerResult<SchedulePassReport> {
        let report_name = self.config.inventory_name.as_str();
        let destination = &self.config.inventory_reports_bucket;

        let results: Vec<(BucketId, ControllerResult<EnsureOutcome>)> = stream::iter(buckets.iter().cloned())
            .map(|bucket| async move {
                let outcome = self
                    .ensure_inventory_configured(&bucket, report_name, destination)
                    .await;
                (bucket, outcome)
            })
            .buffer_unordered(self.config.scan_concurrency.max(1))
            .collect()
            .await;

        let mut report = SchedulePassReport::default();
        for (bucket, outcome) in results {
            match outcome {
                Ok(EnsureOutcome::Created) => report.created.push(bucket),
                Ok(EnsureOutcome::AlreadyPresent) => report.unchanged.push(bucket),
                Err(err @ ControllerError::Configuration(_)) => return Err(err),
                Err(err) => {
                    warn!(bucket = %bucket, kind = err.kind(), error = %err, "could not configure inventory");
                    report.failures.push(BucketFailure {
                        bucket,
                        kind: err.kind(),
                        error: err.to_string(),
                    });
                }
            }
        }
        report.created.sort();
        report.unchanged.sort();
        report.failures.sort_by(|a, b| a.bucket.cmp(&b.bucket));

        info!(
            created = report.created.len(),
            unchanged = report.unchanged.len(),
            failed = report.failures.len(),
            "inventory scheduling pass finished"
        );
        Ok(report)
    }
}
