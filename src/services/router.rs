//! Dispatch of "manifest delivered" notifications.

use super::{
    gateways::CatalogService,
    launcher::{BatchJobLauncher, LaunchOutcome},
    manifest_reader::ManifestReader,
    reconciler::{JobCompletionReconciler, ReconcileOutcome},
    retry::RetryPolicy,
};
use crate::{
    config::ControllerConfig,
    errors::ControllerResult,
    models::{
        event::StorageEvent,
        manifest::{InventoryManifest, ObjectLocation},
        partition::{CatalogPartition, CatalogTable},
    },
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "handler", rename_all = "snake_case")]
pub enum RouteOutcome {
    Inventory { outcome: LaunchOutcome },
    BatchReport { outcome: ReconcileOutcome },
    /// No handler is registered for the event identifier.
    Ignored { event_id: String },
}

#[derive(Clone)]
pub struct ManifestEventRouter {
    reader: ManifestReader,
    launcher: BatchJobLauncher,
    reconciler: JobCompletionReconciler,
    catalog: Arc<dyn CatalogService>,
    config: Arc<ControllerConfig>,
    retry: RetryPolicy,
}

impl ManifestEventRouter {
    pub fn new(
        reader: ManifestReader,
        launcher: BatchJobLauncher,
        reconciler: JobCompletionReconciler,
        catalog: Arc<dyn CatalogService>,
        config: Arc<ControllerConfig>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            reader,
            launcher,
            reconciler,
            catalog,
            config,
            retry,
        }
    }

    /// Route on the notification's event identifier. Makes no assumption
    /// about the order events for one bucket arrive in.
    pub async fn route(&self, event: &StorageEvent) -> ControllerResult<RouteOutcome> {
        if event.event_id == self.config.inventory_event_id {
            debug!(manifest = %event.manifest, "routing inventory manifest");
            let manifest = self.reader.read_inventory(&event.manifest).await?;
            self.register_inventory(&manifest).await?;
            let outcome = self.launcher.launch(&manifest).await?;
            Ok(RouteOutcome::Inventory { outcome })
        } else if event.event_id == self.config.batch_event_id {
            debug!(manifest = %event.manifest, "routing batch report");
            let report = self.reader.read_batch_report(&event.manifest).await?;
            let outcome = self.reconciler.reconcile(&report).await?;
            Ok(RouteOutcome::BatchReport { outcome })
        } else {
            warn!(
                event_id = %event.event_id,
                bucket = %event.bucket,
                manifest = %event.manifest,
                "no handler for event, dropping"
            );
            Ok(RouteOutcome::Ignored {
                event_id: event.event_id.clone(),
            })
        }
    }

    /// Register the inventory manifest's dated folder in the inventory table.
    /// Delivery folders only resolve to the minute, so the generation millis
    /// keep one partition per manifest.
    async fn register_inventory(&self, manifest: &InventoryManifest) -> ControllerResult<()> {
        let folder = ObjectLocation::new(
            manifest.identity.location.bucket.clone(),
            manifest.identity.location.parent_prefix(),
        );
        let partition = CatalogPartition::dated(
            &self.config.database_name,
            self.config.table_name(CatalogTable::Inventory),
            manifest.identity.generated_at,
            folder,
        )
        .with_value("bucket", manifest.source_bucket.as_str())
        .with_value("generated", manifest.identity.generated_at.timestamp_millis().to_string());
        let created = self
            .retry
            .run("add_partition", |_| self.catalog.add_partition(&partition))
            .await?;
        if created {
            info!(
                bucket = %manifest.source_bucket,
                partition = %partition.spec(),
                "registered inventory partition"
            );
        }
        Ok(())
    }
}
