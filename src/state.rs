//! Shared application state: the controller wired to the local fleet.

use crate::{
    config::ControllerConfig,
    errors::ControllerResult,
    models::{event::StorageEvent, manifest::ObjectLocation},
    services::{
        controller::{Controller, InvocationOutcome},
        gateways::{BatchService, CatalogService, StorageGateway},
        launcher::BatchJobLauncher,
        ledger::ManifestLedger,
        local::LocalFleet,
        manifest_reader::ManifestReader,
        reconciler::JobCompletionReconciler,
        retry::RetryPolicy,
        router::ManifestEventRouter,
        scheduler::InventoryScheduler,
        selector::TargetSelector,
    },
};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
    pub fleet: LocalFleet,
    pub db: Arc<SqlitePool>,
    pub storage_dir: PathBuf,
}

/// Result of feeding one locally generated event to the controller.
#[derive(Debug, Serialize)]
pub struct Delivery {
    pub event_id: String,
    pub manifest: ObjectLocation,
    pub result: DeliveryResult,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum DeliveryResult {
    Outcome(InvocationOutcome),
    Error { error: String, kind: &'static str },
}

impl AppState {
    /// Wire every component against the local fleet backend.
    pub fn build(db: Arc<SqlitePool>, storage_dir: impl Into<PathBuf>, config: ControllerConfig) -> Self {
        let storage_dir = storage_dir.into();
        let config = Arc::new(config);
        let fleet = LocalFleet::new(db.clone(), storage_dir.clone(), &config);

        let storage: Arc<dyn StorageGateway> = fleet.store.clone();
        let batch: Arc<dyn BatchService> = fleet.batch.clone();
        let catalog: Arc<dyn CatalogService> = fleet.catalog.clone();
        let retry = RetryPolicy::new(config.max_submit_attempts);
        // A claim older than one invocation budget belongs to a dead worker.
        let ledger = ManifestLedger::new(db.clone(), config.invocation_timeout);

        let launcher = BatchJobLauncher::new(
            batch,
            storage.clone(),
            ledger.clone(),
            config.clone(),
            retry,
        );
        let reconciler = JobCompletionReconciler::new(
            storage.clone(),
            catalog.clone(),
            ledger.clone(),
            config.clone(),
            retry,
        );
        let router = ManifestEventRouter::new(
            ManifestReader::new(storage.clone()),
            launcher,
            reconciler,
            catalog,
            config.clone(),
            retry,
        );
        let controller = Controller::new(
            config.clone(),
            TargetSelector::new(storage.clone()),
            InventoryScheduler::new(storage, config, retry),
            router,
            ledger,
        );

        Self {
            controller: Arc::new(controller),
            fleet,
            db,
            storage_dir,
        }
    }

    /// Deliver a report for every configured inventory and route the
    /// resulting manifest events.
    pub async fn run_inventory_cycle(&self) -> ControllerResult<Vec<Delivery>> {
        let events = self.fleet.inventory.run(Utc::now()).await?;
        Ok(self.deliver(events).await)
    }

    /// Run every submitted batch job and route the completion reports.
    pub async fn run_job_cycle(&self) -> ControllerResult<Vec<Delivery>> {
        let events = self.fleet.batch.run_pending().await?;
        Ok(self.deliver(events).await)
    }

    /// Hand events to the controller one by one. A hard failure is logged
    /// and does not stop the remaining events.
    pub async fn deliver(&self, events: Vec<StorageEvent>) -> Vec<Delivery> {
        let mut deliveries = Vec::with_capacity(events.len());
        for event in events {
            let result = match self.controller.handle_event(&event).await {
                Ok(outcome) => DeliveryResult::Outcome(outcome),
                Err(err) => {
                    error!(manifest = %event.manifest, error = %err, "event delivery failed");
                    DeliveryResult::Error {
                        kind: err.kind(),
                        error: err.to_string(),
                    }
                }
            };
            deliveries.push(Delivery {
                event_id: event.event_id,
                manifest: event.manifest,
                result,
            });
        }
        deliveries
    }
}
