//! In-process stand-ins for the storage service, the batch service and the
//! data catalog, sharing one SQLite pool and one payload directory.

pub mod batch;
pub mod catalog;
pub mod fleet_store;
pub mod inventory;

use self::{
    batch::LocalBatchService, catalog::LocalCatalog, fleet_store::FleetStore,
    inventory::LocalInventoryGenerator,
};
use crate::config::ControllerConfig;
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

#[derive(Clone)]
pub struct LocalFleet {
    pub store: Arc<FleetStore>,
    pub batch: Arc<LocalBatchService>,
    pub catalog: Arc<LocalCatalog>,
    pub inventory: LocalInventoryGenerator,
}

impl LocalFleet {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>, config: &ControllerConfig) -> Self {
        let store = FleetStore::new(db.clone(), base_path, config.region.clone());
        Self {
            batch: Arc::new(LocalBatchService::new(
                db.clone(),
                store.clone(),
                config.batch_event_id.clone(),
            )),
            catalog: Arc::new(LocalCatalog::new(db)),
            inventory: LocalInventoryGenerator::new(store.clone(), config.inventory_event_id.clone()),
            store: Arc::new(store),
        }
    }
}
