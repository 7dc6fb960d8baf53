//! Local data catalog: a partitions table in SQLite.

use crate::{
    errors::ControllerResult,
    models::partition::CatalogPartition,
    services::gateways::CatalogService,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct PartitionRecord {
    pub partition_spec: String,
    pub location: String,
}

#[derive(Clone)]
pub struct LocalCatalog {
    db: Arc<SqlitePool>,
}

impl LocalCatalog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn partitions(&self, database: &str, table: &str) -> ControllerResult<Vec<PartitionRecord>> {
        let rows = sqlx::query_as::<_, PartitionRecord>(
            "SELECT partition_spec, location FROM catalog_partitions
             WHERE database_name = ? AND table_name = ? ORDER BY partition_spec",
        )
        .bind(database)
        .bind(table)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl CatalogService for LocalCatalog {
    async fn add_partition(&self, partition: &CatalogPartition) -> ControllerResult<bool> {
        let spec = partition.spec();
        let result = sqlx::query(
            "INSERT INTO catalog_partitions (database_name, table_name, partition_spec, location, registered_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(database_name, table_name, partition_spec) DO NOTHING",
        )
        .bind(&partition.database)
        .bind(&partition.table)
        .bind(&spec)
        .bind(partition.location.to_string())
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        let created = result.rows_affected() == 1;
        debug!(table = %partition.table, partition = %spec, created, "add partition");
        Ok(created)
    }
}
