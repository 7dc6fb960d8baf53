//! Catalog partitions registered for delivered manifests.

use super::manifest::ObjectLocation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hive-style partition date format shared by both tables.
pub const PARTITION_DATE_FORMAT: &str = "%Y-%m-%d-%H-%M";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogTable {
    Inventory,
    BatchReport,
}

/// A dated pointer from a manifest's storage path into a queryable table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogPartition {
    pub database: String,
    pub table: String,
    /// Ordered `(column, value)` pairs, e.g. `[("dt", "2024-03-01-00-00")]`.
    pub values: Vec<(String, String)>,
    pub location: ObjectLocation,
}

impl CatalogPartition {
    pub fn dated(
        database: impl Into<String>,
        table: impl Into<String>,
        generated_at: DateTime<Utc>,
        location: ObjectLocation,
    ) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            values: vec![(
                "dt".to_string(),
                generated_at.format(PARTITION_DATE_FORMAT).to_string(),
            )],
            location,
        }
    }

    pub fn with_value(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.push((column.into(), value.into()));
        self
    }

    /// `col=value/col=value` form used as the partition's unique key.
    pub fn spec(&self) -> String {
        self.values
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("/")
    }
}
