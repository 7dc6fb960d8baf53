//! Local inventory generation: snapshots every configured bucket into its
//! destination the way the managed inventory feature does.

use super::fleet_store::FleetStore;
use crate::{
    errors::ControllerResult,
    models::{
        event::StorageEvent,
        inventory::InventoryConfiguration,
        manifest::{ObjectLocation, url_encode},
        object::ObjectRecord,
    },
    services::{
        gateways::StorageGateway,
        manifest_reader::{INVENTORY_MANIFEST_VERSION, InventoryFileDoc, InventoryManifestDoc, write_csv},
    },
};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::{Compression, write::GzEncoder};
use std::io::Write;
use tracing::info;
use uuid::Uuid;

/// Folder name format of a delivery, e.g. `2024-03-01T00-00Z`.
const DELIVERY_FOLDER_FORMAT: &str = "%Y-%m-%dT%H-%MZ";

#[derive(Clone)]
pub struct LocalInventoryGenerator {
    store: FleetStore,
    /// Notification id fired when a manifest lands.
    event_id: String,
}

impl LocalInventoryGenerator {
    pub fn new(store: FleetStore, event_id: impl Into<String>) -> Self {
        Self {
            store,
            event_id: event_id.into(),
        }
    }

    /// Deliver one report for every configuration in the fleet.
    pub async fn run(&self, now: DateTime<Utc>) -> ControllerResult<Vec<StorageEvent>> {
        let configs = self.store.all_inventory_configurations().await?;
        let mut events = Vec::with_capacity(configs.len());
        for config in &configs {
            events.push(self.deliver(config, now).await?);
        }
        Ok(events)
    }

    pub async fn deliver(&self, config: &InventoryConfiguration, now: DateTime<Utc>) -> ControllerResult<StorageEvent> {
        let objects = self.store.list_objects(config.bucket.as_str()).await?;
        let schema = schema_for(config);
        let base = format!("{}/{}", config.bucket, config.report_name);

        let mut files = Vec::new();
        if !objects.is_empty() {
            let csv = write_csv(objects.iter().map(|object| inventory_record(object, &schema)))?;
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&csv)?;
            let body = Bytes::from(encoder.finish()?);
            let size = body.len() as u64;
            let location = ObjectLocation::new(
                config.destination_bucket.clone(),
                format!("{}/data/{}.csv.gz", base, Uuid::new_v4()),
            );
            let md5 = self.store.put_object(&location, body).await?;
            files.push(InventoryFileDoc {
                key: location.key,
                size,
                md5_checksum: Some(md5),
            });
        }

        let doc = InventoryManifestDoc {
            source_bucket: config.bucket.to_string(),
            destination_bucket: format!("arn:aws:s3:::{}", config.destination_bucket),
            version: INVENTORY_MANIFEST_VERSION.to_string(),
            creation_timestamp: now.timestamp_millis().to_string(),
            file_format: "CSV".to_string(),
            file_schema: schema.join(", "),
            files,
        };
        let manifest = ObjectLocation::new(
            config.destination_bucket.clone(),
            format!("{}/{}/manifest.json", base, now.format(DELIVERY_FOLDER_FORMAT)),
        );
        self.store
            .put_object(&manifest, Bytes::from(serde_json::to_vec(&doc)?))
            .await?;

        info!(
            bucket = %config.bucket,
            report_name = %config.report_name,
            objects = objects.len(),
            manifest = %manifest,
            "delivered inventory report"
        );
        Ok(StorageEvent::new(self.event_id.clone(), manifest))
    }
}

/// `Bucket, Key, VersionId` followed by the configured optional fields
/// this generator knows how to fill.
fn schema_for(config: &InventoryConfiguration) -> Vec<&'static str> {
    let mut schema = vec!["Bucket", "Key", "VersionId"];
    for field in ["Size", "LastModifiedDate", "EncryptionStatus"] {
        if config.optional_fields.iter().any(|f| f == field) {
            schema.push(field);
        }
    }
    schema
}

fn inventory_record(object: &ObjectRecord, schema: &[&str]) -> Vec<String> {
    schema
        .iter()
        .map(|column| match *column {
            "Bucket" => object.bucket.to_string(),
            "Key" => url_encode(&object.key),
            "VersionId" => object.version_id.clone().unwrap_or_default(),
            "Size" => object.size_bytes.to_string(),
            "LastModifiedDate" => object.last_modified.to_rfc3339_opts(SecondsFormat::Millis, true),
            "EncryptionStatus" => object.encryption.as_str().to_string(),
            _ => String::new(),
        })
        .collect()
}
