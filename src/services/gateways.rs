//! Contracts for the external systems the controller drives.
//!
//! The controller never talks to storage, the batch service or the catalog
//! directly; it goes through these traits so each component can be built
//! against the local fleet backend or any other implementation.

use crate::{
    errors::ControllerResult,
    models::{
        bucket::{Bucket, BucketId},
        inventory::InventoryConfiguration,
        job::{JobId, JobRequest},
        manifest::ObjectLocation,
        partition::CatalogPartition,
    },
};
use async_trait::async_trait;
use bytes::Bytes;

/// Bucket metadata, inventory configuration and object access.
#[async_trait]
pub trait StorageGateway: Send + Sync + 'static {
    /// Every bucket visible to the controller, with its tag set.
    async fn list_buckets(&self) -> ControllerResult<Vec<Bucket>>;

    /// Returns `None` when the bucket has no configuration with this id.
    async fn get_inventory_configuration(
        &self,
        bucket: &BucketId,
        report_name: &str,
    ) -> ControllerResult<Option<InventoryConfiguration>>;

    async fn list_inventory_configurations(
        &self,
        bucket: &BucketId,
    ) -> ControllerResult<Vec<InventoryConfiguration>>;

    /// Creates or replaces the configuration identified by
    /// `(config.bucket, config.report_name)`.
    async fn put_inventory_configuration(
        &self,
        config: &InventoryConfiguration,
    ) -> ControllerResult<()>;

    /// Returns `false` when there was nothing to delete.
    async fn delete_inventory_configuration(
        &self,
        bucket: &BucketId,
        report_name: &str,
    ) -> ControllerResult<bool>;

    /// Reads an entire object. Missing objects are `ControllerError::NotFound`.
    async fn get_object(&self, location: &ObjectLocation) -> ControllerResult<Bytes>;

    /// Writes an object and returns its ETag.
    async fn put_object(&self, location: &ObjectLocation, data: Bytes) -> ControllerResult<String>;
}

/// The asynchronous batch-processing service.
#[async_trait]
pub trait BatchService: Send + Sync + 'static {
    /// Creates a job. Reusing `request.client_request_token` returns the job
    /// created for the first request instead of a new one.
    async fn create_job(&self, request: &JobRequest) -> ControllerResult<JobId>;
}

/// The data catalog that makes manifests queryable.
#[async_trait]
pub trait CatalogService: Send + Sync + 'static {
    /// Registers a partition. Returns `false` when an identical partition
    /// already exists.
    async fn add_partition(&self, partition: &CatalogPartition) -> ControllerResult<bool>;
}
