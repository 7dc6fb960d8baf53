//! In-memory collaborators for unit tests, with fault injection.

use super::{
    gateways::{BatchService, CatalogService, StorageGateway},
    ledger::ManifestLedger,
};
use crate::{
    config::ControllerConfig,
    db,
    errors::{ControllerError, ControllerResult},
    models::{
        bucket::{Bucket, BucketId, Tag},
        inventory::InventoryConfiguration,
        job::{JobId, JobRequest},
        manifest::ObjectLocation,
        partition::CatalogPartition,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;

pub fn config() -> ControllerConfig {
    config_with(&[])
}

pub fn config_with(overrides: &[(&str, &str)]) -> ControllerConfig {
    let mut vars: HashMap<String, String> = HashMap::from([
        ("KmsKey".to_string(), "1232d31d".to_string()),
        ("S3InvReportsBucket".to_string(), "inv-reports".to_string()),
        ("S3BatchReportsBucket".to_string(), "batch-reports".to_string()),
        ("RoleArn".to_string(), "arn:aws:iam::1:role/batch".to_string()),
    ]);
    for (k, v) in overrides {
        vars.insert(k.to_string(), v.to_string());
    }
    ControllerConfig::from_lookup(|name| vars.get(name).cloned()).unwrap()
}

pub async fn ledger() -> (ManifestLedger, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("controller.db").display());
    let pool = db::connect(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    (ManifestLedger::new(pool, Duration::from_secs(900)), dir)
}

pub fn bucket(name: &str, region: &str, tags: &[(&str, &str)]) -> Bucket {
    Bucket {
        name: BucketId::new(name),
        region: region.to_string(),
        tags: tags.iter().map(|(k, v)| Tag::new(*k, *v)).collect(),
        default_encryption: None,
        created_at: Utc::now(),
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    pub buckets: Mutex<Vec<Bucket>>,
    pub configs: Mutex<BTreeMap<(BucketId, String), InventoryConfiguration>>,
    pub objects: Mutex<HashMap<ObjectLocation, Bytes>>,
    /// Buckets whose inventory calls fail with a permission error.
    pub denied: Mutex<BTreeSet<BucketId>>,
    /// Number of upcoming `put_inventory_configuration` calls that fail transiently.
    pub flaky_puts: AtomicU32,
}

impl MemoryStorage {
    pub fn with_buckets(buckets: Vec<Bucket>) -> Self {
        let storage = Self::default();
        *storage.buckets.lock().unwrap() = buckets;
        storage
    }

    pub fn put(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        self.objects
            .lock()
            .unwrap()
            .insert(ObjectLocation::new(bucket, key), body.into());
    }

    pub fn config_count(&self) -> usize {
        self.configs.lock().unwrap().len()
    }

    fn check_access(&self, bucket: &BucketId) -> ControllerResult<()> {
        if self.denied.lock().unwrap().contains(bucket) {
            return Err(ControllerError::Permission {
                bucket: bucket.to_string(),
                message: "access denied".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StorageGateway for MemoryStorage {
    async fn list_buckets(&self) -> ControllerResult<Vec<Bucket>> {
        Ok(self.buckets.lock().unwrap().clone())
    }

    async fn get_inventory_configuration(
        &self,
        bucket: &BucketId,
        report_name: &str,
    ) -> ControllerResult<Option<InventoryConfiguration>> {
        self.check_access(bucket)?;
        Ok(self
            .configs
            .lock()
            .unwrap()
            .get(&(bucket.clone(), report_name.to_string()))
            .cloned())
    }

    async fn list_inventory_configurations(
        &self,
        bucket: &BucketId,
    ) -> ControllerResult<Vec<InventoryConfiguration>> {
        Ok(self
            .configs
            .lock()
            .unwrap()
            .values()
            .filter(|c| &c.bucket == bucket)
            .cloned()
            .collect())
    }

    async fn put_inventory_configuration(
        &self,
        config: &InventoryConfiguration,
    ) -> ControllerResult<()> {
        self.check_access(&config.bucket)?;
        if self
            .flaky_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ControllerError::Transient("SlowDown".into()));
        }
        self.configs.lock().unwrap().insert(
            (config.bucket.clone(), config.report_name.clone()),
            config.clone(),
        );
        Ok(())
    }

    async fn delete_inventory_configuration(
        &self,
        bucket: &BucketId,
        report_name: &str,
    ) -> ControllerResult<bool> {
        Ok(self
            .configs
            .lock()
            .unwrap()
            .remove(&(bucket.clone(), report_name.to_string()))
            .is_some())
    }

    async fn get_object(&self, location: &ObjectLocation) -> ControllerResult<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(location)
            .cloned()
            .ok_or_else(|| ControllerError::NotFound(location.to_string()))
    }

    async fn put_object(&self, location: &ObjectLocation, data: Bytes) -> ControllerResult<String> {
        let etag = format!("{:x}", md5::compute(&data));
        self.objects.lock().unwrap().insert(location.clone(), data);
        Ok(etag)
    }
}

/// Batch service that records requests and dedups on the request token.
#[derive(Default)]
pub struct MemoryBatch {
    pub jobs: Mutex<Vec<(JobId, JobRequest)>>,
    /// Number of upcoming `create_job` calls that fail transiently.
    pub flaky_submits: AtomicU32,
    pub calls: AtomicU32,
}

impl MemoryBatch {
    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

#[async_trait]
impl BatchService for MemoryBatch {
    async fn create_job(&self, request: &JobRequest) -> ControllerResult<JobId> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .flaky_submits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ControllerError::Transient("TooManyRequests".into()));
        }
        let mut jobs = self.jobs.lock().unwrap();
        if let Some((id, _)) = jobs
            .iter()
            .find(|(_, r)| r.client_request_token == request.client_request_token)
        {
            return Ok(id.clone());
        }
        let id = JobId::new(format!("job{}", jobs.len() + 1));
        jobs.push((id.clone(), request.clone()));
        Ok(id)
    }
}

#[derive(Default)]
pub struct MemoryCatalog {
    pub partitions: Mutex<Vec<CatalogPartition>>,
}

impl MemoryCatalog {
    pub fn in_table(&self, table: &str) -> Vec<CatalogPartition> {
        self.partitions
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.table == table)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CatalogService for MemoryCatalog {
    async fn add_partition(&self, partition: &CatalogPartition) -> ControllerResult<bool> {
        let mut partitions = self.partitions.lock().unwrap();
        if partitions.iter().any(|p| {
            p.database == partition.database && p.table == partition.table && p.spec() == partition.spec()
        }) {
            return Ok(false);
        }
        partitions.push(partition.clone());
        Ok(true)
    }
}

/// Shared handles to the in-memory collaborators.
pub struct Fakes {
    pub storage: Arc<MemoryStorage>,
    pub batch: Arc<MemoryBatch>,
    pub catalog: Arc<MemoryCatalog>,
}

impl Fakes {
    pub fn new(buckets: Vec<Bucket>) -> Self {
        Self {
            storage: Arc::new(MemoryStorage::with_buckets(buckets)),
            batch: Arc::new(MemoryBatch::default()),
            catalog: Arc::new(MemoryCatalog::default()),
        }
    }
}
