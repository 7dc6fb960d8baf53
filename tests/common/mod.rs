#![allow(dead_code)]

use bucket_encryptor::{
    config::ControllerConfig,
    db,
    models::bucket::{EncryptionStatus, Tag},
    state::AppState,
};
use bytes::Bytes;
use futures::stream;
use std::{collections::HashMap, io};
use tempfile::TempDir;

pub const KMS_KEY: &str = "1232d31d-8f2b-4e4b-9c7e-0a1b2c3d4e5f";
pub const TARGET_TAG: (&str, &str) = ("__S3Inventory_EnforceSSE", "true");

/// A controller wired to a local fleet in a fresh temp directory.
pub struct Harness {
    pub state: AppState,
    _dir: TempDir,
}

pub async fn harness(overrides: &[(&str, &str)]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("meta/encryptor.db").display());
    let pool = db::connect(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();

    let mut params: HashMap<String, String> = [
        ("KmsKey", KMS_KEY),
        ("S3InvReportsBucket", "inv-reports"),
        ("S3BatchReportsBucket", "batch-reports"),
        ("DeploymentRegion", "eu-central-1"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in overrides {
        params.insert(k.to_string(), v.to_string());
    }
    let config = ControllerConfig::from_lookup(|key| params.get(key).cloned()).unwrap();

    let state = AppState::build(pool, dir.path().join("objects"), config);
    for name in ["inv-reports", "batch-reports"] {
        state
            .fleet
            .store
            .create_bucket(name, "eu-central-1", &[], None)
            .await
            .unwrap();
    }
    Harness { state, _dir: dir }
}

impl Harness {
    pub async fn bucket(&self, name: &str, region: &str, tags: &[(&str, &str)]) {
        let tags: Vec<Tag> = tags.iter().map(|(k, v)| Tag::new(*k, *v)).collect();
        self.state
            .fleet
            .store
            .create_bucket(name, region, &tags, None)
            .await
            .unwrap();
    }

    pub async fn bucket_with_default(&self, name: &str, tags: &[(&str, &str)], default: EncryptionStatus) {
        let tags: Vec<Tag> = tags.iter().map(|(k, v)| Tag::new(*k, *v)).collect();
        self.state
            .fleet
            .store
            .create_bucket(name, "eu-central-1", &tags, Some(default))
            .await
            .unwrap();
    }

    pub async fn object(&self, bucket: &str, key: &str, body: &'static [u8]) {
        let body = stream::once(async move { Ok::<_, io::Error>(Bytes::from_static(body)) });
        self.state
            .fleet
            .store
            .upload_object_stream(bucket, key, body)
            .await
            .unwrap();
    }
}
