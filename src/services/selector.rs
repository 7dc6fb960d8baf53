//! Target selection: which buckets opted in to encryption enforcement.

use super::gateways::StorageGateway;
use crate::{
    errors::ControllerResult,
    models::bucket::{Bucket, BucketId},
};
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, info};

#[derive(Clone)]
pub struct TargetSelector {
    storage: Arc<dyn StorageGateway>,
}

impl TargetSelector {
    pub fn new(storage: Arc<dyn StorageGateway>) -> Self {
        Self { storage }
    }

    /// Every bucket whose tag set has exactly `tag_key = tag_value`.
    ///
    /// Recomputed from the live tag sets on each call.
    pub async fn select_eligible_buckets(
        &self,
        tag_key: &str,
        tag_value: &str,
    ) -> ControllerResult<BTreeSet<BucketId>> {
        let buckets = self.storage.list_buckets().await?;
        let selected = filter_eligible(&buckets, tag_key, tag_value);
        info!(
            tag_key,
            tag_value,
            total = buckets.len(),
            selected = selected.len(),
            "selected eligible buckets"
        );
        Ok(selected)
    }
}

/// Exact key + value filter. Case-sensitive on both sides.
pub fn filter_eligible<'a, I>(buckets: I, tag_key: &str, tag_value: &str) -> BTreeSet<BucketId>
where
    I: IntoIterator<Item = &'a Bucket>,
{
    buckets
        .into_iter()
        .filter(|bucket| {
            let keep = bucket.has_tag(tag_key, tag_value);
            if !keep {
                debug!(bucket = %bucket.name, "bucket not tagged for enforcement");
            }
            keep
        })
        .map(|bucket| bucket.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{MemoryStorage, bucket};

    #[tokio::test]
    async fn selects_only_exact_tag_matches() {
        let storage = Arc::new(MemoryStorage::with_buckets(vec![
            bucket("data-1", "eu-central-1", &[("__S3Inventory_EnforceSSE", "true")]),
            bucket("data-2", "eu-central-1", &[("__S3Inventory_EnforceSSE", "True")]),
            bucket("data-3", "eu-central-1", &[("__s3inventory_enforcesse", "true")]),
            bucket("data-4", "eu-central-1", &[]),
            bucket(
                "data-5",
                "eu-central-1",
                &[("team", "core"), ("__S3Inventory_EnforceSSE", "true")],
            ),
        ]));
        let selector = TargetSelector::new(storage);
        let selected = selector
            .select_eligible_buckets("__S3Inventory_EnforceSSE", "true")
            .await
            .unwrap();
        let names: Vec<_> = selected.iter().map(BucketId::as_str).collect();
        assert_eq!(names, vec!["data-1", "data-5"]);
    }

    #[test]
    fn empty_fleet_selects_nothing() {
        assert!(filter_eligible(&Vec::<Bucket>::new(), "k", "v").is_empty());
    }
}
