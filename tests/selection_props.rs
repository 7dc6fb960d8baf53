use bucket_encryptor::{
    models::bucket::{Bucket, BucketId, Tag},
    services::selector::filter_eligible,
};
use chrono::Utc;
use proptest::prelude::*;

fn tag_strategy() -> impl Strategy<Value = Tag> {
    (
        prop_oneof![Just("Env"), Just("env"), Just("__S3Inventory_EnforceSSE")],
        prop_oneof![Just("true"), Just("True"), Just("false"), Just("")],
    )
        .prop_map(|(k, v)| Tag::new(k, v))
}

fn fleet_strategy() -> impl Strategy<Value = Vec<Bucket>> {
    prop::collection::vec(prop::collection::vec(tag_strategy(), 0..4), 0..12).prop_map(|tag_sets| {
        tag_sets
            .into_iter()
            .enumerate()
            .map(|(i, tags)| Bucket {
                name: BucketId::new(format!("bucket-{:02}", i)),
                region: "eu-central-1".into(),
                tags,
                default_encryption: None,
                created_at: Utc::now(),
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn selects_exactly_the_buckets_carrying_the_tag(fleet in fleet_strategy()) {
        let selected = filter_eligible(&fleet, "__S3Inventory_EnforceSSE", "true");
        for bucket in &fleet {
            let tagged = bucket
                .tags
                .iter()
                .any(|t| t.key == "__S3Inventory_EnforceSSE" && t.value == "true");
            prop_assert_eq!(selected.contains(&bucket.name), tagged);
        }
        prop_assert!(selected.len() <= fleet.len());
    }

    #[test]
    fn selection_ignores_fleet_order(fleet in fleet_strategy()) {
        let mut reversed = fleet.clone();
        reversed.reverse();
        prop_assert_eq!(
            filter_eligible(&fleet, "Env", "true"),
            filter_eligible(&reversed, "Env", "true")
        );
    }
}
