//! Inbound storage notifications.
//!
//! Two payload shapes are accepted: the storage service's notification
//! envelope (`Records[]`) and a flat single-event form used by internal
//! callers and the local runners.

use super::{
    bucket::BucketId,
    manifest::{ObjectLocation, url_decode},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// "A manifest was delivered" notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEvent {
    /// Notification configuration id; selects the handler.
    pub event_id: String,
    pub manifest: ObjectLocation,
    /// Bucket the notification fired on.
    pub bucket: BucketId,
    pub timestamp: DateTime<Utc>,
}

impl StorageEvent {
    pub fn new(event_id: impl Into<String>, manifest: ObjectLocation) -> Self {
        let bucket = manifest.bucket.clone();
        Self {
            event_id: event_id.into(),
            manifest,
            bucket,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Notification(Notification),
    Flat(FlatEvent),
}

impl EventPayload {
    /// Flatten into individual events. Records without an object key are
    /// dropped.
    pub fn into_events(self) -> Vec<StorageEvent> {
        match self {
            Self::Flat(flat) => vec![flat.into()],
            Self::Notification(n) => n
                .records
                .into_iter()
                .filter(|r| !r.s3.object.key.is_empty())
                .map(|r| {
                    let bucket = BucketId::new(r.s3.bucket.name);
                    StorageEvent {
                        event_id: r.s3.configuration_id,
                        manifest: ObjectLocation::new(bucket.clone(), url_decode(&r.s3.object.key)),
                        bucket,
                        timestamp: r.event_time,
                    }
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Notification {
    #[serde(rename = "Records")]
    pub records: Vec<NotificationRecord>,
}

#[derive(Debug, Deserialize)]
pub struct NotificationRecord {
    #[serde(rename = "eventTime")]
    pub event_time: DateTime<Utc>,
    pub s3: NotificationEntity,
}

#[derive(Debug, Deserialize)]
pub struct NotificationEntity {
    #[serde(rename = "configurationId")]
    pub configuration_id: String,
    pub bucket: NotificationBucket,
    pub object: NotificationObject,
}

#[derive(Debug, Deserialize)]
pub struct NotificationBucket {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct NotificationObject {
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct FlatEvent {
    #[serde(rename = "eventIdentifier")]
    pub event_identifier: String,
    #[serde(rename = "manifestLocation")]
    pub manifest_location: ManifestLocationField,
    pub bucket: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// `manifestLocation` as either an `s3://` URI or a `{bucket, key}` object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ManifestLocationField {
    Uri(String),
    Location(ObjectLocation),
}

impl From<FlatEvent> for StorageEvent {
    fn from(flat: FlatEvent) -> Self {
        let manifest = match flat.manifest_location {
            ManifestLocationField::Location(loc) => loc,
            ManifestLocationField::Uri(uri) => ObjectLocation::parse_uri(&uri)
                // An unparseable URI still routes; the reader reports it as
                // a malformed manifest.
                .unwrap_or_else(|| ObjectLocation::new("", uri)),
        };
        let bucket = flat
            .bucket
            .map(BucketId::new)
            .unwrap_or_else(|| manifest.bucket.clone());
        Self {
            event_id: flat.event_identifier,
            manifest,
            bucket,
            timestamp: flat.timestamp.unwrap_or_else(Utc::now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_notification_envelope() {
        let body = r#"{
            "Records": [{
                "eventVersion": "2.1",
                "eventSource": "aws:s3",
                "eventTime": "2024-03-01T00:05:00.000Z",
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "configurationId": "InvManifestUploadedEventNotification",
                    "bucket": { "name": "inv-reports" },
                    "object": { "key": "data-1/ObjectEncryptionInventoryReport/2024-03-01T00-00Z/manifest.json", "size": 512 }
                }
            }]
        }"#;
        let payload: EventPayload = serde_json::from_str(body).unwrap();
        let events = payload.into_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, "InvManifestUploadedEventNotification");
        assert_eq!(events[0].bucket.as_str(), "inv-reports");
        assert!(events[0].manifest.key.ends_with("/manifest.json"));
    }

    #[test]
    fn parses_flat_event_with_uri() {
        let body = r#"{
            "eventIdentifier": "BatchManifestUploadedEventNotification",
            "manifestLocation": "s3://batch-reports/reports/job-1/manifest.json"
        }"#;
        let payload: EventPayload = serde_json::from_str(body).unwrap();
        let events = payload.into_events();
        assert_eq!(events[0].bucket.as_str(), "batch-reports");
        assert_eq!(events[0].manifest.key, "reports/job-1/manifest.json");
    }
}
