use crate::{
    errors::{ControllerError, ControllerResult},
    models::{
        bucket::{BucketId, EncryptionScheme, Tag},
        inventory::InventoryFrequency,
        job::ReportingLevel,
        partition::CatalogTable,
    },
};
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Seconds between selector/scheduler passes; 0 disables the timer.
    pub scan_interval_secs: u64,
    /// Seconds between local inventory/batch runner ticks; 0 disables them.
    pub runner_interval_secs: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Bucket encryption orchestration controller")]
pub struct Args {
    /// Host to bind to (overrides ENCRYPTOR_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides ENCRYPTOR_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where local fleet objects are stored (overrides ENCRYPTOR_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides ENCRYPTOR_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Seconds between inventory scheduling passes (overrides ENCRYPTOR_SCAN_INTERVAL_SECS)
    #[arg(long)]
    pub scan_interval_secs: Option<u64>,

    /// Seconds between local runner ticks (overrides ENCRYPTOR_RUNNER_INTERVAL_SECS)
    #[arg(long)]
    pub runner_interval_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("ENCRYPTOR_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_number("ENCRYPTOR_PORT", 3000u16)?;
        let env_storage =
            env::var("ENCRYPTOR_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("ENCRYPTOR_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/encryptor.db".into());
        let env_scan = env_number("ENCRYPTOR_SCAN_INTERVAL_SECS", 3600u64)?;
        let env_runner = env_number("ENCRYPTOR_RUNNER_INTERVAL_SECS", 0u64)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            scan_interval_secs: args.scan_interval_secs.unwrap_or(env_scan),
            runner_interval_secs: args.runner_interval_secs.unwrap_or(env_runner),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_number<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

/// The controller's parameter surface.
///
/// Fixed at start-up and shared immutably (behind an `Arc`) by every
/// component. Keys match the deployment's environment variable names.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// `Encrypt`: launch batch jobs for delivered inventories.
    pub encrypt: bool,
    /// `AddTag`: attach `object_tag` to each rewritten object.
    pub add_tag: bool,
    /// `ObjectTagKey` / `ObjectTagValue`.
    pub object_tag: Tag,
    /// `SSEType` + `KmsKey`.
    pub encryption: EncryptionScheme,
    /// `IsDefaultS3KMSKey`: the KMS key is the account default, so any
    /// SSE-KMS object already satisfies the target.
    pub is_default_kms_key: bool,
    /// `ReportingLevel`.
    pub reporting_level: ReportingLevel,
    /// `S3TargetTagKey` / `S3TargetTagValue`.
    pub target_tag: Tag,
    /// `DBName`.
    pub database_name: String,
    /// `TBLNameInv`.
    pub inventory_table: String,
    /// `TBLNameBatch`.
    pub batch_table: String,
    /// `S3InvReportsBucket`.
    pub inventory_reports_bucket: BucketId,
    /// `S3BatchReportsBucket`.
    pub batch_reports_bucket: BucketId,
    /// Prefix for completion reports and launcher-written manifests.
    pub report_prefix: String,
    /// `S3EventIdInv`.
    pub inventory_event_id: String,
    /// `S3EventIdBatch`.
    pub batch_event_id: String,
    /// `S3InventoriesName`.
    pub inventory_name: String,
    /// `InventoryFrequency`.
    pub inventory_frequency: InventoryFrequency,
    /// `RemoveS3InvConfig`.
    pub remove_inventory_after_success: bool,
    /// `RoleArn`: role the batch service assumes.
    pub role_arn: String,
    /// `DeploymentRegion`.
    pub region: String,
    /// `MaxSubmitAttempts`.
    pub max_submit_attempts: u32,
    /// `InvocationTimeoutSecs`.
    pub invocation_timeout: Duration,
    /// `ScanConcurrency`: per-bucket fan-out of a scheduling pass.
    pub scan_concurrency: usize,
}

impl ControllerConfig {
    /// Read the parameter surface from the process environment.
    pub fn from_env() -> ControllerResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup, applying defaults and validating.
    pub fn from_lookup<F>(lookup: F) -> ControllerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| -> String {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let flag = |key: &str, default: bool| -> ControllerResult<bool> {
            match lookup(key) {
                None => Ok(default),
                Some(v) => parse_flag(&v).ok_or_else(|| {
                    ControllerError::Configuration(format!(
                        "{} must be true/false, got `{}`",
                        key, v
                    ))
                }),
            }
        };
        let number = |key: &str, default: u64| -> ControllerResult<u64> {
            match lookup(key) {
                None => Ok(default),
                Some(v) => v.trim().parse::<u64>().map_err(|_| {
                    ControllerError::Configuration(format!("{} must be a number, got `{}`", key, v))
                }),
            }
        };

        let sse_type = text("SSEType", "SSE-KMS");
        let encryption = match sse_type.as_str() {
            "SSE-S3" | "AES256" => EncryptionScheme::SseS3,
            "SSE-KMS" | "aws:kms" => EncryptionScheme::SseKms {
                key_id: text("KmsKey", ""),
            },
            other => {
                return Err(ControllerError::Configuration(format!(
                    "SSEType must be SSE-S3 or SSE-KMS, got `{}`",
                    other
                )));
            }
        };

        let reporting_level = text("ReportingLevel", "FailedTasksOnly")
            .parse::<ReportingLevel>()
            .map_err(ControllerError::Configuration)?;
        let inventory_frequency = text("InventoryFrequency", "Daily")
            .parse::<InventoryFrequency>()
            .map_err(ControllerError::Configuration)?;

        let cfg = Self {
            encrypt: flag("Encrypt", true)?,
            add_tag: flag("AddTag", true)?,
            object_tag: Tag::new(
                text("ObjectTagKey", "__ObjectEncrypted"),
                text("ObjectTagValue", "no"),
            ),
            encryption,
            is_default_kms_key: flag("IsDefaultS3KMSKey", true)?,
            reporting_level,
            target_tag: Tag::new(
                text("S3TargetTagKey", "__S3Inventory_EnforceSSE"),
                text("S3TargetTagValue", "true"),
            ),
            database_name: text("DBName", "s3_encryptor"),
            inventory_table: text("TBLNameInv", "inventory_reports"),
            batch_table: text("TBLNameBatch", "batch_reports"),
            inventory_reports_bucket: BucketId::new(text(
                "S3InvReportsBucket",
                "s3-encryptor-inventory-reports",
            )),
            batch_reports_bucket: BucketId::new(text(
                "S3BatchReportsBucket",
                "s3-encryptor-batch-reports",
            )),
            report_prefix: text("S3BatchReportsPrefix", "reports"),
            inventory_event_id: text("S3EventIdInv", "InvManifestUploadedEventNotification"),
            batch_event_id: text("S3EventIdBatch", "BatchManifestUploadedEventNotification"),
            inventory_name: text("S3InventoriesName", "ObjectEncryptionInventoryReport"),
            inventory_frequency,
            remove_inventory_after_success: flag("RemoveS3InvConfig", true)?,
            role_arn: text("RoleArn", "arn:aws:iam::000000000000:role/EncryptorControllerRole"),
            region: text("DeploymentRegion", "eu-central-1"),
            max_submit_attempts: narrow("MaxSubmitAttempts", number("MaxSubmitAttempts", 5)?)?,
            invocation_timeout: Duration::from_secs(number("InvocationTimeoutSecs", 900)?),
            scan_concurrency: narrow("ScanConcurrency", number("ScanConcurrency", 8)?)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject parameter combinations that would misroute or mis-encrypt.
    pub fn validate(&self) -> ControllerResult<()> {
        if let EncryptionScheme::SseKms { key_id } = &self.encryption {
            if key_id.is_empty() {
                return Err(ControllerError::Configuration(
                    "KmsKey is required when SSEType is SSE-KMS".into(),
                ));
            }
        }
        if self.inventory_event_id == self.batch_event_id {
            return Err(ControllerError::Configuration(
                "S3EventIdInv and S3EventIdBatch must differ".into(),
            ));
        }
        if self.add_tag && self.object_tag.key.is_empty() {
            return Err(ControllerError::Configuration(
                "ObjectTagKey is required when AddTag is enabled".into(),
            ));
        }
        for (name, value) in [
            ("DBName", &self.database_name),
            ("TBLNameInv", &self.inventory_table),
            ("TBLNameBatch", &self.batch_table),
            ("S3InventoriesName", &self.inventory_name),
        ] {
            if value.is_empty() {
                return Err(ControllerError::Configuration(format!("{} is empty", name)));
            }
        }
        if self.max_submit_attempts == 0 {
            return Err(ControllerError::Configuration(
                "MaxSubmitAttempts must be at least 1".into(),
            ));
        }
        if self.scan_concurrency == 0 {
            return Err(ControllerError::Configuration(
                "ScanConcurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn table_name(&self, table: CatalogTable) -> &str {
        match table {
            CatalogTable::Inventory => &self.inventory_table,
            CatalogTable::BatchReport => &self.batch_table,
        }
    }
}

fn narrow<T: TryFrom<u64>>(key: &str, value: u64) -> ControllerResult<T> {
    T::try_from(value)
        .map_err(|_| ControllerError::Configuration(format!("{} is out of range, got {}", key, value)))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_follow_deployment_parameters() {
        let cfg = ControllerConfig::from_lookup(lookup(&[("KmsKey", "alias/aws/s3")])).unwrap();
        assert_eq!(cfg.target_tag, Tag::new("__S3Inventory_EnforceSSE", "true"));
        assert_eq!(cfg.object_tag, Tag::new("__ObjectEncrypted", "no"));
        assert_eq!(cfg.reporting_level, ReportingLevel::FailedTasksOnly);
        assert!(cfg.remove_inventory_after_success);
        assert_eq!(cfg.inventory_name, "ObjectEncryptionInventoryReport");
    }

    #[test]
    fn kms_without_key_is_a_configuration_error() {
        let err = ControllerConfig::from_lookup(lookup(&[("SSEType", "SSE-KMS")])).unwrap_err();
        assert!(matches!(err, ControllerError::Configuration(_)));
    }

    #[test]
    fn rejects_bad_flags_and_levels() {
        let err = ControllerConfig::from_lookup(lookup(&[("SSEType", "SSE-S3"), ("Encrypt", "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("Encrypt"));

        let err = ControllerConfig::from_lookup(lookup(&[
            ("SSEType", "SSE-S3"),
            ("ReportingLevel", "Everything"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ControllerError::Configuration(_)));
    }

    #[test]
    fn oversized_numbers_are_rejected_not_truncated() {
        let err = ControllerConfig::from_lookup(lookup(&[
            ("KmsKey", "alias/aws/s3"),
            ("MaxSubmitAttempts", "4294967297"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ControllerError::Configuration(ref m) if m.contains("MaxSubmitAttempts")));

        let cfg = ControllerConfig::from_lookup(lookup(&[
            ("KmsKey", "alias/aws/s3"),
            ("MaxSubmitAttempts", "4294967295"),
        ]))
        .unwrap();
        assert_eq!(cfg.max_submit_attempts, u32::MAX);
    }

    #[test]
    fn identical_event_ids_are_rejected() {
        let err = ControllerConfig::from_lookup(lookup(&[
            ("SSEType", "SSE-S3"),
            ("S3EventIdInv", "same"),
            ("S3EventIdBatch", "same"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn accepts_yes_no_flags() {
        let cfg = ControllerConfig::from_lookup(lookup(&[
            ("SSEType", "SSE-S3"),
            ("AddTag", "no"),
            ("RemoveS3InvConfig", "yes"),
        ]))
        .unwrap();
        assert!(!cfg.add_tag);
        assert!(cfg.remove_inventory_after_success);
        assert_eq!(cfg.encryption, EncryptionScheme::SseS3);
    }
}
