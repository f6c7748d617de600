use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Backup Spec ──

/// Declarative description of one backup: where to store it, how often,
/// how many to keep, and where the snapshot bytes come from.
///
/// `storage_type` is kept as a string and resolved at dispatch time so an
/// unknown type surfaces as a configuration error for that backup instead
/// of a parse failure for the whole document set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupSpec {
    pub name: String,
    pub storage_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abs: Option<AbsSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<DirectorySource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_schedule: Option<BackupSchedule>,
    pub snapshot: SnapshotSpec,
}

impl BackupSpec {
    /// The logical key prefix configured for the selected storage type.
    pub fn prefix(&self) -> Option<&str> {
        match self.storage_type.parse::<StorageType>().ok()? {
            StorageType::Abs => self.abs.as_ref().map(|s| s.prefix.as_str()),
            StorageType::S3 => self.s3.as_ref().map(|s| s.prefix.as_str()),
            StorageType::Directory => self.directory.as_ref().map(|s| s.prefix.as_str()),
        }
    }

    pub fn max_backups(&self) -> i64 {
        self.backup_schedule.as_ref().map_or(0, |s| s.max_backups)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Abs,
    S3,
    Directory,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown storage type: {0}")]
pub struct UnknownStorageType(pub String);

impl FromStr for StorageType {
    type Err = UnknownStorageType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abs" => Ok(StorageType::Abs),
            "s3" => Ok(StorageType::S3),
            "directory" => Ok(StorageType::Directory),
            _ => Err(UnknownStorageType(s.to_string())),
        }
    }
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageType::Abs => write!(f, "ABS"),
            StorageType::S3 => write!(f, "S3"),
            StorageType::Directory => write!(f, "Directory"),
        }
    }
}

/// Azure-Blob-style block blob store. Either `account_key` or `sas_token`
/// must be present (directly or through the environment).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AbsSource {
    pub container: String,
    pub account_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sas_token: Option<String>,
    #[serde(default)]
    pub prefix: String,
    /// Override for the blob service URL (emulators, sovereign clouds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct S3Source {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectorySource {
    pub path: PathBuf,
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupSchedule {
    /// Seconds between backups. Negative disables the recurring schedule.
    #[serde(default)]
    pub backup_interval_in_second: i64,
    /// Number of backups to retain. Zero makes the backup one-shot.
    #[serde(default)]
    pub max_backups: i64,
}

// ── Snapshot Source ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotSpec {
    /// A snapshot file already written by the cluster tooling.
    File { path: PathBuf },
    /// A command whose stdout is the snapshot stream. `endpoints` is passed
    /// to the command as `KVBACKUP_ENDPOINTS` (comma separated).
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        endpoints: Vec<String>,
    },
}

// ── Backup Status ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupStatus {
    pub backup_key: String,
    pub size: u64,
    pub blocks: usize,
    pub succeeded_at: DateTime<Utc>,
    #[serde(default)]
    pub purged: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purge_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_type_parse() {
        assert_eq!("ABS".parse::<StorageType>().unwrap(), StorageType::Abs);
        assert_eq!("s3".parse::<StorageType>().unwrap(), StorageType::S3);
        assert_eq!("Directory".parse::<StorageType>().unwrap(), StorageType::Directory);
        let err = "gcs".parse::<StorageType>().unwrap_err();
        assert_eq!(err.to_string(), "unknown storage type: gcs");
    }

    #[test]
    fn test_backup_spec_from_toml() {
        let spec: BackupSpec = toml::from_str(
            r#"
name = "prod"
storage_type = "ABS"

[abs]
container = "etcd-backups"
account_name = "acct"
sas_token = "sv=2019-12-12&sig=abc"
prefix = "clusters/prod"

[backup_schedule]
backup_interval_in_second = 3600
max_backups = 5

[snapshot]
kind = "command"
program = "etcdctl"
args = ["snapshot", "save", "/dev/stdout"]
endpoints = ["https://10.0.0.1:2379"]
"#,
        )
        .unwrap();

        assert_eq!(spec.prefix(), Some("clusters/prod"));
        assert_eq!(spec.max_backups(), 5);
        assert!(spec.abs.as_ref().unwrap().account_key.is_none());
        match &spec.snapshot {
            SnapshotSpec::Command { program, endpoints, .. } => {
                assert_eq!(program, "etcdctl");
                assert_eq!(endpoints.len(), 1);
            }
            other => panic!("unexpected snapshot spec: {:?}", other),
        }
    }

    #[test]
    fn test_prefix_unknown_storage_type() {
        let spec = BackupSpec {
            name: "x".to_string(),
            storage_type: "tape".to_string(),
            abs: None,
            s3: None,
            directory: None,
            backup_schedule: None,
            snapshot: SnapshotSpec::File { path: "/tmp/snap.db".into() },
        };
        assert_eq!(spec.prefix(), None);
        assert_eq!(spec.max_backups(), 0);
    }

    #[test]
    fn test_backup_status_round_trip() {
        let status = BackupStatus {
            backup_key: "v1/p/20260101T000000.000000Z".to_string(),
            size: 42,
            blocks: 1,
            succeeded_at: Utc::now(),
            purged: vec!["v1/p/old".to_string()],
            purge_error: None,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(!json.contains("purge_error"));
        let back: BackupStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
