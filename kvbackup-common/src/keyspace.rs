//! Storage key layout for backup artifacts.
//!
//! Every artifact lives at `v1/<prefix>/<backup-id>`. The namespace version
//! is reserved for future format migrations; the prefix scopes one cluster
//! (or tenant) within a shared container. Backup ids are fixed-width UTC
//! timestamps, so lexical order is chronological order.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::backend::{BackendError, StorageBackend};

pub const NAMESPACE_VERSION: &str = "v1";

/// A logical backup as seen through a [`KeySpace`]: the id relative to the
/// prefix and the stored size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub id: String,
    pub size: u64,
}

/// How `copy_from` names the copied artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyMode {
    /// Keep the source backup ids (and therefore their original timestamps).
    #[default]
    PreserveIds,
    /// Assign fresh ids at copy time, keeping the source's relative order.
    Regenerate,
}

/// Build a sortable backup id for the given instant.
pub fn backup_id_at(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%S%.6fZ").to_string()
}

pub fn new_backup_id() -> String {
    backup_id_at(Utc::now())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The backend listing prefix. Always ends with `/` so that `foo` can
    /// never match `foobar`.
    pub fn list_prefix(&self) -> String {
        if self.prefix.is_empty() {
            format!("{}/", NAMESPACE_VERSION)
        } else {
            format!("{}/{}/", NAMESPACE_VERSION, self.prefix)
        }
    }

    pub fn object_key(&self, backup_id: &str) -> String {
        format!("{}{}", self.list_prefix(), backup_id.trim_start_matches('/'))
    }

    /// Strip namespace and prefix from a full storage key. Returns `None` for
    /// keys outside this key space, including keys under nested prefixes:
    /// backup ids never contain `/`.
    pub fn relative_id<'a>(&self, key: &'a str) -> Option<&'a str> {
        let list_prefix = self.list_prefix();
        key.strip_prefix(list_prefix.as_str())
            .filter(|id| !id.is_empty() && !id.contains('/'))
    }

    /// List the backups under this prefix, oldest first.
    pub async fn list(
        &self,
        backend: &dyn StorageBackend,
    ) -> Result<Vec<BackupEntry>, BackendError> {
        let objects = backend.list_objects(&self.list_prefix()).await?;
        // Backends are free to return extra keys or any order; re-filter and sort.
        let mut entries: Vec<BackupEntry> = objects
            .into_iter()
            .filter_map(|obj| {
                self.relative_id(&obj.key).map(|id| BackupEntry {
                    id: id.to_string(),
                    size: obj.size,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    pub async fn total_size(&self, backend: &dyn StorageBackend) -> Result<u64, BackendError> {
        Ok(self.list(backend).await?.iter().map(|e| e.size).sum())
    }

    /// Copy every backup under `source` into this key space. Returns the new
    /// backup ids in source order.
    pub async fn copy_from(
        &self,
        backend: &dyn StorageBackend,
        source: &KeySpace,
        mode: CopyMode,
    ) -> Result<Vec<String>, BackendError> {
        if source == self {
            debug!(prefix = %self.prefix, "Copy source equals destination, nothing to do");
            return Ok(Vec::new());
        }

        let entries = source.list(backend).await?;
        let batch = new_backup_id();
        let mut copied = Vec::with_capacity(entries.len());

        for (i, entry) in entries.iter().enumerate() {
            let dest_id = match mode {
                CopyMode::PreserveIds => entry.id.clone(),
                CopyMode::Regenerate => format!("{}-{:04}", batch, i),
            };
            let from = source.object_key(&entry.id);
            let to = self.object_key(&dest_id);
            backend.copy(&from, &to).await?;
            debug!(from = %from, to = %to, "Copied backup");
            copied.push(dest_id);
        }

        Ok(copied)
    }
}
