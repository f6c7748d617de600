use std::time::Duration;

use kvbackup_common::backend::BackendError;

/// Failure of one backup cycle, or of one of its steps.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Unknown storage type, missing credentials, invalid settings. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A block failed mid-upload. Nothing was committed.
    #[error("upload of {key} incomplete: block {block_index} failed: {source}")]
    UploadIncomplete {
        key: String,
        block_index: usize,
        #[source]
        source: BackendError,
    },

    /// Retention deleted some but not all excess backups.
    #[error("purge incomplete: deleted {} backup(s), {} left: {source}", .deleted.len(), .remaining.len())]
    PurgePartial {
        deleted: Vec<String>,
        remaining: Vec<String>,
        #[source]
        source: BackendError,
    },

    #[error("snapshot source failed: {0}")]
    Snapshot(#[source] std::io::Error),

    #[error("backup cycle exceeded its {0:?} deadline")]
    Timeout(Duration),
}

impl BackupError {
    /// Stable short name for status reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::Config(_) => "config",
            BackupError::Backend(BackendError::AuthFailed { .. }) => "backend_auth_failed",
            BackupError::Backend(BackendError::Unavailable { .. }) => "backend_unavailable",
            BackupError::Backend(_) => "backend",
            BackupError::UploadIncomplete { .. } => "upload_incomplete",
            BackupError::PurgePartial { .. } => "purge_partial",
            BackupError::Snapshot(_) => "snapshot",
            BackupError::Timeout(_) => "timeout",
        }
    }

    /// Whether repeating the same cycle right away may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackupError::Backend(e) => e.is_retryable(),
            BackupError::UploadIncomplete { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}
