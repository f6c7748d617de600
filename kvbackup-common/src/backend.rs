use bytes::Bytes;

/// Errors surfaced by storage backends.
///
/// Backends never retry internally; `Unavailable` is the only kind a caller
/// should consider retrying.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{backend} unavailable: {message}")]
    Unavailable { backend: &'static str, message: String },
    #[error("{backend} rejected credentials: {message}")]
    AuthFailed { backend: &'static str, message: String },
    #[error("{backend}: object not found: {key}")]
    NotFound { backend: &'static str, key: String },
    #[error("{backend} rejected request: HTTP {status} - {message}")]
    Rejected {
        backend: &'static str,
        status: u16,
        message: String,
    },
    #[error("{backend} I/O error: {source}")]
    Io {
        backend: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Unavailable { .. })
    }

    /// Classify a non-success HTTP status from an object store.
    pub fn from_status(backend: &'static str, status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => BackendError::AuthFailed { backend, message },
            408 | 429 | 500..=599 => BackendError::Unavailable {
                backend,
                message: format!("HTTP {} - {}", status, message),
            },
            _ => BackendError::Rejected {
                backend,
                status,
                message,
            },
        }
    }
}

/// One object returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

/// An in-progress block upload for a single object key.
///
/// `upload_id` is set by backends that need a server-side session (S3
/// multipart); block-list stores leave it empty.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub key: String,
    pub upload_id: Option<String>,
}

/// A block that was uploaded but not yet committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedBlock {
    pub index: usize,
    pub block_id: String,
    pub size: usize,
    /// Backend receipt needed at commit time (S3 part ETag).
    pub receipt: Option<String>,
}

/// Trait implemented by all storage backends.
///
/// A backend is bound to one account and one container (bucket or
/// directory root). It only moves bytes: chunking, key layout, retention
/// and scheduling live above it. Listings are never cached.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Largest block this backend accepts in a single `put_block`.
    fn max_block_size(&self) -> usize;

    /// Create the container if it does not exist. "Already exists" is success.
    async fn ensure_container(&self) -> Result<(), BackendError>;

    async fn container_exists(&self) -> Result<bool, BackendError>;

    /// List every object whose key starts with `prefix`.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, BackendError>;

    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// Server-side copy within the container.
    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<(), BackendError>;

    async fn begin_upload(&self, key: &str) -> Result<UploadSession, BackendError>;

    async fn put_block(
        &self,
        session: &UploadSession,
        index: usize,
        block_id: &str,
        data: Bytes,
    ) -> Result<StagedBlock, BackendError>;

    /// Commit `blocks` in the given order as the final object. Returns the
    /// committed object size as reported by the backend.
    async fn commit_blocks(
        &self,
        session: &UploadSession,
        blocks: &[StagedBlock],
    ) -> Result<u64, BackendError>;
}
