//! Local directory backend.
//!
//! The container is a directory on disk. Blocks are staged under
//! `.uncommitted/<upload-id>/` and the commit concatenates them into a temp
//! file which is fsynced and atomically renamed into place, so a reader
//! never sees a partial backup. Staging directories left behind by failed
//! uploads are pruned by `ensure_container` once they go stale.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use kvbackup_common::backend::{BackendError, ObjectEntry, StagedBlock, StorageBackend, UploadSession};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

const NAME: &str = "directory";
const STAGING_DIR: &str = ".uncommitted";
/// Staging directories untouched for this long belong to abandoned uploads.
const STALE_STAGING_AGE: Duration = Duration::from_secs(24 * 60 * 60);

pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full_path(&self, key: &str) -> PathBuf {
        // Prevent path traversal
        let key = key.trim_start_matches('/').replace("..", "");
        self.root.join(key)
    }

    fn staging_path(&self, session: &UploadSession) -> Result<PathBuf, BackendError> {
        let upload_id = session.upload_id.as_deref().ok_or_else(|| BackendError::Rejected {
            backend: NAME,
            status: 400,
            message: format!("upload session for {} has no upload id", session.key),
        })?;
        Ok(self.root.join(STAGING_DIR).join(upload_id))
    }

    /// Remove staging directories not modified within `max_age`. Returns the
    /// number removed.
    pub async fn prune_staging(&self, max_age: Duration) -> Result<usize, BackendError> {
        let staging = self.root.join(STAGING_DIR);
        let mut read_dir = match tokio::fs::read_dir(&staging).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_err(e)),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = read_dir.next_entry().await.map_err(io_err)? {
            let meta = entry.metadata().await.map_err(io_err)?;
            if !meta.is_dir() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age >= max_age {
                tokio::fs::remove_dir_all(entry.path()).await.map_err(io_err)?;
                debug!(path = %entry.path().display(), "Removed stale staging directory");
                removed += 1;
            }
        }

        if removed > 0 {
            info!(root = %self.root.display(), removed, "Pruned abandoned uploads");
        }
        Ok(removed)
    }
}

fn io_err(source: std::io::Error) -> BackendError {
    BackendError::Io {
        backend: NAME,
        source,
    }
}

fn block_file_name(block_id: &str) -> String {
    urlencoding::encode(block_id).into_owned()
}

/// Join path components below `root` with `/`, the key separator.
fn key_for(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

#[async_trait]
impl StorageBackend for DirectoryBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn max_block_size(&self) -> usize {
        usize::MAX
    }

    async fn ensure_container(&self) -> Result<(), BackendError> {
        tokio::fs::create_dir_all(&self.root).await.map_err(io_err)?;
        if let Err(e) = self.prune_staging(STALE_STAGING_AGE).await {
            warn!(root = %self.root.display(), error = %e, "Failed to prune staging directories");
        }
        Ok(())
    }

    async fn container_exists(&self) -> Result<bool, BackendError> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(e)),
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, BackendError> {
        // Start the walk at the last complete directory of the prefix, then
        // filter on the full prefix string.
        let prefix = prefix.trim_start_matches('/');
        let dir_part = match prefix.rfind('/') {
            Some(pos) => &prefix[..pos],
            None => "",
        };
        let search_dir = self.full_path(dir_part);

        let mut entries = Vec::new();
        if !tokio::fs::try_exists(&search_dir).await.map_err(io_err)? {
            return Ok(entries);
        }

        let staging = self.root.join(STAGING_DIR);
        let mut stack = vec![search_dir];
        while let Some(dir) = stack.pop() {
            let mut read_dir = tokio::fs::read_dir(&dir).await.map_err(io_err)?;

            while let Some(entry) = read_dir.next_entry().await.map_err(io_err)? {
                let path = entry.path();
                let meta = entry.metadata().await.map_err(io_err)?;

                if meta.is_dir() {
                    if path != staging {
                        stack.push(path);
                    }
                } else if meta.is_file() {
                    if let Some(key) = key_for(&self.root, &path) {
                        if key.starts_with(prefix) {
                            entries.push(ObjectEntry {
                                key,
                                size: meta.len(),
                            });
                        }
                    }
                }
            }
        }

        Ok(entries)
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let path = self.full_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }
        debug!(key = %key, "Directory delete complete");
        Ok(())
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<(), BackendError> {
        let src = self.full_path(source_key);
        let dest = self.full_path(dest_key);
        if !tokio::fs::try_exists(&src).await.map_err(io_err)? {
            return Err(BackendError::NotFound {
                backend: NAME,
                key: source_key.to_string(),
            });
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::copy(&src, &dest).await.map_err(io_err)?;
        Ok(())
    }

    async fn begin_upload(&self, key: &str) -> Result<UploadSession, BackendError> {
        let session = UploadSession {
            key: key.to_string(),
            upload_id: Some(Uuid::new_v4().to_string()),
        };
        tokio::fs::create_dir_all(self.staging_path(&session)?)
            .await
            .map_err(io_err)?;
        Ok(session)
    }

    async fn put_block(
        &self,
        session: &UploadSession,
        index: usize,
        block_id: &str,
        data: Bytes,
    ) -> Result<StagedBlock, BackendError> {
        let path = self.staging_path(session)?.join(block_file_name(block_id));
        tokio::fs::write(&path, &data).await.map_err(io_err)?;
        Ok(StagedBlock {
            index,
            block_id: block_id.to_string(),
            size: data.len(),
            receipt: None,
        })
    }

    async fn commit_blocks(
        &self,
        session: &UploadSession,
        blocks: &[StagedBlock],
    ) -> Result<u64, BackendError> {
        let staging = self.staging_path(session)?;
        let dest = self.full_path(&session.key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        // Assemble inside the staging directory so listings never see it.
        let tmp_path = staging.join("commit.tmp");
        let mut out = tokio::fs::File::create(&tmp_path).await.map_err(io_err)?;
        for block in blocks {
            let mut part = tokio::fs::File::open(staging.join(block_file_name(&block.block_id)))
                .await
                .map_err(io_err)?;
            tokio::io::copy(&mut part, &mut out).await.map_err(io_err)?;
        }
        out.flush().await.map_err(io_err)?;
        out.sync_all().await.map_err(io_err)?;
        drop(out);

        // Atomic rename
        tokio::fs::rename(&tmp_path, &dest).await.map_err(io_err)?;
        tokio::fs::remove_dir_all(&staging).await.map_err(io_err)?;

        let size = tokio::fs::metadata(&dest).await.map_err(io_err)?.len();
        debug!(key = %session.key, blocks = blocks.len(), size, "Directory commit complete");
        Ok(size)
    }
}
