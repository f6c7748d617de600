//! Chunked upload engine.
//!
//! Streams a snapshot into a backend as a sequence of blocks, holding at
//! most one chunk in memory, then commits the ordered block list. Nothing
//! becomes visible unless every block succeeded and the commit succeeded.

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use kvbackup_common::backend::{StagedBlock, StorageBackend};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::BackupError;

pub const DEFAULT_CHUNK_SIZE: usize = 100 * 1024 * 1024;
/// First allocation of the chunk buffer; it doubles from here up to the limit.
const READ_STEP: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct UploadSummary {
    pub key: String,
    /// Blocks in commit order.
    pub blocks: Vec<StagedBlock>,
    pub bytes_read: u64,
    /// Size reported by the backend after commit.
    pub committed_size: u64,
}

/// A fresh block id: a random UUID, base64 encoded. All ids have the same
/// length, which block-list stores require within one blob.
pub fn new_block_id() -> String {
    base64::engine::general_purpose::STANDARD.encode(Uuid::new_v4().as_bytes())
}

/// Upload `reader` to `key` in chunks of at most `chunk_size` bytes (further
/// capped by the backend's block limit).
pub async fn upload_stream<R>(
    backend: &dyn StorageBackend,
    key: &str,
    reader: &mut R,
    chunk_size: usize,
) -> Result<UploadSummary, BackupError>
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    let limit = chunk_size.min(backend.max_block_size());
    if limit == 0 {
        return Err(BackupError::Config("chunk size must be greater than zero".to_string()));
    }

    let session = backend.begin_upload(key).await?;
    let mut blocks: Vec<StagedBlock> = Vec::new();
    let mut bytes_read = 0u64;
    let mut buf = BytesMut::new();

    while let Some(chunk) = read_chunk(reader, &mut buf, limit).await.map_err(BackupError::Snapshot)? {
        let index = blocks.len();
        let block_id = new_block_id();
        let len = chunk.len();
        bytes_read += len as u64;

        match backend.put_block(&session, index, &block_id, chunk).await {
            Ok(staged) => {
                debug!(key = %key, index, size = len, "Block uploaded");
                blocks.push(staged);
            }
            Err(e) => {
                warn!(key = %key, index, error = %e, "Block upload failed, abandoning upload");
                return Err(BackupError::UploadIncomplete {
                    key: key.to_string(),
                    block_index: index,
                    source: e,
                });
            }
        }
    }

    let committed_size = backend.commit_blocks(&session, &blocks).await.map_err(|e| {
        warn!(key = %key, blocks = blocks.len(), error = %e, "Block list commit failed");
        BackupError::Backend(e)
    })?;

    info!(
        key = %key,
        backend = backend.name(),
        blocks = blocks.len(),
        bytes = bytes_read,
        "Upload committed"
    );

    Ok(UploadSummary {
        key: key.to_string(),
        blocks,
        bytes_read,
        committed_size,
    })
}

/// Fill up to `limit` bytes from `reader` into `buf`, growing it only as
/// data arrives. Returns `None` once the stream is exhausted, so an empty
/// trailing chunk is never produced.
async fn read_chunk<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    limit: usize,
) -> std::io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    buf.clear();
    while buf.len() < limit {
        let remaining = limit - buf.len();
        if buf.capacity() <= buf.len() {
            buf.reserve(remaining.min(buf.len().max(READ_STEP)));
        }
        let n = reader.read_buf(&mut (&mut *buf).limit(remaining)).await?;
        if n == 0 {
            break;
        }
    }
    if buf.is_empty() {
        return Ok(None);
    }
    Ok(Some(buf.split().freeze()))
}
