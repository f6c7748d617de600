//! In-memory storage backend.
//!
//! Holds objects in a `BTreeMap` and supports fault injection (failing a
//! given block, failing deletes of given keys, failing the next N calls).
//! Used as the test double for the upload, retention and scheduling code.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use bytes::{Bytes, BytesMut};

use crate::backend::{BackendError, ObjectEntry, StagedBlock, StorageBackend, UploadSession};

const NAME: &str = "memory";

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    size: u64,
}

#[derive(Default)]
struct State {
    container_exists: bool,
    objects: BTreeMap<String, StoredObject>,
    staged: HashMap<String, HashMap<String, (Bytes, usize)>>,
    commits: Vec<(String, Vec<String>)>,
    deleted: Vec<String>,
    calls: usize,
}

#[derive(Default)]
struct Faults {
    fail_block_at: Option<usize>,
    fail_delete_keys: HashSet<String>,
    fail_next_calls: usize,
    reverse_listing: bool,
    retain_data: bool,
}

pub struct MemoryBackend {
    max_block_size: usize,
    state: Mutex<State>,
    faults: Mutex<Faults>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            max_block_size: usize::MAX,
            state: Mutex::new(State::default()),
            faults: Mutex::new(Faults {
                retain_data: true,
                ..Faults::default()
            }),
        }
    }

    pub fn with_max_block_size(mut self, max: usize) -> Self {
        self.max_block_size = max;
        self
    }

    pub fn insert_object(&self, key: &str, data: Bytes) {
        let mut state = self.state.lock().unwrap();
        state.container_exists = true;
        let size = data.len() as u64;
        state.objects.insert(key.to_string(), StoredObject { data, size });
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state.lock().unwrap().objects.get(key).map(|o| o.data.clone())
    }

    pub fn object_size(&self, key: &str) -> Option<u64> {
        self.state.lock().unwrap().objects.get(key).map(|o| o.size)
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().unwrap().objects.keys().cloned().collect()
    }

    /// Every successful commit so far: object key and block ids in commit order.
    pub fn commits(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().commits.clone()
    }

    /// Keys removed by `delete`, in call order.
    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    /// Number of blocks staged but never committed for `key`.
    pub fn uncommitted_blocks(&self, key: &str) -> usize {
        self.state.lock().unwrap().staged.get(key).map_or(0, |b| b.len())
    }

    /// Total number of backend calls made.
    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    pub fn fail_block_at(&self, index: usize) {
        self.faults.lock().unwrap().fail_block_at = Some(index);
    }

    pub fn fail_delete(&self, key: &str) {
        self.faults.lock().unwrap().fail_delete_keys.insert(key.to_string());
    }

    /// Make the next `n` calls fail with `BackendError::Unavailable`.
    pub fn fail_next_calls(&self, n: usize) {
        self.faults.lock().unwrap().fail_next_calls = n;
    }

    /// Return listings in reverse key order.
    pub fn set_reverse_listing(&self, reverse: bool) {
        self.faults.lock().unwrap().reverse_listing = reverse;
    }

    /// Keep only block and object sizes, dropping payload bytes.
    pub fn set_retain_data(&self, retain: bool) {
        self.faults.lock().unwrap().retain_data = retain;
    }

    fn enter(&self, op: &str) -> Result<(), BackendError> {
        self.state.lock().unwrap().calls += 1;
        let mut faults = self.faults.lock().unwrap();
        if faults.fail_next_calls > 0 {
            faults.fail_next_calls -= 1;
            return Err(BackendError::Unavailable {
                backend: NAME,
                message: format!("injected failure in {}", op),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    async fn ensure_container(&self) -> Result<(), BackendError> {
        self.enter("ensure_container")?;
        self.state.lock().unwrap().container_exists = true;
        Ok(())
    }

    async fn container_exists(&self) -> Result<bool, BackendError> {
        self.enter("container_exists")?;
        Ok(self.state.lock().unwrap().container_exists)
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, BackendError> {
        self.enter("list_objects")?;
        let mut entries: Vec<ObjectEntry> = self
            .state
            .lock()
            .unwrap()
            .objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| ObjectEntry {
                key: k.clone(),
                size: o.size,
            })
            .collect();
        if self.faults.lock().unwrap().reverse_listing {
            entries.reverse();
        }
        Ok(entries)
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.enter("delete")?;
        if self.faults.lock().unwrap().fail_delete_keys.contains(key) {
            return Err(BackendError::Unavailable {
                backend: NAME,
                message: format!("injected delete failure for {}", key),
            });
        }
        let mut state = self.state.lock().unwrap();
        state.objects.remove(key);
        state.deleted.push(key.to_string());
        Ok(())
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<(), BackendError> {
        self.enter("copy")?;
        let mut state = self.state.lock().unwrap();
        let obj = state
            .objects
            .get(source_key)
            .cloned()
            .ok_or_else(|| BackendError::NotFound {
                backend: NAME,
                key: source_key.to_string(),
            })?;
        state.objects.insert(dest_key.to_string(), obj);
        Ok(())
    }

    async fn begin_upload(&self, key: &str) -> Result<UploadSession, BackendError> {
        self.enter("begin_upload")?;
        Ok(UploadSession {
            key: key.to_string(),
            upload_id: None,
        })
    }

    async fn put_block(
        &self,
        session: &UploadSession,
        index: usize,
        block_id: &str,
        data: Bytes,
    ) -> Result<StagedBlock, BackendError> {
        self.enter("put_block")?;
        if self.faults.lock().unwrap().fail_block_at == Some(index) {
            return Err(BackendError::Unavailable {
                backend: NAME,
                message: format!("injected failure for block {}", index),
            });
        }
        if data.len() > self.max_block_size {
            return Err(BackendError::Rejected {
                backend: NAME,
                status: 413,
                message: format!("block of {} bytes exceeds limit", data.len()),
            });
        }
        let size = data.len();
        let stored = if self.faults.lock().unwrap().retain_data {
            data
        } else {
            Bytes::new()
        };
        self.state
            .lock()
            .unwrap()
            .staged
            .entry(session.key.clone())
            .or_default()
            .insert(block_id.to_string(), (stored, size));
        Ok(StagedBlock {
            index,
            block_id: block_id.to_string(),
            size,
            receipt: None,
        })
    }

    async fn commit_blocks(
        &self,
        session: &UploadSession,
        blocks: &[StagedBlock],
    ) -> Result<u64, BackendError> {
        self.enter("commit_blocks")?;
        let mut state = self.state.lock().unwrap();
        let staged = state.staged.remove(&session.key).unwrap_or_default();

        let mut data = BytesMut::new();
        let mut size = 0u64;
        for block in blocks {
            let (bytes, len) = staged.get(&block.block_id).ok_or_else(|| BackendError::Rejected {
                backend: NAME,
                status: 400,
                message: format!("block {} was never staged", block.block_id),
            })?;
            data.extend_from_slice(bytes);
            size += *len as u64;
        }

        state.objects.insert(
            session.key.clone(),
            StoredObject {
                data: data.freeze(),
                size,
            },
        );
        state.commits.push((
            session.key.clone(),
            blocks.iter().map(|b| b.block_id.clone()).collect(),
        ));
        Ok(size)
    }
}
