//! Routes backup specs to backends and owns the active schedules.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kvbackup_common::backend::StorageBackend;
use kvbackup_common::documents::{BackupSchedule, BackupSpec, BackupStatus};
use kvbackup_common::keyspace::{new_backup_id, KeySpace};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend;
use crate::config::{AgentConfig, RetryConfig};
use crate::error::BackupError;
use crate::purge::purge;
use crate::schedule::{
    recurring_interval, run_once, spawn_schedule, BackupJob, CycleStatus, ScheduleRegistry,
    ScheduleState, ScheduleStatus,
};
use crate::snapshot::{self, SnapshotSource};
use crate::upload::upload_stream;

/// Exponential backoff with jitter for retryable cycle failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Upper bound of the wait before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// A wait drawn uniformly from the upper half of `backoff(retry)`.
    pub fn jittered(&self, retry: u32) -> Duration {
        let cap = self.backoff(retry);
        if cap.is_zero() {
            return cap;
        }
        let millis = cap.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Everything one backup needs to run a cycle.
pub struct BackupRunner {
    name: String,
    backend: Arc<dyn StorageBackend>,
    snapshot: Box<dyn SnapshotSource>,
    keyspace: KeySpace,
    max_backups: i64,
    chunk_size: usize,
    retry: RetryPolicy,
}

impl BackupRunner {
    pub fn new(
        name: &str,
        backend: Arc<dyn StorageBackend>,
        snapshot: Box<dyn SnapshotSource>,
        keyspace: KeySpace,
        max_backups: i64,
        chunk_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name: name.to_string(),
            backend,
            snapshot,
            keyspace,
            max_backups,
            chunk_size,
            retry,
        }
    }

    pub fn keyspace(&self) -> &KeySpace {
        &self.keyspace
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    /// One attempt: container, snapshot, upload, then retention.
    async fn attempt(&self) -> Result<BackupStatus, BackupError> {
        self.backend.ensure_container().await?;

        let mut snapshot = self.snapshot.open().await?;
        let key = self.keyspace.object_key(&new_backup_id());
        let summary = upload_stream(
            self.backend.as_ref(),
            &key,
            &mut snapshot.reader,
            self.chunk_size,
        )
        .await?;
        info!(
            backup = %self.name,
            backend = self.backend.name(),
            key = %summary.key,
            size = summary.committed_size,
            blocks = summary.blocks.len(),
            revision = ?snapshot.revision,
            "Backup uploaded"
        );

        // The backup itself is durable at this point; a purge failure is
        // reported but does not fail the cycle.
        let (purged, purge_error) =
            match purge(self.backend.as_ref(), &self.keyspace, self.max_backups).await {
                Ok(report) => (report.deleted, None),
                Err(e) => {
                    let deleted = match &e {
                        BackupError::PurgePartial { deleted, .. } => deleted.clone(),
                        _ => Vec::new(),
                    };
                    (deleted, Some(e.to_string()))
                }
            };
        if let Some(e) = &purge_error {
            warn!(backup = %self.name, error = %e, "Retention purge incomplete");
        }

        Ok(BackupStatus {
            backup_key: summary.key,
            size: summary.committed_size,
            blocks: summary.blocks.len(),
            succeeded_at: Utc::now(),
            purged,
            purge_error,
        })
    }
}

#[async_trait]
impl BackupJob for BackupRunner {
    async fn run_cycle(&self) -> Result<BackupStatus, BackupError> {
        let mut attempt = 1;
        loop {
            match self.attempt().await {
                Ok(status) => return Ok(status),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let wait = self.retry.jittered(attempt);
                    warn!(
                        backup = %self.name,
                        attempt,
                        error = %e,
                        wait_ms = wait.as_millis() as u64,
                        "Backup attempt failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Owns the shared HTTP client, the root cancellation token and the
/// registry of active schedules.
pub struct Dispatcher {
    client: reqwest::Client,
    min_interval: Duration,
    cycle_timeout: Duration,
    chunk_size: usize,
    retry: RetryPolicy,
    root: CancellationToken,
    registry: ScheduleRegistry,
}

impl Dispatcher {
    pub fn new(config: &AgentConfig) -> Result<Self, BackupError> {
        Ok(Self {
            client: backend::http_client()?,
            min_interval: config.min_backup_interval(),
            cycle_timeout: config.cycle_timeout(),
            chunk_size: config.chunk_size(),
            retry: RetryPolicy::from(&config.retry),
            root: CancellationToken::new(),
            registry: ScheduleRegistry::new(),
        })
    }

    /// Resolve the backend for `spec` and build its runner. Unknown storage
    /// types and incomplete sections are `Config` errors.
    pub fn runner(&self, spec: &BackupSpec) -> Result<BackupRunner, BackupError> {
        let backend = backend::from_spec(spec, self.client.clone(), self.chunk_size)?;
        let keyspace = KeySpace::new(spec.prefix().unwrap_or_default());
        Ok(BackupRunner::new(
            &spec.name,
            Arc::from(backend),
            snapshot::from_spec(&spec.snapshot),
            keyspace,
            spec.max_backups(),
            self.chunk_size,
            self.retry.clone(),
        ))
    }

    /// Handle one backup spec: run it once, or activate its schedule.
    /// Returns the outcome of the first cycle either way.
    pub async fn handle(&mut self, spec: &BackupSpec) -> Result<CycleStatus, BackupError> {
        let runner = self.runner(spec)?;
        Ok(self
            .handle_job(&spec.name, Arc::new(runner), spec.backup_schedule.as_ref())
            .await)
    }

    pub async fn handle_job(
        &mut self,
        name: &str,
        job: Arc<dyn BackupJob>,
        schedule: Option<&BackupSchedule>,
    ) -> CycleStatus {
        let Some(interval) = recurring_interval(schedule, self.min_interval) else {
            info!(backup = %name, "Running one-shot backup");
            if let Some(prev) = self.registry.remove(name) {
                prev.stop().await;
            }
            return run_once(job.as_ref(), self.cycle_timeout).await;
        };

        let handle = spawn_schedule(
            name,
            job,
            interval,
            self.cycle_timeout,
            self.root.child_token(),
        );
        let mut status = handle.subscribe();
        if let Some(prev) = self.registry.insert(handle) {
            debug!(backup = %name, "Replacing existing schedule");
            prev.stop().await;
        }

        let first = status
            .wait_for(|s| s.cycles > 0 || s.state == ScheduleState::Stopped)
            .await
            .ok()
            .and_then(|s| s.last.clone());
        first.unwrap_or_else(|| CycleStatus::Failed {
            at: Utc::now(),
            kind: "cancelled",
            message: format!("schedule {} stopped before its first cycle", name),
        })
    }

    pub fn status(&self, name: &str) -> Option<ScheduleStatus> {
        self.registry.get(name).map(|h| h.status())
    }

    pub fn schedules(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Stop and forget one schedule.
    pub async fn deactivate(&mut self, name: &str) -> bool {
        match self.registry.remove(name) {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    /// Cancel every schedule and wait for them to finish.
    pub async fn shutdown(&mut self) {
        info!(schedules = self.registry.len(), "Shutting down backup schedules");
        self.root.cancel();
        self.registry.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::FileSnapshot;
    use kvbackup_common::documents::{DirectorySource, SnapshotSpec};
    use kvbackup_common::memory::MemoryBackend;

    fn snapshot_file(dir: &tempfile::TempDir, data: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("snapshot.db");
        std::fs::write(&path, data).unwrap();
        path
    }

    fn runner(
        backend: Arc<MemoryBackend>,
        path: &std::path::Path,
        max_backups: i64,
        retry: RetryPolicy,
    ) -> BackupRunner {
        BackupRunner::new(
            "prod",
            backend,
            Box::new(FileSnapshot::new(path)),
            KeySpace::new("clusters/prod"),
            max_backups,
            4,
            retry,
        )
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(3),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(3));
        assert_eq!(policy.backoff(40), Duration::from_secs(3));

        for _ in 0..20 {
            let wait = policy.jittered(2);
            assert!(wait >= Duration::from_millis(500) && wait <= Duration::from_secs(1));
        }
        assert_eq!(RetryPolicy::none().jittered(1), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_cycle_uploads_and_purges() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_file(&dir, b"0123456789");
        let backend = Arc::new(MemoryBackend::new());
        let runner = runner(backend.clone(), &path, 2, RetryPolicy::none());

        let mut keys = Vec::new();
        for _ in 0..3 {
            let status = runner.run_cycle().await.unwrap();
            assert_eq!(status.size, 10);
            assert_eq!(status.blocks, 3);
            assert!(status.backup_key.starts_with("v1/clusters/prod/"));
            keys.push(status.backup_key);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(backend.deleted(), vec![keys[0].clone()]);
        let left = runner.keyspace().list(runner.backend()).await.unwrap();
        assert_eq!(left.len(), 2);
        assert_eq!(backend.object(&keys[2]).unwrap().as_ref(), b"0123456789");
    }

    #[tokio::test]
    async fn test_retry_on_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_file(&dir, b"abc");
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next_calls(2);

        let status = runner(backend.clone(), &path, 0, fast_retry(3))
            .run_cycle()
            .await
            .unwrap();
        assert_eq!(status.size, 3);
        assert_eq!(backend.object_count(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_file(&dir, b"abc");
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next_calls(100);

        let err = runner(backend.clone(), &path, 0, fast_retry(3))
            .run_cycle()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "backend_unavailable");
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_failed_block_commits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_file(&dir, b"0123456789");
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_block_at(1);

        let err = runner(backend.clone(), &path, 0, RetryPolicy::none())
            .run_cycle()
            .await
            .unwrap_err();
        match err {
            BackupError::UploadIncomplete { block_index, .. } => assert_eq!(block_index, 1),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(backend.object_count(), 0);
    }

    #[tokio::test]
    async fn test_purge_failure_does_not_fail_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_file(&dir, b"abc");
        let backend = Arc::new(MemoryBackend::new());
        let old = "v1/clusters/prod/20000101T000000.000000Z";
        backend.insert_object(old, bytes::Bytes::from_static(b"old"));
        backend.fail_delete(old);

        let status = runner(backend.clone(), &path, 1, RetryPolicy::none())
            .run_cycle()
            .await
            .unwrap();
        assert!(status.purged.is_empty());
        assert!(status.purge_error.unwrap().starts_with("purge incomplete"));
        assert_eq!(backend.object_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_snapshot_fails_cycle() {
        let backend = Arc::new(MemoryBackend::new());
        let err = runner(backend.clone(), std::path::Path::new("/nonexistent/snap.db"), 0, RetryPolicy::none())
            .run_cycle()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "snapshot");
        assert_eq!(backend.object_count(), 0);
    }

    fn directory_spec(dir: &tempfile::TempDir, storage_type: &str, schedule: Option<BackupSchedule>) -> BackupSpec {
        BackupSpec {
            name: "dev".to_string(),
            storage_type: storage_type.to_string(),
            abs: None,
            s3: None,
            directory: Some(DirectorySource {
                path: dir.path().join("store"),
                prefix: "dev".to_string(),
            }),
            backup_schedule: schedule,
            snapshot: SnapshotSpec::File {
                path: snapshot_file(dir, b"snapshot"),
            },
        }
    }

    #[tokio::test]
    async fn test_unknown_storage_type_fails_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = Dispatcher::new(&AgentConfig::default()).unwrap();
        let err = dispatcher
            .handle(&directory_spec(&dir, "GCS", None))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
        assert!(dispatcher.schedules().is_empty());
    }

    #[tokio::test]
    async fn test_one_shot_directory_backup() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = Dispatcher::new(&AgentConfig::default()).unwrap();
        let spec = directory_spec(
            &dir,
            "Directory",
            Some(BackupSchedule {
                backup_interval_in_second: 60,
                max_backups: 0,
            }),
        );

        let status = dispatcher.handle(&spec).await.unwrap();
        match status {
            CycleStatus::Succeeded { backup, .. } => {
                let stored = std::fs::read(dir.path().join("store").join(&backup.backup_key)).unwrap();
                assert_eq!(stored, b"snapshot");
            }
            other => panic!("unexpected status: {:?}", other),
        }
        assert!(dispatcher.schedules().is_empty());
        assert!(dispatcher.status("dev").is_none());
    }

    #[tokio::test]
    async fn test_scheduled_backup_registers_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = Dispatcher::new(&AgentConfig::default()).unwrap();
        let spec = directory_spec(
            &dir,
            "directory",
            Some(BackupSchedule {
                backup_interval_in_second: 3600,
                max_backups: 3,
            }),
        );

        let first = dispatcher.handle(&spec).await.unwrap();
        assert!(first.is_success());
        assert_eq!(dispatcher.schedules(), vec!["dev"]);
        let status = dispatcher.status("dev").unwrap();
        assert_eq!(status.cycles, 1);
        assert_eq!(status.interval, Duration::from_secs(3600));

        dispatcher.shutdown().await;
        assert!(dispatcher.schedules().is_empty());
    }

    #[tokio::test]
    async fn test_deactivate() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_file(&dir, b"x");
        let mut dispatcher = Dispatcher::new(&AgentConfig::default()).unwrap();
        let job = Arc::new(runner(Arc::new(MemoryBackend::new()), &path, 2, RetryPolicy::none()));
        let schedule = BackupSchedule {
            backup_interval_in_second: 30,
            max_backups: 2,
        };

        dispatcher.handle_job("prod", job, Some(&schedule)).await;
        assert!(dispatcher.deactivate("prod").await);
        assert!(!dispatcher.deactivate("prod").await);
    }
}
