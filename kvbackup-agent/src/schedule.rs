//! Periodic backup schedules.
//!
//! Each active schedule is one tokio task driving a `time::interval`. The
//! first cycle runs immediately, then one cycle per tick until the
//! schedule's cancellation token fires. Ticks that fall while a cycle is
//! still running are skipped (`MissedTickBehavior::Skip`), so at most one
//! cycle per schedule is ever in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kvbackup_common::documents::{BackupSchedule, BackupStatus};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::BackupError;

/// One backup cycle: snapshot, upload, purge.
#[async_trait]
pub trait BackupJob: Send + Sync + 'static {
    async fn run_cycle(&self) -> Result<BackupStatus, BackupError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleStatus {
    Succeeded {
        at: DateTime<Utc>,
        backup: BackupStatus,
    },
    Failed {
        at: DateTime<Utc>,
        kind: &'static str,
        message: String,
    },
}

impl CycleStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, CycleStatus::Succeeded { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleStatus {
    pub state: ScheduleState,
    pub interval: Duration,
    /// Completed cycles, successful or not. Abandoned cycles are not counted.
    pub cycles: u64,
    pub failures: u64,
    pub last: Option<CycleStatus>,
}

/// The tick period for a schedule, or `None` when the backup should run
/// once instead of recurring (`max_backups == 0` or a negative interval).
/// Intervals below `floor` are raised to it.
pub fn recurring_interval(schedule: Option<&BackupSchedule>, floor: Duration) -> Option<Duration> {
    let schedule = schedule?;
    if schedule.max_backups <= 0 || schedule.backup_interval_in_second < 0 {
        return None;
    }
    let requested = Duration::from_secs(schedule.backup_interval_in_second.unsigned_abs());
    Some(requested.max(floor))
}

/// Run one cycle under `timeout` and turn its outcome into a status.
pub async fn run_once(job: &dyn BackupJob, timeout: Duration) -> CycleStatus {
    let result = match time::timeout(timeout, job.run_cycle()).await {
        Ok(result) => result,
        Err(_) => Err(BackupError::Timeout(timeout)),
    };
    match result {
        Ok(backup) => CycleStatus::Succeeded {
            at: Utc::now(),
            backup,
        },
        Err(e) => CycleStatus::Failed {
            at: Utc::now(),
            kind: e.kind(),
            message: e.to_string(),
        },
    }
}

/// A running schedule task.
pub struct ScheduleHandle {
    name: String,
    token: CancellationToken,
    task: JoinHandle<()>,
    status: watch::Receiver<ScheduleStatus>,
}

impl ScheduleHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ScheduleStatus {
        self.status.borrow().clone()
    }

    /// A receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<ScheduleStatus> {
        self.status.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel the schedule and wait for its task to exit.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!(schedule = %self.name, error = %e, "Schedule task ended abnormally");
        }
    }
}

/// Start a schedule task. `token` should be a child of the operator's root
/// token so a global shutdown reaches it.
pub fn spawn_schedule(
    name: &str,
    job: Arc<dyn BackupJob>,
    interval: Duration,
    cycle_timeout: Duration,
    token: CancellationToken,
) -> ScheduleHandle {
    let (status_tx, status_rx) = watch::channel(ScheduleStatus {
        state: ScheduleState::Idle,
        interval,
        cycles: 0,
        failures: 0,
        last: None,
    });

    let task_name = name.to_string();
    let task_token = token.clone();
    let task = tokio::spawn(async move {
        schedule_loop(&task_name, job, interval, cycle_timeout, task_token, status_tx).await;
    });

    ScheduleHandle {
        name: name.to_string(),
        token,
        task,
        status: status_rx,
    }
}

async fn schedule_loop(
    name: &str,
    job: Arc<dyn BackupJob>,
    interval: Duration,
    cycle_timeout: Duration,
    token: CancellationToken,
    status: watch::Sender<ScheduleStatus>,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(schedule = %name, interval_secs = interval.as_secs(), "Backup schedule started");

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        status.send_modify(|s| s.state = ScheduleState::Running);
        debug!(schedule = %name, "Backup cycle started");

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            cycle = run_once(job.as_ref(), cycle_timeout) => Some(cycle),
        };
        let Some(cycle) = outcome else {
            info!(schedule = %name, "Backup cycle abandoned on cancellation");
            break;
        };

        match &cycle {
            CycleStatus::Succeeded { backup, .. } => info!(
                schedule = %name,
                key = %backup.backup_key,
                size = backup.size,
                purged = backup.purged.len(),
                "Backup cycle succeeded"
            ),
            CycleStatus::Failed { kind, message, .. } => warn!(
                schedule = %name,
                kind = %kind,
                error = %message,
                "Backup cycle failed"
            ),
        }
        status.send_modify(|s| {
            s.state = ScheduleState::Idle;
            s.cycles += 1;
            if !cycle.is_success() {
                s.failures += 1;
            }
            s.last = Some(cycle);
        });
    }

    status.send_modify(|s| s.state = ScheduleState::Stopped);
    info!(schedule = %name, "Backup schedule stopped");
}

/// Active schedules keyed by backup name.
#[derive(Default)]
pub struct ScheduleRegistry {
    schedules: HashMap<String, ScheduleHandle>,
}

impl ScheduleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schedule, returning the one it replaces (already
    /// cancelled, still to be joined by the caller).
    pub fn insert(&mut self, handle: ScheduleHandle) -> Option<ScheduleHandle> {
        let previous = self.schedules.insert(handle.name().to_string(), handle);
        if let Some(prev) = &previous {
            prev.cancel();
        }
        previous
    }

    pub fn get(&self, name: &str) -> Option<&ScheduleHandle> {
        self.schedules.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<ScheduleHandle> {
        self.schedules.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schedules.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.schedules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }

    /// Cancel every schedule and wait for all of them to exit.
    pub async fn shutdown(&mut self) {
        for handle in self.schedules.values() {
            handle.cancel();
        }
        for (_, handle) in self.schedules.drain() {
            handle.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Counts cycles; optionally fails or sleeps on given cycle numbers.
    struct TestJob {
        runs: AtomicU64,
        fail_on: Vec<u64>,
        sleep_on: Mutex<HashMap<u64, Duration>>,
    }

    impl TestJob {
        fn new() -> Self {
            Self {
                runs: AtomicU64::new(0),
                fail_on: Vec::new(),
                sleep_on: Mutex::new(HashMap::new()),
            }
        }

        fn failing_on(mut self, cycle: u64) -> Self {
            self.fail_on.push(cycle);
            self
        }

        fn sleeping_on(self, cycle: u64, d: Duration) -> Self {
            self.sleep_on.lock().unwrap().insert(cycle, d);
            self
        }

        fn runs(&self) -> u64 {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackupJob for TestJob {
        async fn run_cycle(&self) -> Result<BackupStatus, BackupError> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst);
            let pause = self.sleep_on.lock().unwrap().get(&n).copied();
            if let Some(d) = pause {
                time::sleep(d).await;
            }
            if self.fail_on.contains(&n) {
                return Err(BackupError::Config(format!("cycle {} failed", n)));
            }
            Ok(BackupStatus {
                backup_key: format!("v1/test/{}", n),
                size: 1,
                blocks: 1,
                succeeded_at: Utc::now(),
                purged: Vec::new(),
                purge_error: None,
            })
        }
    }

    fn schedule(interval: i64, max_backups: i64) -> BackupSchedule {
        BackupSchedule {
            backup_interval_in_second: interval,
            max_backups,
        }
    }

    const FLOOR: Duration = Duration::from_secs(10);
    const TIMEOUT: Duration = Duration::from_secs(3600);

    #[test]
    fn test_recurring_interval() {
        assert_eq!(recurring_interval(None, FLOOR), None);
        assert_eq!(recurring_interval(Some(&schedule(60, 0)), FLOOR), None);
        assert_eq!(recurring_interval(Some(&schedule(-1, 5)), FLOOR), None);
        assert_eq!(recurring_interval(Some(&schedule(1, 5)), FLOOR), Some(FLOOR));
        assert_eq!(recurring_interval(Some(&schedule(0, 5)), FLOOR), Some(FLOOR));
        assert_eq!(
            recurring_interval(Some(&schedule(600, 5)), FLOOR),
            Some(Duration::from_secs(600))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_clamped_to_floor() {
        let job = Arc::new(TestJob::new());
        let interval = recurring_interval(Some(&schedule(1, 3)), FLOOR).unwrap();
        let handle = spawn_schedule("prod", job.clone(), interval, TIMEOUT, CancellationToken::new());

        time::sleep(Duration::from_secs(35)).await;
        // Cycles at 0s, 10s, 20s, 30s.
        assert_eq!(job.runs(), 4);
        assert_eq!(handle.status().cycles, 4);
        assert_eq!(handle.status().state, ScheduleState::Idle);

        handle.stop().await;
        assert_eq!(job.runs(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_does_not_stop_schedule() {
        let job = Arc::new(TestJob::new().failing_on(0));
        let handle = spawn_schedule("prod", job.clone(), FLOOR, TIMEOUT, CancellationToken::new());

        time::sleep(Duration::from_secs(5)).await;
        let status = handle.status();
        assert_eq!(status.failures, 1);
        match status.last {
            Some(CycleStatus::Failed { kind, message, .. }) => {
                assert_eq!(kind, "config");
                assert!(message.contains("cycle 0 failed"));
            }
            other => panic!("unexpected status: {:?}", other),
        }

        time::sleep(Duration::from_secs(10)).await;
        let status = handle.status();
        assert_eq!(status.cycles, 2);
        assert_eq!(status.failures, 1);
        assert!(status.last.unwrap().is_success());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_abandons_running_cycle() {
        let job = Arc::new(TestJob::new().sleeping_on(0, Duration::from_secs(1000)));
        let handle = spawn_schedule("prod", job.clone(), FLOOR, TIMEOUT, CancellationToken::new());

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handle.status().state, ScheduleState::Running);

        let mut status = handle.subscribe();
        let started = time::Instant::now();
        handle.cancel();
        status
            .wait_for(|s| s.state == ScheduleState::Stopped)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(status.borrow().cycles, 0);
        assert_eq!(job.runs(), 1);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_timeout_is_a_failure() {
        let job = Arc::new(TestJob::new().sleeping_on(0, Duration::from_secs(1000)));
        let handle = spawn_schedule(
            "prod",
            job.clone(),
            Duration::from_secs(60),
            Duration::from_secs(30),
            CancellationToken::new(),
        );

        time::sleep(Duration::from_secs(31)).await;
        match handle.status().last {
            Some(CycleStatus::Failed { kind, .. }) => assert_eq!(kind, "timeout"),
            other => panic!("unexpected status: {:?}", other),
        }
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_ticks_are_skipped() {
        // First cycle overruns three ticks (10s, 20s, 30s). They collapse
        // into one cycle when it finishes at 35s, then the 10s grid resumes.
        let job = Arc::new(TestJob::new().sleeping_on(0, Duration::from_secs(35)));
        let handle = spawn_schedule("prod", job.clone(), FLOOR, TIMEOUT, CancellationToken::new());

        time::sleep(Duration::from_secs(45)).await;
        assert_eq!(job.runs(), 3); // 0s, 35s, 40s
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_token_stops_children() {
        let root = CancellationToken::new();
        let mut registry = ScheduleRegistry::new();
        let a = Arc::new(TestJob::new());
        let b = Arc::new(TestJob::new());
        registry.insert(spawn_schedule("a", a.clone(), FLOOR, TIMEOUT, root.child_token()));
        registry.insert(spawn_schedule("b", b.clone(), FLOOR, TIMEOUT, root.child_token()));
        assert_eq!(registry.names(), vec!["a", "b"]);

        time::sleep(Duration::from_secs(1)).await;
        root.cancel();
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(a.runs(), 1);
        assert_eq!(b.runs(), 1);
        assert_eq!(registry.get("a").unwrap().status().state, ScheduleState::Stopped);

        registry.shutdown().await;
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_replaces_by_name() {
        let mut registry = ScheduleRegistry::new();
        let old = Arc::new(TestJob::new());
        let new = Arc::new(TestJob::new());
        registry.insert(spawn_schedule("prod", old.clone(), FLOOR, TIMEOUT, CancellationToken::new()));
        let replaced = registry
            .insert(spawn_schedule("prod", new.clone(), FLOOR, TIMEOUT, CancellationToken::new()))
            .unwrap();
        replaced.stop().await;

        time::sleep(Duration::from_secs(25)).await;
        assert_eq!(registry.len(), 1);
        assert!(old.runs() <= 1);
        assert_eq!(new.runs(), 3);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_once_success() {
        let job = TestJob::new();
        let status = run_once(&job, TIMEOUT).await;
        match status {
            CycleStatus::Succeeded { backup, .. } => assert_eq!(backup.backup_key, "v1/test/0"),
            other => panic!("unexpected status: {:?}", other),
        }
    }
}
