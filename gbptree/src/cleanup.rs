//! Recovery cleanup jobs and the collectors that run them.
//!
//! Opening a tree after a crash registers a cleanup job with a
//! [`RecoveryCleanupWorkCollector`]. The collector decides when the job runs:
//! right away on [`RecoveryCleanupWorkCollector::start`], on a tokio blocking
//! thread, or never. Writers and checkpoints wait for the job through the
//! tree's [`CleanupState`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cleaner::CrashGenerationCleaner;
use crate::error::{Result, TreeError};
use crate::monitor::Monitor;

/// Where recovery cleanup of one tree stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupStatus {
    Pending,
    Done,
    /// Closed without running. The tree stays read-only.
    Abandoned,
    Failed(String),
}

/// Cleanup status shared between a tree and its cleanup job.
#[derive(Debug)]
pub struct CleanupState {
    status: Mutex<CleanupStatus>,
    changed: Condvar,
}

impl CleanupState {
    #[must_use]
    pub const fn new(status: CleanupStatus) -> Self {
        Self {
            status: Mutex::new(status),
            changed: Condvar::new(),
        }
    }

    #[must_use]
    pub fn status(&self) -> CleanupStatus {
        self.status.lock().clone()
    }

    /// Move from `Pending` to `status`. Returns `false` if the cleanup was
    /// already settled.
    pub fn settle(&self, status: CleanupStatus) -> bool {
        let mut current = self.status.lock();
        if *current != CleanupStatus::Pending {
            return false;
        }
        *current = status;
        self.changed.notify_all();
        true
    }

    /// Block while cleanup is pending. Fails unless it completed.
    pub fn wait_until_done(&self) -> Result<()> {
        let mut status = self.status.lock();
        loop {
            match &*status {
                CleanupStatus::Pending => self.changed.wait(&mut status),
                CleanupStatus::Done => return Ok(()),
                CleanupStatus::Abandoned => {
                    return Err(TreeError::IllegalState(
                        "recovery cleanup was abandoned, the tree only allows reads".to_string(),
                    ));
                }
                CleanupStatus::Failed(cause) => {
                    return Err(TreeError::IllegalState(format!(
                        "recovery cleanup failed, the tree only allows reads: {cause}"
                    )));
                }
            }
        }
    }
}

/// A unit of recovery work.
pub trait CleanupJob: Send {
    /// Whether the job still has work to do.
    fn needed(&self) -> bool;

    fn has_failed(&self) -> bool;

    fn run(&mut self) -> Result<()>;

    /// Called exactly once, whether the job ran or not.
    fn close(&mut self);
}

/// Cleans one tree after a crash.
pub struct TreeCleanupJob {
    cleaner: CrashGenerationCleaner,
    state: Arc<CleanupState>,
    monitor: Arc<dyn Monitor>,
    changed: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    failed: bool,
}

impl TreeCleanupJob {
    pub fn new(
        cleaner: CrashGenerationCleaner,
        state: Arc<CleanupState>,
        monitor: Arc<dyn Monitor>,
        changed: Arc<AtomicBool>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cleaner,
            state,
            monitor,
            changed,
            cancelled,
            failed: false,
        }
    }
}

impl CleanupJob for TreeCleanupJob {
    fn needed(&self) -> bool {
        self.state.status() == CleanupStatus::Pending
    }

    fn has_failed(&self) -> bool {
        self.failed
    }

    fn run(&mut self) -> Result<()> {
        if !self.needed() {
            return Ok(());
        }
        self.monitor.cleanup_started();
        info!(generation = %self.cleaner.generation(), "Starting recovery cleanup");
        match self.cleaner.clean(&self.cancelled) {
            Ok(Some(stats)) => {
                self.changed.store(true, Ordering::Release);
                self.state.settle(CleanupStatus::Done);
                info!(
                    visited = stats.pages_visited,
                    cleaned = stats.crashed_pages_cleaned,
                    released = stats.pages_released,
                    duration_ms = stats.duration.as_millis(),
                    "Recovery cleanup finished"
                );
                self.monitor.cleanup_finished(stats);
                Ok(())
            }
            Ok(None) => {
                warn!("Recovery cleanup cancelled");
                self.state.settle(CleanupStatus::Abandoned);
                Ok(())
            }
            Err(e) => {
                self.failed = true;
                let cause = e.to_string();
                error!(error = %cause, "Recovery cleanup failed");
                self.state.settle(CleanupStatus::Failed(cause.clone()));
                self.monitor.cleanup_failed(&cause);
                Err(TreeError::Cleanup(Box::new(e)))
            }
        }
    }

    fn close(&mut self) {
        if self.state.settle(CleanupStatus::Abandoned) {
            warn!("Recovery cleanup closed before it ran");
        }
        self.monitor.cleanup_closed();
    }
}

/// When registered cleanup jobs run.
#[derive(Debug, Clone)]
pub enum CollectorKind {
    /// In the thread calling `start`.
    Immediate,
    /// Never. Jobs are closed unexecuted.
    Ignore,
    /// On blocking threads of the given runtime.
    Background(Handle),
}

#[derive(Default)]
struct CollectorState {
    started: bool,
    jobs: Vec<Box<dyn CleanupJob>>,
    running: Vec<JoinHandle<Result<()>>>,
}

/// Collects cleanup jobs while trees open and runs them once started.
pub struct RecoveryCleanupWorkCollector {
    kind: CollectorKind,
    state: Mutex<CollectorState>,
}

impl RecoveryCleanupWorkCollector {
    #[must_use]
    pub fn new(kind: CollectorKind) -> Self {
        Self {
            kind,
            state: Mutex::new(CollectorState::default()),
        }
    }

    #[must_use]
    pub fn immediate() -> Self {
        Self::new(CollectorKind::Immediate)
    }

    #[must_use]
    pub fn ignore() -> Self {
        Self::new(CollectorKind::Ignore)
    }

    #[must_use]
    pub fn background(handle: Handle) -> Self {
        Self::new(CollectorKind::Background(handle))
    }

    /// Register a job. Fails once the collector has started.
    pub fn add(&self, job: Box<dyn CleanupJob>) -> Result<()> {
        let mut state = self.state.lock();
        if state.started {
            return Err(TreeError::IllegalState(
                "cleanup job added after the collector started".to_string(),
            ));
        }
        state.jobs.push(job);
        Ok(())
    }

    /// Run, schedule or drop the registered jobs, depending on the kind.
    ///
    /// A failing job never keeps the others from running. The first failure
    /// is returned once every job got its turn.
    pub fn start(&self) -> Result<()> {
        let jobs = {
            let mut state = self.state.lock();
            if state.started {
                return Err(TreeError::IllegalState(
                    "cleanup collector already started".to_string(),
                ));
            }
            state.started = true;
            std::mem::take(&mut state.jobs)
        };

        match &self.kind {
            CollectorKind::Immediate => {
                let total = jobs.len();
                let mut failed = 0;
                let mut first_failure = None;
                for mut job in jobs {
                    let result = if job.needed() { job.run() } else { Ok(()) };
                    if job.has_failed() {
                        failed += 1;
                    }
                    job.close();
                    if let Err(e) = result {
                        first_failure.get_or_insert(e);
                    }
                }
                if failed > 0 {
                    warn!(total, failed, "Recovery cleanup jobs failed");
                }
                first_failure.map_or(Ok(()), Err)
            }
            CollectorKind::Ignore => {
                for mut job in jobs {
                    job.close();
                }
                Ok(())
            }
            CollectorKind::Background(handle) => {
                let running = jobs
                    .into_iter()
                    .map(|mut job| {
                        handle.spawn_blocking(move || {
                            let result = job.run();
                            job.close();
                            result
                        })
                    })
                    .collect::<Vec<_>>();
                self.state.lock().running.extend(running);
                Ok(())
            }
        }
    }

    /// Wait for scheduled jobs and close jobs that never ran. Returns the
    /// first failure of a background job.
    pub fn stop(&self) -> Result<()> {
        let (jobs, running) = {
            let mut state = self.state.lock();
            state.started = true;
            (
                std::mem::take(&mut state.jobs),
                std::mem::take(&mut state.running),
            )
        };
        for mut job in jobs {
            job.close();
        }

        let mut first_failure = None;
        for joined in futures::executor::block_on(futures::future::join_all(running)) {
            let result = joined.unwrap_or_else(|e| {
                Err(TreeError::Cleanup(Box::new(TreeError::IllegalState(format!(
                    "cleanup task did not complete: {e}"
                )))))
            });
            if let Err(e) = result {
                first_failure.get_or_insert(e);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for RecoveryCleanupWorkCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RecoveryCleanupWorkCollector")
            .field("kind", &self.kind)
            .field("started", &state.started)
            .field("pending_jobs", &state.jobs.len())
            .field("running_jobs", &state.running.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedJob {
        fail: bool,
        ran: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
    }

    impl ScriptedJob {
        fn boxed(fail: bool) -> (Box<dyn CleanupJob>, Arc<AtomicBool>, Arc<AtomicBool>) {
            let ran = Arc::new(AtomicBool::new(false));
            let closed = Arc::new(AtomicBool::new(false));
            let job = Self {
                fail,
                ran: Arc::clone(&ran),
                closed: Arc::clone(&closed),
            };
            (Box::new(job), ran, closed)
        }
    }

    impl CleanupJob for ScriptedJob {
        fn needed(&self) -> bool {
            !self.ran.load(Ordering::Acquire)
        }

        fn has_failed(&self) -> bool {
            self.fail && self.ran.load(Ordering::Acquire)
        }

        fn run(&mut self) -> Result<()> {
            self.ran.store(true, Ordering::Release);
            if self.fail {
                return Err(TreeError::Cleanup(Box::new(TreeError::IllegalState(
                    "scripted failure".to_string(),
                ))));
            }
            Ok(())
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    #[test]
    fn test_immediate_isolates_failures() {
        let collector = RecoveryCleanupWorkCollector::immediate();
        let (failing, failing_ran, failing_closed) = ScriptedJob::boxed(true);
        let (healthy, healthy_ran, healthy_closed) = ScriptedJob::boxed(false);
        collector.add(failing).expect("should accept job");
        collector.add(healthy).expect("should accept job");

        let err = collector.start().expect_err("should report failure");
        assert!(matches!(err, TreeError::Cleanup(_)));
        assert!(failing_ran.load(Ordering::Acquire));
        assert!(healthy_ran.load(Ordering::Acquire));
        assert!(failing_closed.load(Ordering::Acquire));
        assert!(healthy_closed.load(Ordering::Acquire));
    }

    #[test]
    fn test_add_after_start_is_rejected() {
        let collector = RecoveryCleanupWorkCollector::immediate();
        collector.start().expect("should start empty");
        let (job, _, _) = ScriptedJob::boxed(false);
        let err = collector.add(job).expect_err("should reject late job");
        assert!(matches!(err, TreeError::IllegalState(_)));
    }

    #[test]
    fn test_ignore_closes_without_running() {
        let collector = RecoveryCleanupWorkCollector::ignore();
        let (job, ran, closed) = ScriptedJob::boxed(false);
        collector.add(job).expect("should accept job");
        collector.start().expect("should start");
        assert!(!ran.load(Ordering::Acquire));
        assert!(closed.load(Ordering::Acquire));
    }

    #[test]
    fn test_stop_closes_unstarted_jobs() {
        let collector = RecoveryCleanupWorkCollector::immediate();
        let (job, ran, closed) = ScriptedJob::boxed(false);
        collector.add(job).expect("should accept job");
        collector.stop().expect("should stop");
        assert!(!ran.load(Ordering::Acquire));
        assert!(closed.load(Ordering::Acquire));
    }

    #[test]
    fn test_background_runs_on_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .expect("should build runtime");
        let collector = RecoveryCleanupWorkCollector::background(runtime.handle().clone());
        let (failing, _, failing_closed) = ScriptedJob::boxed(true);
        let (healthy, healthy_ran, _) = ScriptedJob::boxed(false);
        collector.add(failing).expect("should accept job");
        collector.add(healthy).expect("should accept job");
        collector.start().expect("should schedule");

        let err = collector.stop().expect_err("should surface failure");
        assert!(matches!(err, TreeError::Cleanup(_)));
        assert!(healthy_ran.load(Ordering::Acquire));
        assert!(failing_closed.load(Ordering::Acquire));
    }

    #[test]
    fn test_wait_until_done_reports_abandoned() {
        let state = CleanupState::new(CleanupStatus::Pending);
        assert!(state.settle(CleanupStatus::Abandoned));
        assert!(!state.settle(CleanupStatus::Done));
        let err = state.wait_until_done().expect_err("should refuse writes");
        assert!(matches!(err, TreeError::IllegalState(_)));
    }

    #[test]
    fn test_wait_until_done_wakes_when_settled() {
        let state = Arc::new(CleanupState::new(CleanupStatus::Pending));
        let waiter = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || state.wait_until_done())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(state.settle(CleanupStatus::Done));
        waiter
            .join()
            .expect("waiter should not panic")
            .expect("should see cleanup done");
    }

    #[test]
    fn test_wait_until_done_reports_failure_cause() {
        let state = CleanupState::new(CleanupStatus::Failed("disk gone".to_string()));
        let err = state.wait_until_done().expect_err("should refuse writes");
        assert!(err.to_string().contains("disk gone"));
    }
}
