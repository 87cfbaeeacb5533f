//! Jobs: worker threads driven by a four-semaphore handshake.
//!
//! A job binds a thread to four semaphores:
//!
//! | Semaphore | Posted by | Meaning |
//! |-----------|-----------|---------|
//! | consume | spawner | new work is available |
//! | continue | worker | the worker finished a phase (ready, or one unit of work) |
//! | exit | spawner | the worker should return |
//! | terminated | worker | the worker has fully returned |
//!
//! # Worker protocol
//!
//! The routine receives a [`JobContext`]. It must call
//! [`signal_ready`](JobContext::signal_ready) exactly once, then alternate
//! [`wait_for_work`](JobContext::wait_for_work) and
//! [`signal_continue`](JobContext::signal_continue) until `wait_for_work`
//! returns [`Work::Exit`]. Breaking this alternation deadlocks the pair, so
//! debug builds assert on every phase transition.
//!
//! # Lifecycle
//!
//! `CREATED -> RUNNING (consume / work / continue)* -> EXIT-REQUESTED ->
//! TERMINATED`. [`JobSystem::terminate_all`] only frees a job's thread after
//! its *terminated* signal has been observed.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::semaphore::Semaphore;
use crate::thread::{self, StartMode, Thread};
use crate::SyncError;

/// Callback run on the worker thread after its routine returns.
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// How often a spawner blocked in [`JobHandle::wait_continue`] re-checks
/// whether the worker has terminated.
const TERMINATION_POLL: Duration = Duration::from_millis(10);

/// Upper bound for the consume/continue counts. Posting beyond it means the
/// handshake is already broken.
const MAX_PENDING_SIGNALS: u32 = 64;

const PHASE_STARTING: u8 = 0;
const PHASE_IDLE: u8 = 1;
const PHASE_WORKING: u8 = 2;
const PHASE_EXITING: u8 = 3;
const PHASE_TERMINATED: u8 = 4;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for a [`JobSystem`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSystemConfig {
    /// How long a single [`JobSystem::terminate_all`] call waits, in total,
    /// for workers to report termination.
    pub terminate_timeout_ms: u64,
    /// Stack size used when a job is created with a stack size of zero.
    /// Zero means the platform default.
    pub default_stack_size: usize,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        Self {
            terminate_timeout_ms: 2000,
            default_stack_size: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared job state
// ---------------------------------------------------------------------------

/// What a worker should do after waking up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Work {
    /// Perform one unit of work, then call [`JobContext::signal_continue`].
    Run,
    /// Return from the routine.
    Exit,
}

#[derive(Debug)]
struct JobShared {
    name: String,
    consume: Semaphore,
    proceed: Semaphore,
    exit: Semaphore,
    terminated: Semaphore,
    phase: AtomicU8,
    exit_requested: AtomicBool,
    is_terminated: AtomicBool,
}

impl JobShared {
    fn new(name: &str) -> Result<Self, SyncError> {
        Ok(Self {
            name: name.to_owned(),
            consume: Semaphore::new(0, MAX_PENDING_SIGNALS)?,
            proceed: Semaphore::new(0, MAX_PENDING_SIGNALS)?,
            exit: Semaphore::new(0, 1)?,
            terminated: Semaphore::new(0, 1)?,
            phase: AtomicU8::new(PHASE_STARTING),
            exit_requested: AtomicBool::new(false),
            is_terminated: AtomicBool::new(false),
        })
    }

    fn transition(&self, from: u8, to: u8, what: &str) {
        let result = self
            .phase
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire);
        debug_assert!(
            result.is_ok(),
            "job '{}' protocol violation: {what} in phase {}",
            self.name,
            result.unwrap_or_else(|actual| actual)
        );
        if result.is_err() {
            self.phase.store(to, Ordering::Release);
        }
    }
}

// ---------------------------------------------------------------------------
// Worker side
// ---------------------------------------------------------------------------

/// The worker's end of the handshake, passed to the job routine.
pub struct JobContext {
    shared: Arc<JobShared>,
}

impl JobContext {
    /// Name of the job.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Announce that the worker has finished initialising. Must be called
    /// exactly once, before the first [`wait_for_work`](Self::wait_for_work).
    pub fn signal_ready(&self) {
        self.shared
            .transition(PHASE_STARTING, PHASE_IDLE, "signal_ready");
        self.shared.proceed.post(1);
    }

    /// Block until the spawner provides work or requests exit.
    pub fn wait_for_work(&self) -> Work {
        debug_assert_eq!(
            self.shared.phase.load(Ordering::Acquire),
            PHASE_IDLE,
            "job '{}' protocol violation: wait_for_work before signalling ready/continue",
            self.shared.name
        );
        self.shared.consume.wait();
        if self.shared.exit.try_wait() {
            self.shared.phase.store(PHASE_EXITING, Ordering::Release);
            return Work::Exit;
        }
        self.shared
            .transition(PHASE_IDLE, PHASE_WORKING, "wait_for_work");
        Work::Run
    }

    /// Announce that one unit of work is complete.
    pub fn signal_continue(&self) {
        self.shared
            .transition(PHASE_WORKING, PHASE_IDLE, "signal_continue");
        self.shared.proceed.post(1);
    }

    /// Whether the spawner has asked this job to exit. Long-running work can
    /// poll this to bail out early.
    pub fn exit_requested(&self) -> bool {
        self.shared.exit_requested.load(Ordering::Acquire)
    }
}

/// Posts *terminated* when the worker routine returns or unwinds.
struct TerminationGuard {
    shared: Arc<JobShared>,
    completion: Option<CompletionCallback>,
}

impl Drop for TerminationGuard {
    fn drop(&mut self) {
        if let Some(callback) = self.completion.take() {
            if !std::thread::panicking() {
                callback();
            }
        }
        self.shared.phase.store(PHASE_TERMINATED, Ordering::Release);
        self.shared.is_terminated.store(true, Ordering::Release);
        self.shared.terminated.post(1);
        debug!(job = %self.shared.name, "job terminated");
    }
}

// ---------------------------------------------------------------------------
// Spawner side
// ---------------------------------------------------------------------------

/// The spawner's end of the handshake. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JobHandle {
    shared: Arc<JobShared>,
}

impl JobHandle {
    /// Name of the job.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Post *consume*: the worker may perform one unit of work.
    pub fn kick(&self) {
        self.shared.consume.post(1);
    }

    /// Block until the worker posts *continue*.
    ///
    /// Returns `false` if the worker terminated without continuing, instead
    /// of blocking forever.
    pub fn wait_continue(&self) -> bool {
        loop {
            if self.shared.proceed.wait_timeout(TERMINATION_POLL) {
                return true;
            }
            if self.is_terminated() {
                return self.shared.proceed.try_wait();
            }
        }
    }

    /// Block until the worker posts *continue* or `timeout` elapses.
    pub fn wait_continue_timeout(&self, timeout: Duration) -> bool {
        self.shared.proceed.wait_timeout(timeout)
    }

    /// Consume a pending *continue* without blocking.
    pub fn try_continue(&self) -> bool {
        self.shared.proceed.try_wait()
    }

    /// Post *exit* (once) and wake the worker.
    pub fn request_exit(&self) {
        if !self.shared.exit_requested.swap(true, Ordering::AcqRel) {
            self.shared.exit.post(1);
            self.shared.consume.post(1);
            debug!(job = %self.shared.name, "exit requested");
        }
    }

    /// Whether exit has been requested.
    pub fn exit_requested(&self) -> bool {
        self.shared.exit_requested.load(Ordering::Acquire)
    }

    /// Whether the worker routine has returned.
    pub fn is_terminated(&self) -> bool {
        self.shared.is_terminated.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// JobSystem
// ---------------------------------------------------------------------------

struct Job {
    handle: JobHandle,
    thread: Thread,
}

/// Owns every outstanding job and tears them down.
pub struct JobSystem {
    config: JobSystemConfig,
    jobs: Vec<Job>,
}

impl JobSystem {
    /// Create an empty job system.
    pub fn new(config: JobSystemConfig) -> Self {
        Self {
            config,
            jobs: Vec::new(),
        }
    }

    /// Spawn a job running `routine` on a new thread.
    ///
    /// A `stack_size` of zero uses [`JobSystemConfig::default_stack_size`].
    /// The optional `completion` callback runs on the worker thread after the
    /// routine returns (it is skipped if the routine panicked).
    pub fn create_job<F>(
        &mut self,
        name: &str,
        stack_size: usize,
        mode: StartMode,
        routine: F,
        completion: Option<CompletionCallback>,
    ) -> Result<JobHandle, SyncError>
    where
        F: FnOnce(JobContext) + Send + 'static,
    {
        let shared = Arc::new(JobShared::new(name)?);
        let worker = Arc::clone(&shared);
        let stack_size = if stack_size == 0 {
            self.config.default_stack_size
        } else {
            stack_size
        };

        let thread = thread::spawn(name, stack_size, mode, move || {
            let _guard = TerminationGuard {
                shared: Arc::clone(&worker),
                completion,
            };
            routine(JobContext { shared: worker });
        })?;

        let handle = JobHandle { shared };
        self.jobs.push(Job {
            handle: handle.clone(),
            thread,
        });
        debug!(job = name, "job created");
        Ok(handle)
    }

    /// Number of jobs that have not yet been observed as terminated.
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Request every outstanding job to exit and collect the ones that did.
    ///
    /// Waits at most [`JobSystemConfig::terminate_timeout_ms`] in total.
    /// Terminated jobs are joined and freed; jobs still busy stay registered
    /// for a later call. Returns `true` once no jobs remain.
    pub fn terminate_all(&mut self) -> bool {
        if self.jobs.is_empty() {
            return true;
        }
        for job in &self.jobs {
            job.handle.request_exit();
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.terminate_timeout_ms);
        let mut still_running = Vec::new();
        for job in self.jobs.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if job.handle.shared.terminated.wait_timeout(remaining) {
                let name = job.handle.name().to_owned();
                if let Err(e) = job.thread.join() {
                    warn!(job = %name, error = %e, "job panicked before terminating");
                }
            } else {
                still_running.push(job);
            }
        }
        self.jobs = still_running;

        if !self.jobs.is_empty() {
            warn!(
                pending = self.jobs.len(),
                "jobs still running after terminate request; call terminate_all again"
            );
        }
        self.jobs.is_empty()
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        if !self.terminate_all() {
            warn!(
                leaked = self.jobs.len(),
                "job system dropped with running jobs; their threads are detached"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn stepping_job(jobs: &mut JobSystem, name: &str, counter: Arc<AtomicUsize>) -> JobHandle {
        jobs.create_job(
            name,
            0,
            StartMode::Joinable,
            move |ctx| {
                ctx.signal_ready();
                while ctx.wait_for_work() == Work::Run {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ctx.signal_continue();
                }
            },
            None,
        )
        .unwrap()
    }

    #[test]
    fn ready_then_one_unit_per_kick() {
        let mut jobs = JobSystem::new(JobSystemConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = stepping_job(&mut jobs, "stepper", Arc::clone(&counter));

        assert!(handle.wait_continue());
        for expected in 1..=5 {
            handle.kick();
            assert!(handle.wait_continue());
            assert_eq!(counter.load(Ordering::SeqCst), expected);
        }
        assert!(jobs.terminate_all());
        assert!(handle.is_terminated());
    }

    #[test]
    fn terminate_all_can_be_repeated_across_cycles() {
        let mut jobs = JobSystem::new(JobSystemConfig::default());
        for cycle in 0..3 {
            let counter = Arc::new(AtomicUsize::new(0));
            let a = stepping_job(&mut jobs, &format!("a{cycle}"), Arc::clone(&counter));
            let b = stepping_job(&mut jobs, &format!("b{cycle}"), Arc::clone(&counter));
            assert!(a.wait_continue() && b.wait_continue());
            a.kick();
            b.kick();
            assert!(a.wait_continue() && b.wait_continue());
            assert_eq!(counter.load(Ordering::SeqCst), 2);
            assert_eq!(jobs.job_count(), 2);
            assert!(jobs.terminate_all());
            assert_eq!(jobs.job_count(), 0);
        }
    }

    #[test]
    fn terminate_all_reports_busy_worker_then_succeeds() {
        let mut jobs = JobSystem::new(JobSystemConfig {
            terminate_timeout_ms: 5,
            ..Default::default()
        });
        let handle = jobs
            .create_job(
                "slow",
                0,
                StartMode::Joinable,
                |ctx| {
                    ctx.signal_ready();
                    while ctx.wait_for_work() == Work::Run {
                        std::thread::sleep(Duration::from_millis(150));
                        ctx.signal_continue();
                    }
                },
                None,
            )
            .unwrap();
        assert!(handle.wait_continue());
        handle.kick();
        std::thread::sleep(Duration::from_millis(10));

        assert!(!jobs.terminate_all(), "worker is mid-unit and cannot exit yet");

        let mut attempts = 0;
        while !jobs.terminate_all() {
            attempts += 1;
            assert!(attempts < 200, "worker never terminated");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.is_terminated());
    }

    #[test]
    fn completion_callback_runs_on_exit() {
        let mut jobs = JobSystem::new(JobSystemConfig::default());
        let completed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&completed);
        let handle = jobs
            .create_job(
                "completes",
                0,
                StartMode::Joinable,
                |ctx| {
                    ctx.signal_ready();
                    while ctx.wait_for_work() == Work::Run {
                        ctx.signal_continue();
                    }
                },
                Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
            )
            .unwrap();
        assert!(handle.wait_continue());
        assert!(jobs.terminate_all());
        assert!(completed.load(Ordering::SeqCst));
    }

    #[test]
    fn wait_continue_returns_false_when_worker_is_gone() {
        let mut jobs = JobSystem::new(JobSystemConfig::default());
        let handle = jobs
            .create_job(
                "one_shot",
                0,
                StartMode::Joinable,
                |ctx| ctx.signal_ready(),
                None,
            )
            .unwrap();
        assert!(handle.wait_continue());
        handle.kick();
        assert!(!handle.wait_continue());
        assert!(jobs.terminate_all());
    }

    #[test]
    fn panicking_worker_still_terminates() {
        let mut jobs = JobSystem::new(JobSystemConfig::default());
        let handle = jobs
            .create_job(
                "panicky",
                0,
                StartMode::Joinable,
                |ctx| {
                    ctx.signal_ready();
                    if ctx.wait_for_work() == Work::Run {
                        panic!("unit of work failed");
                    }
                },
                None,
            )
            .unwrap();
        assert!(handle.wait_continue());
        handle.kick();
        assert!(!handle.wait_continue());
        assert!(jobs.terminate_all());
    }

    #[test]
    fn exit_requested_is_visible_to_worker() {
        let mut jobs = JobSystem::new(JobSystemConfig::default());
        let seen = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen);
        let handle = jobs
            .create_job(
                "observer",
                0,
                StartMode::Detached,
                move |ctx| {
                    ctx.signal_ready();
                    assert_eq!(ctx.wait_for_work(), Work::Exit);
                    flag.store(ctx.exit_requested(), Ordering::SeqCst);
                },
                None,
            )
            .unwrap();
        assert!(handle.wait_continue());
        assert!(jobs.terminate_all());
        assert!(seen.load(Ordering::SeqCst));
    }
}
