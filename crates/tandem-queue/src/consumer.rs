//! The consumer tick: drain, apply in FIFO order, step.
//!
//! A [`ConsumerLoop`] owns a [`Backend`] (the subsystem state: a physics
//! world, a device context) and the consuming end of a [`CommandQueue`]. Each
//! [`tick`](ConsumerLoop::tick):
//!
//! 1. Notes how many records are queued. Only those are processed; records
//!    enqueued while the tick runs wait for the next one.
//! 2. Pops and applies them in sequence order. A failing command is logged
//!    and recorded in the [`DiagnosticSink`]; the tick carries on.
//! 3. Calls [`Backend::step`] exactly once.
//!
//! A terminate record ends the drain. The queue is closed, everything behind
//! the terminate record is discarded, the step still runs, then
//! [`Backend::shutdown`] is called and the loop is `Terminated`. Discarded
//! records are dropped unapplied; a query among them never invokes its
//! callback, so a [`ConsumerCallback::channel`] receiver disconnects.
//!
//! [`ConsumerCallback::channel`]: crate::callback::ConsumerCallback::channel

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::ring::{CommandQueue, Op};
use crate::CommandError;

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// A short, static name for a command variant, used in logs and diagnostics.
pub trait Opcode {
    /// Name of the operation this command performs.
    fn opcode(&self) -> &'static str;
}

/// Subsystem state owned by the consumer thread.
///
/// Backends are never shared: the consumer creates one, applies commands to
/// it and steps it, all on the same thread. They therefore do not need to be
/// `Send`.
pub trait Backend {
    /// The subsystem's command sum type.
    type Command: Opcode + Send + 'static;

    /// Name used in logs and diagnostics.
    fn name(&self) -> &str;

    /// Apply one command.
    fn apply(&mut self, command: Self::Command) -> Result<(), CommandError>;

    /// Advance the subsystem once, after the tick's commands were applied.
    fn step(&mut self);

    /// Release subsystem resources. Called once, on the consumer thread.
    fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// State and reporting
// ---------------------------------------------------------------------------

/// Lifecycle of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Backend not yet constructed.
    Init,
    /// Draining and stepping every tick.
    Active,
    /// A terminate record was seen; the current tick is finishing.
    ShutdownRequested,
    /// Backend shut down. Further ticks do nothing.
    Terminated,
}

impl ConsumerState {
    fn to_u8(self) -> u8 {
        match self {
            ConsumerState::Init => 0,
            ConsumerState::Active => 1,
            ConsumerState::ShutdownRequested => 2,
            ConsumerState::Terminated => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConsumerState::Init,
            1 => ConsumerState::Active,
            2 => ConsumerState::ShutdownRequested,
            _ => ConsumerState::Terminated,
        }
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Commands applied successfully.
    pub applied: usize,
    /// Commands that failed and were absorbed.
    pub failed: usize,
    /// Records dropped because they followed a terminate record.
    pub discarded: usize,
    /// Backend steps performed (0 or 1).
    pub steps: usize,
}

/// Counters published by the consumer, readable from any thread.
#[derive(Debug)]
pub struct ConsumerStatus {
    state: AtomicU8,
    ticks: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

impl ConsumerStatus {
    /// Fresh status in the `Init` state.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConsumerState::Init.to_u8()),
            ticks: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Ticks completed.
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Commands applied successfully, over the consumer's lifetime.
    pub fn commands_applied(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    /// Commands that failed, over the consumer's lifetime.
    pub fn commands_failed(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }

    /// Records discarded at shutdown.
    pub fn commands_discarded(&self) -> u64 {
        self.discarded.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    fn record(&self, report: &TickReport) {
        self.applied
            .fetch_add(report.applied as u64, Ordering::AcqRel);
        self.failed.fetch_add(report.failed as u64, Ordering::AcqRel);
        self.discarded
            .fetch_add(report.discarded as u64, Ordering::AcqRel);
        self.ticks.fetch_add(1, Ordering::AcqRel);
    }
}

impl Default for ConsumerStatus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ConsumerLoop
// ---------------------------------------------------------------------------

/// Drives a [`Backend`] from a [`CommandQueue`].
pub struct ConsumerLoop<B: Backend> {
    backend: B,
    queue: Arc<CommandQueue<B::Command>>,
    state: ConsumerState,
    status: Arc<ConsumerStatus>,
    diagnostics: Arc<DiagnosticSink>,
    tick_count: u64,
    last_report: TickReport,
}

impl<B: Backend> ConsumerLoop<B> {
    /// Create an active loop with its own status and diagnostics.
    pub fn new(backend: B, queue: Arc<CommandQueue<B::Command>>) -> Self {
        Self::with_parts(
            backend,
            queue,
            Arc::new(ConsumerStatus::new()),
            Arc::new(DiagnosticSink::default()),
        )
    }

    /// Create an active loop that publishes into existing status and
    /// diagnostics (shared with producers).
    pub fn with_parts(
        backend: B,
        queue: Arc<CommandQueue<B::Command>>,
        status: Arc<ConsumerStatus>,
        diagnostics: Arc<DiagnosticSink>,
    ) -> Self {
        status.set_state(ConsumerState::Active);
        debug!(consumer = backend.name(), queue = queue.name(), "consumer active");
        Self {
            backend,
            queue,
            state: ConsumerState::Active,
            status,
            diagnostics,
            tick_count: 0,
            last_report: TickReport::default(),
        }
    }

    /// Run one tick. Does nothing once the loop is terminated.
    pub fn tick(&mut self) -> TickReport {
        if self.state == ConsumerState::Terminated {
            return TickReport::default();
        }

        let mut report = TickReport::default();
        let budget = self.queue.len();
        for _ in 0..budget {
            let Some(record) = self.queue.get() else {
                break;
            };
            match record.op {
                Op::Apply(command) => {
                    let opcode = command.opcode();
                    match self.backend.apply(command) {
                        Ok(()) => report.applied += 1,
                        Err(error) => {
                            report.failed += 1;
                            warn!(
                                consumer = self.backend.name(),
                                sequence = record.sequence,
                                opcode,
                                error = %error,
                                "command failed"
                            );
                            self.diagnostics.push(Diagnostic {
                                sequence: record.sequence,
                                subsystem: self.backend.name().to_owned(),
                                opcode,
                                error,
                            });
                        }
                    }
                }
                Op::Terminate => {
                    self.request_shutdown(&mut report);
                    break;
                }
            }
        }

        self.backend.step();
        report.steps = 1;

        if self.state == ConsumerState::ShutdownRequested {
            self.shut_down();
        }

        self.tick_count += 1;
        self.status.record(&report);
        self.last_report = report;
        report
    }

    /// Shut down without a terminate record, e.g. when the host thread asks
    /// the job to exit directly. Idempotent.
    pub fn finish(&mut self) {
        if self.state == ConsumerState::Terminated {
            return;
        }
        let mut report = TickReport::default();
        self.request_shutdown(&mut report);
        self.status
            .discarded
            .fetch_add(report.discarded as u64, Ordering::AcqRel);
        self.shut_down();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Ticks completed.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Report of the most recent tick.
    pub fn last_report(&self) -> TickReport {
        self.last_report
    }

    /// The owned backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable access to the owned backend.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Shared status counters.
    pub fn status(&self) -> &Arc<ConsumerStatus> {
        &self.status
    }

    /// Shared diagnostics sink.
    pub fn diagnostics(&self) -> &Arc<DiagnosticSink> {
        &self.diagnostics
    }

    fn request_shutdown(&mut self, report: &mut TickReport) {
        self.state = ConsumerState::ShutdownRequested;
        self.status.set_state(ConsumerState::ShutdownRequested);
        self.queue.close();
        let discarded = self.queue.discard_pending();
        if discarded > 0 {
            warn!(
                consumer = self.backend.name(),
                discarded, "records after shutdown request discarded"
            );
        }
        report.discarded += discarded;
    }

    fn shut_down(&mut self) {
        self.backend.shutdown();
        self.state = ConsumerState::Terminated;
        self.status.set_state(ConsumerState::Terminated);
        debug!(
            consumer = self.backend.name(),
            ticks = self.tick_count,
            "consumer terminated"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::ConsumerCallback;
    use crate::ring::OverflowPolicy;

    #[derive(Debug)]
    enum Cmd {
        Push(u32),
        Fail,
        Count(ConsumerCallback<usize>),
    }

    impl Opcode for Cmd {
        fn opcode(&self) -> &'static str {
            match self {
                Cmd::Push(_) => "push",
                Cmd::Fail => "fail",
                Cmd::Count(_) => "count",
            }
        }
    }

    #[derive(Default)]
    struct Log {
        applied: Vec<u32>,
        steps: usize,
        shutdowns: usize,
    }

    impl Backend for Log {
        type Command = Cmd;

        fn name(&self) -> &str {
            "log"
        }

        fn apply(&mut self, command: Cmd) -> Result<(), CommandError> {
            match command {
                Cmd::Push(v) => {
                    self.applied.push(v);
                    Ok(())
                }
                Cmd::Fail => Err(CommandError::InvalidParams {
                    opcode: "fail",
                    reason: "always fails".into(),
                }),
                Cmd::Count(callback) => {
                    callback.invoke(&self.applied.len());
                    Ok(())
                }
            }
        }

        fn step(&mut self) {
            self.steps += 1;
        }

        fn shutdown(&mut self) {
            self.shutdowns += 1;
        }
    }

    fn setup() -> (Arc<CommandQueue<Cmd>>, ConsumerLoop<Log>) {
        let queue = Arc::new(CommandQueue::new("log", 64, OverflowPolicy::Reject));
        let consumer = ConsumerLoop::new(Log::default(), Arc::clone(&queue));
        (queue, consumer)
    }

    #[test]
    fn applies_in_fifo_order_then_steps_once() {
        let (queue, mut consumer) = setup();
        for v in [3, 1, 2] {
            queue.put(Cmd::Push(v)).unwrap();
        }
        let report = consumer.tick();
        assert_eq!(report.applied, 3);
        assert_eq!(report.steps, 1);
        assert_eq!(consumer.backend().applied, vec![3, 1, 2]);
        assert_eq!(consumer.backend().steps, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn empty_tick_still_steps() {
        let (_queue, mut consumer) = setup();
        let report = consumer.tick();
        assert_eq!(report, TickReport { steps: 1, ..Default::default() });
        assert_eq!(consumer.tick_count(), 1);
    }

    #[test]
    fn failures_are_absorbed_and_recorded() {
        let (queue, mut consumer) = setup();
        queue.put(Cmd::Push(1)).unwrap();
        queue.put(Cmd::Fail).unwrap();
        queue.put(Cmd::Push(2)).unwrap();

        let report = consumer.tick();
        assert_eq!(report.applied, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(consumer.backend().applied, vec![1, 2]);

        let diags = consumer.diagnostics().drain();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].sequence, 1);
        assert_eq!(diags[0].opcode, "fail");
        assert_eq!(diags[0].subsystem, "log");
        assert_eq!(consumer.status().commands_failed(), 1);
    }

    #[test]
    fn terminate_discards_followers_and_shuts_down() {
        let (queue, mut consumer) = setup();
        queue.put(Cmd::Push(1)).unwrap();
        queue.put_terminate().unwrap();
        // The terminate record is a barrier; later commands race with it and
        // must be discarded, not applied.
        queue.put(Cmd::Push(2)).unwrap();

        let report = consumer.tick();
        assert_eq!(report.applied, 1);
        assert_eq!(report.discarded, 1);
        assert_eq!(report.steps, 1);
        assert_eq!(consumer.state(), ConsumerState::Terminated);
        assert_eq!(consumer.status().state(), ConsumerState::Terminated);
        assert_eq!(consumer.backend().shutdowns, 1);
        assert!(queue.is_closed());
        assert!(queue.put(Cmd::Push(3)).is_err());

        assert_eq!(consumer.tick(), TickReport::default());
        assert_eq!(consumer.backend().steps, 1);
    }

    #[test]
    fn queries_behind_terminate_are_dropped_uninvoked() {
        let (queue, mut consumer) = setup();
        let (answered, answered_rx) = ConsumerCallback::channel();
        let (dropped, dropped_rx) = ConsumerCallback::channel();
        queue.put(Cmd::Push(1)).unwrap();
        queue.put(Cmd::Count(answered)).unwrap();
        queue.put_terminate().unwrap();
        queue.put(Cmd::Count(dropped)).unwrap();

        let report = consumer.tick();
        assert_eq!(report.applied, 2);
        assert_eq!(report.discarded, 1);
        assert_eq!(answered_rx.recv(), Ok(1));
        // Never called: the sender went away with the discarded record.
        assert_eq!(dropped_rx.recv(), Err(std::sync::mpsc::RecvError));
    }

    #[test]
    fn finish_is_idempotent() {
        let (queue, mut consumer) = setup();
        queue.put(Cmd::Push(1)).unwrap();
        consumer.finish();
        consumer.finish();
        assert_eq!(consumer.backend().shutdowns, 1);
        assert!(consumer.backend().applied.is_empty());
        assert_eq!(consumer.status().commands_discarded(), 1);
    }

    #[test]
    fn records_enqueued_during_a_tick_wait_for_the_next() {
        struct Reentrant {
            queue: Arc<CommandQueue<Cmd>>,
            seen: Vec<u32>,
        }
        impl Backend for Reentrant {
            type Command = Cmd;
            fn name(&self) -> &str {
                "reentrant"
            }
            fn apply(&mut self, command: Cmd) -> Result<(), CommandError> {
                if let Cmd::Push(v) = command {
                    self.seen.push(v);
                    if v < 3 {
                        let _ = self.queue.put(Cmd::Push(v + 1));
                    }
                }
                Ok(())
            }
            fn step(&mut self) {}
        }

        let queue = Arc::new(CommandQueue::new("re", 8, OverflowPolicy::Reject));
        let backend = Reentrant {
            queue: Arc::clone(&queue),
            seen: Vec::new(),
        };
        let mut consumer = ConsumerLoop::new(backend, Arc::clone(&queue));
        queue.put(Cmd::Push(1)).unwrap();

        consumer.tick();
        assert_eq!(consumer.backend().seen, vec![1]);
        consumer.tick();
        assert_eq!(consumer.backend().seen, vec![1, 2]);
        consumer.tick();
        assert_eq!(consumer.backend().seen, vec![1, 2, 3]);
    }
}
