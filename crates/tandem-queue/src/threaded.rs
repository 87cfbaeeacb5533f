//! A consumer loop running on its own job thread.
//!
//! [`ConsumerThread::spawn`] creates a job whose routine builds the backend
//! *on the consumer thread* from a factory, so subsystem state never crosses
//! threads. The host then drives it like any other job:
//!
//! ```text
//! host                         consumer thread
//! ----                         ---------------
//! spawn() ──────────────────►  factory(), signal_ready
//!   waits for ready ◄────────
//! begin_tick()  (kick) ─────►  tick(): drain, apply, step
//!   ... host does other work ...
//! end_tick()  (wait) ◄───────  signal_continue
//! ```
//!
//! Producers on any thread submit through [`ConsumerThread::submitter`].

use std::sync::{mpsc, Arc};

use tandem_sync::job::{JobHandle, JobSystem, Work};
use tandem_sync::thread::StartMode;
use tracing::debug;

use crate::consumer::{Backend, ConsumerLoop, ConsumerState, ConsumerStatus, Opcode};
use crate::diagnostics::DiagnosticSink;
use crate::handle::HandleAllocator;
use crate::ring::{CommandQueue, QueueConfig};
use crate::submit::Submitter;
use crate::ConsumerError;

/// Error type a backend factory may return.
pub type BackendInitError = Box<dyn std::error::Error + Send + Sync>;

/// Host-side handle to a consumer running on a job thread.
pub struct ConsumerThread<C> {
    name: String,
    job: JobHandle,
    submitter: Submitter<C>,
    status: Arc<ConsumerStatus>,
    diagnostics: Arc<DiagnosticSink>,
    in_flight: bool,
}

impl<C: Opcode + Send + 'static> ConsumerThread<C> {
    /// Spawn the consumer job and wait until its backend is built.
    ///
    /// `factory` runs on the new thread. If it fails, the error is returned
    /// here as [`ConsumerError::Init`] and the job ends on its own.
    pub fn spawn<B, F>(
        jobs: &mut JobSystem,
        name: &str,
        stack_size: usize,
        queue: &QueueConfig,
        allocator: Arc<HandleAllocator>,
        factory: F,
    ) -> Result<Self, ConsumerError>
    where
        B: Backend<Command = C>,
        F: FnOnce() -> Result<B, BackendInitError> + Send + 'static,
    {
        if queue.capacity == 0 {
            return Err(ConsumerError::InvalidQueue {
                name: name.to_owned(),
                reason: "capacity must be non-zero".into(),
            });
        }
        let queue = Arc::new(CommandQueue::from_config(name, queue));
        let status = Arc::new(ConsumerStatus::new());
        let diagnostics = Arc::new(DiagnosticSink::default());
        let (init_tx, init_rx) = mpsc::sync_channel::<Result<(), BackendInitError>>(1);

        let worker_queue = Arc::clone(&queue);
        let worker_status = Arc::clone(&status);
        let worker_diagnostics = Arc::clone(&diagnostics);
        let job = jobs.create_job(
            name,
            stack_size,
            StartMode::Joinable,
            move |ctx| {
                let backend = match factory() {
                    Ok(backend) => backend,
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                let _ = init_tx.send(Ok(()));
                let mut consumer = ConsumerLoop::with_parts(
                    backend,
                    worker_queue,
                    worker_status,
                    worker_diagnostics,
                );
                ctx.signal_ready();
                while ctx.wait_for_work() == Work::Run {
                    consumer.tick();
                    let terminated = consumer.state() == ConsumerState::Terminated;
                    ctx.signal_continue();
                    if terminated {
                        break;
                    }
                }
                consumer.finish();
            },
            None,
        )?;

        match init_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                return Err(ConsumerError::Init {
                    name: name.to_owned(),
                    source,
                })
            }
            Err(_) => {
                return Err(ConsumerError::Died {
                    name: name.to_owned(),
                })
            }
        }
        if !job.wait_continue() {
            return Err(ConsumerError::Died {
                name: name.to_owned(),
            });
        }
        debug!(consumer = name, "consumer thread ready");

        Ok(Self {
            name: name.to_owned(),
            job,
            submitter: Submitter::new(queue, allocator),
            status,
            diagnostics,
            in_flight: false,
        })
    }
}

impl<C> ConsumerThread<C> {
    /// Name of the consumer (and of its thread and queue).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start one tick on the consumer thread and return immediately.
    ///
    /// Must be paired with [`end_tick`](Self::end_tick) before the next
    /// `begin_tick`.
    pub fn begin_tick(&mut self) {
        debug_assert!(
            !self.in_flight,
            "consumer '{}': begin_tick called twice without end_tick",
            self.name
        );
        if self.in_flight {
            return;
        }
        self.job.kick();
        self.in_flight = true;
    }

    /// Wait for the tick started by [`begin_tick`](Self::begin_tick).
    ///
    /// Returns `false` if no tick completed because the consumer thread has
    /// ended.
    pub fn end_tick(&mut self) -> bool {
        if !self.in_flight {
            return false;
        }
        self.in_flight = false;
        self.job.wait_continue()
    }

    /// Run one full tick and wait for it.
    pub fn tick(&mut self) -> bool {
        self.begin_tick();
        self.end_tick()
    }

    /// Whether a tick has been started and not yet waited for.
    pub fn tick_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Enqueue a terminate record. The consumer shuts down during the next
    /// tick. Returns `false` if shutdown was already requested.
    pub fn request_shutdown(&self) -> bool {
        let requested = self.submitter.queue().put_terminate().is_some();
        if requested {
            debug!(consumer = %self.name, "shutdown requested");
        }
        requested
    }

    /// Request shutdown and run the tick that performs it.
    ///
    /// Returns `true` once the consumer reports `Terminated`.
    pub fn shutdown(&mut self) -> bool {
        if self.in_flight {
            self.end_tick();
        }
        if self.request_shutdown() {
            self.tick();
        }
        self.status.state() == ConsumerState::Terminated
    }

    /// Producer-side façade for this consumer's queue.
    pub fn submitter(&self) -> &Submitter<C> {
        &self.submitter
    }

    /// Counters published by the consumer.
    pub fn status(&self) -> &Arc<ConsumerStatus> {
        &self.status
    }

    /// Failures absorbed by the consumer.
    pub fn diagnostics(&self) -> &Arc<DiagnosticSink> {
        &self.diagnostics
    }

    /// Whether the consumer thread's routine has returned.
    pub fn is_terminated(&self) -> bool {
        self.job.is_terminated()
    }
}

impl<C> std::fmt::Debug for ConsumerThread<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerThread")
            .field("name", &self.name)
            .field("state", &self.status.state())
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
