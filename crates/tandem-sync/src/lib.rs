//! Tandem Sync -- thread and synchronization primitives for consumer threads.
//!
//! This crate is the foundation of the Tandem engine's deferred execution
//! core. It provides:
//!
//! - [`Mutex`](mutex::Mutex): mutual exclusion with blocking, non-blocking and
//!   timed acquisition.
//! - [`Semaphore`](semaphore::Semaphore): a counting semaphore with an initial
//!   and a maximum count.
//! - [`thread::spawn`]: named threads with an explicit stack size and start
//!   mode (detached or joinable).
//! - [`JobSystem`](job::JobSystem): a worker thread paired with four
//!   semaphores (consume, continue, exit, terminated) forming a cooperative
//!   start/step/stop handshake.
//!
//! Primitive creation failures are returned as [`SyncError`] and must abort
//! the initialization of whatever subsystem requested them.
//!
//! # Example
//!
//! ```
//! use tandem_sync::prelude::*;
//!
//! let mut jobs = JobSystem::new(JobSystemConfig::default());
//! let handle = jobs
//!     .create_job("worker", 0, StartMode::Joinable, |ctx| {
//!         ctx.signal_ready();
//!         while ctx.wait_for_work() == Work::Run {
//!             ctx.signal_continue();
//!         }
//!     }, None)
//!     .unwrap();
//!
//! assert!(handle.wait_continue()); // ready
//! handle.kick();
//! assert!(handle.wait_continue()); // one unit of work
//! assert!(jobs.terminate_all());
//! ```

#![deny(unsafe_code)]

pub mod job;
pub mod mutex;
pub mod semaphore;
pub mod thread;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced while creating or tearing down synchronization primitives.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The operating system refused to create a thread.
    #[error("failed to spawn thread '{name}': {source}")]
    ThreadSpawn {
        /// Name the thread would have had.
        name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A semaphore was requested with counts that can never be satisfied.
    #[error("invalid semaphore counts: initial {initial}, maximum {max} (maximum must be non-zero and >= initial)")]
    InvalidSemaphore {
        /// Requested initial count.
        initial: u32,
        /// Requested maximum count.
        max: u32,
    },

    /// A joinable thread panicked before it could be joined.
    #[error("thread '{name}' panicked")]
    ThreadPanicked {
        /// Name of the thread that panicked.
        name: String,
    },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::job::{
        CompletionCallback, JobContext, JobHandle, JobSystem, JobSystemConfig, Work,
    };
    pub use crate::mutex::{Condvar, Mutex, MutexGuard};
    pub use crate::semaphore::Semaphore;
    pub use crate::thread::{sleep_ms, sleep_us, StartMode, Thread};
    pub use crate::SyncError;
}
