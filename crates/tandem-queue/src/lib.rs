//! Tandem Queue -- deferred commands, handles and the consumer loop.
//!
//! Producers never touch subsystem state directly. They enqueue commands into
//! a [`CommandQueue`](ring::CommandQueue) and receive results through
//! [`ConsumerCallback`](callback::ConsumerCallback)s. A single consumer owns
//! the subsystem through a [`Backend`](consumer::Backend) and drains the queue
//! once per tick.
//!
//! - [`handle`]: generational handles. Producers reserve them synchronously;
//!   only the consumer releases them.
//! - [`ring`]: the bounded multi-producer queue with an explicit overflow
//!   policy.
//! - [`consumer`]: the tick loop (drain, apply, step) and its state machine.
//! - [`threaded`]: the consumer loop hosted on a job thread, driven by an
//!   external scheduler through `begin_tick` / `end_tick`.
//! - [`submit`]: the producer-side façade shared by every subsystem.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tandem_queue::prelude::*;
//!
//! struct Counter(u32);
//! struct Add(u32);
//!
//! impl Opcode for Add {
//!     fn opcode(&self) -> &'static str { "add" }
//! }
//!
//! impl Backend for Counter {
//!     type Command = Add;
//!     fn name(&self) -> &str { "counter" }
//!     fn apply(&mut self, cmd: Add) -> Result<(), CommandError> {
//!         self.0 += cmd.0;
//!         Ok(())
//!     }
//!     fn step(&mut self) {}
//! }
//!
//! let queue = Arc::new(CommandQueue::new("counter", 16, OverflowPolicy::Reject));
//! let submitter = Submitter::new(Arc::clone(&queue), Arc::new(HandleAllocator::new(16)));
//! let mut consumer = ConsumerLoop::new(Counter(0), queue);
//!
//! submitter.submit(Add(2)).unwrap();
//! submitter.submit(Add(3)).unwrap();
//! let report = consumer.tick();
//!
//! assert_eq!(report.applied, 2);
//! assert_eq!(consumer.backend().0, 5);
//! ```

#![deny(unsafe_code)]

pub mod callback;
pub mod consumer;
pub mod diagnostics;
pub mod handle;
pub mod ring;
pub mod submit;
pub mod threaded;

use handle::Handle;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by handle reservation and lookup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    /// Every slot of the allocator is live.
    #[error("handle allocator exhausted ({capacity} live handles)")]
    Exhausted {
        /// Maximum number of live handles.
        capacity: u32,
    },

    /// The handle was released, never reserved, or belongs to an older
    /// generation of its slot.
    #[error("handle {handle} is stale or was never reserved")]
    Stale {
        /// The offending handle.
        handle: Handle,
    },

    /// An object is already bound to the handle.
    #[error("handle {handle} already has an object bound")]
    Occupied {
        /// The offending handle.
        handle: Handle,
    },
}

/// Synchronous failures of the producer-side API.
///
/// These are capacity conditions: nothing was enqueued and no state changed,
/// so the producer may retry later.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The queue is full and its overflow policy is `reject`.
    #[error("command queue '{queue}' is full")]
    QueueFull {
        /// Name of the queue.
        queue: String,
    },

    /// The consumer has shut down and no longer accepts commands.
    #[error("command queue '{queue}' is closed")]
    QueueClosed {
        /// Name of the queue.
        queue: String,
    },

    /// No handle could be reserved for a creation command.
    #[error("no free handles ({capacity} live)")]
    HandlesExhausted {
        /// Maximum number of live handles.
        capacity: u32,
    },
}

/// Failure of a single command on the consumer.
///
/// Command failures never stop the consumer: they are logged, recorded as a
/// [`Diagnostic`](diagnostics::Diagnostic) and the next command is applied.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    /// The command targets a handle that does not resolve to a live object.
    #[error("stale handle {handle}")]
    StaleHandle {
        /// The handle that failed to resolve.
        handle: Handle,
    },

    /// The backend recognises the command but cannot carry it out.
    #[error("'{opcode}' is not supported: {reason}")]
    Unsupported {
        /// Opcode of the rejected command.
        opcode: &'static str,
        /// Human-readable explanation.
        reason: String,
    },

    /// The command's parameters are out of range or inconsistent.
    #[error("invalid parameters for '{opcode}': {reason}")]
    InvalidParams {
        /// Opcode of the rejected command.
        opcode: &'static str,
        /// Human-readable explanation.
        reason: String,
    },

    /// A creation command targets a handle that already has an object.
    #[error("handle {handle} is already in use")]
    HandleOccupied {
        /// The handle that was already bound.
        handle: Handle,
    },
}

impl From<HandleError> for CommandError {
    fn from(err: HandleError) -> Self {
        match err {
            HandleError::Stale { handle } => CommandError::StaleHandle { handle },
            HandleError::Occupied { handle } => CommandError::HandleOccupied { handle },
            HandleError::Exhausted { capacity } => CommandError::InvalidParams {
                opcode: "reserve",
                reason: format!("handle allocator exhausted ({capacity} live handles)"),
            },
        }
    }
}

/// Errors starting or running a consumer thread.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// The backend factory failed on the consumer thread.
    #[error("consumer '{name}' failed to initialise: {source}")]
    Init {
        /// Name of the consumer.
        name: String,
        /// The factory's error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The consumer thread ended before reporting that it was ready.
    #[error("consumer '{name}' exited during startup")]
    Died {
        /// Name of the consumer.
        name: String,
    },

    /// The queue configuration cannot be used.
    #[error("consumer '{name}' has an invalid queue configuration: {reason}")]
    InvalidQueue {
        /// Name of the consumer.
        name: String,
        /// What is wrong with the configuration.
        reason: String,
    },

    /// Thread or semaphore creation failed.
    #[error(transparent)]
    Sync(#[from] tandem_sync::SyncError),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::callback::ConsumerCallback;
    pub use crate::consumer::{
        Backend, ConsumerLoop, ConsumerState, ConsumerStatus, Opcode, TickReport,
    };
    pub use crate::diagnostics::{Diagnostic, DiagnosticSink};
    pub use crate::handle::{Handle, HandleAllocator, HandleTable};
    pub use crate::ring::{CommandQueue, Op, OverflowPolicy, PutError, QueueConfig, Record};
    pub use crate::submit::Submitter;
    pub use crate::threaded::ConsumerThread;
    pub use crate::{CommandError, ConsumerError, HandleError, SubmitError};
}
