//! Producer-side façade shared by every subsystem.
//!
//! Subsystem contexts (physics, render) wrap a [`Submitter`] and turn their
//! typed methods into commands. Every method returns as soon as the command is
//! queued; the effect becomes visible after the consumer's next tick.

use std::sync::Arc;

use tracing::trace;

use crate::handle::{Handle, HandleAllocator};
use crate::ring::{CommandQueue, PutError};
use crate::{HandleError, SubmitError};

/// Enqueues commands and reserves handles on behalf of producers.
pub struct Submitter<C> {
    queue: Arc<CommandQueue<C>>,
    allocator: Arc<HandleAllocator>,
}

impl<C> Clone for Submitter<C> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            allocator: Arc::clone(&self.allocator),
        }
    }
}

impl<C> Submitter<C> {
    /// Create a submitter for `queue` that reserves handles from `allocator`.
    pub fn new(queue: Arc<CommandQueue<C>>, allocator: Arc<HandleAllocator>) -> Self {
        Self { queue, allocator }
    }

    /// Enqueue a command. Returns the record's sequence number.
    pub fn submit(&self, command: C) -> Result<u64, SubmitError> {
        self.queue.put(command).map_err(|e| self.put_error(e))
    }

    /// Reserve a handle, build a creation command around it and enqueue it.
    ///
    /// The handle is returned immediately, before the object exists; commands
    /// that use it may be queued right away. If the command cannot be queued
    /// the reservation is cancelled and the error returned.
    pub fn submit_create<F>(&self, build: F) -> Result<Handle, SubmitError>
    where
        F: FnOnce(Handle) -> C,
    {
        let handle = self.allocator.reserve().map_err(|e| match e {
            HandleError::Exhausted { capacity } => SubmitError::HandlesExhausted { capacity },
            // reserve() only ever reports exhaustion
            HandleError::Stale { .. } | HandleError::Occupied { .. } => {
                SubmitError::HandlesExhausted {
                    capacity: self.allocator.max_slots(),
                }
            }
        })?;
        match self.queue.put(build(handle)) {
            Ok(sequence) => {
                trace!(queue = self.queue.name(), %handle, sequence, "creation queued");
                Ok(handle)
            }
            Err(e) => {
                self.allocator.recycle(handle);
                Err(self.put_error(e))
            }
        }
    }

    /// Records queued and not yet consumed.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// The underlying queue.
    pub fn queue(&self) -> &Arc<CommandQueue<C>> {
        &self.queue
    }

    /// The shared handle allocator.
    pub fn allocator(&self) -> &Arc<HandleAllocator> {
        &self.allocator
    }

    fn put_error(&self, err: PutError<C>) -> SubmitError {
        let queue = self.queue.name().to_owned();
        match err {
            PutError::Full(_) => SubmitError::QueueFull { queue },
            PutError::Closed(_) => SubmitError::QueueClosed { queue },
        }
    }
}

impl<C> std::fmt::Debug for Submitter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submitter")
            .field("queue", &self.queue.name())
            .field("pending", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{Op, OverflowPolicy};

    fn submitter(capacity: usize, slots: u32) -> Submitter<(Handle, u32)> {
        Submitter::new(
            Arc::new(CommandQueue::new("test", capacity, OverflowPolicy::Reject)),
            Arc::new(HandleAllocator::new(slots)),
        )
    }

    #[test]
    fn submit_create_returns_handle_before_consumption() {
        let s = submitter(4, 4);
        let h = s.submit_create(|h| (h, 1)).unwrap();
        assert!(h.is_valid());
        assert!(s.allocator().is_live(h));
        assert_eq!(s.pending(), 1);
        match s.queue().get().map(|r| r.op) {
            Some(Op::Apply((queued, 1))) => assert_eq!(queued, h),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn full_queue_cancels_reservation() {
        let s = submitter(1, 4);
        s.submit((Handle::INVALID, 0)).unwrap();
        let err = s.submit_create(|h| (h, 1)).unwrap_err();
        assert_eq!(err, SubmitError::QueueFull { queue: "test".into() });
        assert_eq!(s.allocator().live_count(), 0);
        assert_eq!(s.pending(), 1);
    }

    #[test]
    fn exhausted_handles_enqueue_nothing() {
        let s = submitter(8, 1);
        s.submit_create(|h| (h, 1)).unwrap();
        let err = s.submit_create(|h| (h, 2)).unwrap_err();
        assert_eq!(err, SubmitError::HandlesExhausted { capacity: 1 });
        assert_eq!(s.pending(), 1);
    }

    #[test]
    fn closed_queue_is_reported() {
        let s = submitter(4, 4);
        s.queue().close();
        assert_eq!(
            s.submit((Handle::INVALID, 0)).unwrap_err(),
            SubmitError::QueueClosed { queue: "test".into() }
        );
    }
}
