//! Bounded FIFO command queue shared between producers and one consumer.
//!
//! A [`CommandQueue`] is the only structure in the core that more than one
//! thread mutates. Its indices and storage sit behind a single mutex; any
//! number of producer threads may [`put`](CommandQueue::put) and exactly one
//! consumer drains it with the non-blocking [`get`](CommandQueue::get).
//!
//! Every record receives a sequence number under the queue lock, so sequence
//! order and removal order are the same. Nothing is promised about the
//! relative order of records in *different* queues.
//!
//! # Overflow
//!
//! What happens when a producer finds the queue full is an explicit
//! per-queue [`OverflowPolicy`]:
//!
//! | Policy | Effect of `put` on a full queue |
//! |--------|---------------------------------|
//! | `Reject` | returns [`PutError::Full`] with the command; queue unchanged |
//! | `Block` | waits until the consumer frees a slot (or the queue closes) |
//! | `Grow` | doubles the capacity and enqueues |

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use tandem_sync::mutex::{Condvar, Mutex};
use tracing::{debug, trace};

// ---------------------------------------------------------------------------
// Policy and configuration
// ---------------------------------------------------------------------------

/// Behaviour of [`CommandQueue::put`] when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the command and hand it back to the producer.
    #[default]
    Reject,
    /// Block the producer until space is available.
    Block,
    /// Double the capacity.
    Grow,
}

/// Construction parameters for a [`CommandQueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of records the queue holds before the overflow policy applies.
    pub capacity: usize,
    /// What a producer experiences when the queue is full.
    pub policy: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            policy: OverflowPolicy::Reject,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// What the consumer should do with a record.
#[derive(Debug)]
pub enum Op<C> {
    /// Apply a subsystem command.
    Apply(C),
    /// Shut the consumer down after finishing the current tick.
    Terminate,
}

/// A queued command together with its position in the queue's history.
#[derive(Debug)]
pub struct Record<C> {
    /// Monotonic, gap-free per queue; equal to the enqueue order.
    pub sequence: u64,
    /// The operation to perform.
    pub op: Op<C>,
}

/// Why a [`CommandQueue::put`] did not enqueue. Carries the command back.
pub enum PutError<C> {
    /// The queue is at capacity under [`OverflowPolicy::Reject`].
    Full(C),
    /// The queue no longer accepts records (consumer shut down).
    Closed(C),
}

impl<C> PutError<C> {
    /// Recover the command that was not enqueued.
    pub fn into_inner(self) -> C {
        match self {
            PutError::Full(c) | PutError::Closed(c) => c,
        }
    }
}

impl<C> fmt::Debug for PutError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PutError::Full(_) => f.write_str("PutError::Full(..)"),
            PutError::Closed(_) => f.write_str("PutError::Closed(..)"),
        }
    }
}

impl<C> fmt::Display for PutError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PutError::Full(_) => f.write_str("command queue is full"),
            PutError::Closed(_) => f.write_str("command queue is closed"),
        }
    }
}

impl<C> std::error::Error for PutError<C> {}

/// Counters describing a queue's history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Records ever enqueued (including terminate records).
    pub total_enqueued: u64,
    /// Largest number of records held at once.
    pub high_water: usize,
    /// Puts refused under [`OverflowPolicy::Reject`].
    pub rejected: u64,
    /// Times the capacity was doubled under [`OverflowPolicy::Grow`].
    pub grown: u32,
    /// Records dropped by [`CommandQueue::discard_pending`].
    pub discarded: u64,
}

// ---------------------------------------------------------------------------
// CommandQueue
// ---------------------------------------------------------------------------

struct QueueState<C> {
    records: VecDeque<Record<C>>,
    capacity: usize,
    next_sequence: u64,
    closed: bool,
    stats: QueueStats,
}

/// A bounded multi-producer, single-consumer FIFO of commands.
pub struct CommandQueue<C> {
    name: String,
    policy: OverflowPolicy,
    state: Mutex<QueueState<C>>,
    not_full: Condvar,
}

impl<C> CommandQueue<C> {
    /// Create a queue.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(name: &str, capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity > 0, "command queue '{name}' needs a non-zero capacity");
        Self {
            name: name.to_owned(),
            policy,
            state: Mutex::new(
                "command_queue",
                QueueState {
                    records: VecDeque::with_capacity(capacity),
                    capacity,
                    next_sequence: 0,
                    closed: false,
                    stats: QueueStats::default(),
                },
            ),
            not_full: Condvar::new(),
        }
    }

    /// Create a queue from a [`QueueConfig`].
    pub fn from_config(name: &str, config: &QueueConfig) -> Self {
        Self::new(name, config.capacity, config.policy)
    }

    /// Name given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Overflow policy given at creation.
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Enqueue a command, returning its sequence number.
    ///
    /// See the module docs for the behaviour on a full queue.
    pub fn put(&self, command: C) -> Result<u64, PutError<C>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PutError::Closed(command));
            }
            if state.records.len() < state.capacity {
                break;
            }
            match self.policy {
                OverflowPolicy::Reject => {
                    state.stats.rejected += 1;
                    trace!(queue = %self.name, capacity = state.capacity, "put rejected, queue full");
                    return Err(PutError::Full(command));
                }
                OverflowPolicy::Block => {
                    trace!(queue = %self.name, "put blocking, queue full");
                    self.not_full.wait(&mut state);
                }
                OverflowPolicy::Grow => {
                    state.capacity *= 2;
                    state.stats.grown += 1;
                    debug!(queue = %self.name, capacity = state.capacity, "command queue grown");
                }
            }
        }
        Ok(Self::push(&mut state, Op::Apply(command)))
    }

    /// Enqueue a terminate record, ignoring capacity.
    ///
    /// Returns `None` if the queue is already closed.
    pub fn put_terminate(&self) -> Option<u64> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        Some(Self::push(&mut state, Op::Terminate))
    }

    /// Pop the oldest record, or `None` if the queue is empty. Never blocks.
    pub fn get(&self) -> Option<Record<C>> {
        let mut state = self.state.lock();
        let record = state.records.pop_front()?;
        drop(state);
        if self.policy == OverflowPolicy::Block {
            self.not_full.notify_one();
        }
        Some(record)
    }

    /// Stop accepting records and wake every blocked producer.
    ///
    /// Records already queued stay available to [`get`](Self::get).
    pub fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            debug!(queue = %self.name, pending = state.records.len(), "command queue closed");
        }
        drop(state);
        self.not_full.notify_all();
    }

    /// Drop every queued record, returning how many were dropped.
    ///
    /// Records are dropped, not applied; callbacks they carry are never
    /// invoked.
    pub fn discard_pending(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.records.len();
        let records = std::mem::take(&mut state.records);
        state.stats.discarded += dropped as u64;
        drop(state);
        // Command payloads may own callbacks; drop them outside the lock.
        drop(records);
        self.not_full.notify_all();
        dropped
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of queued records.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether the queue holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current capacity (changes only under [`OverflowPolicy::Grow`]).
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Snapshot of the queue's counters.
    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats
    }

    fn push(state: &mut QueueState<C>, op: Op<C>) -> u64 {
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.records.push_back(Record { sequence, op });
        state.stats.total_enqueued += 1;
        state.stats.high_water = state.stats.high_water.max(state.records.len());
        sequence
    }
}

impl<C> fmt::Debug for CommandQueue<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("len", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn drain(q: &CommandQueue<u32>) -> Vec<u32> {
        let mut out = Vec::new();
        while let Some(record) = q.get() {
            if let Op::Apply(v) = record.op {
                out.push(v);
            }
        }
        out
    }

    #[test]
    fn fifo_order_and_sequences() {
        let q = CommandQueue::new("fifo", 16, OverflowPolicy::Reject);
        for i in 0..10u32 {
            assert_eq!(q.put(i).unwrap(), u64::from(i));
        }
        let mut expected_seq = 0;
        while let Some(record) = q.get() {
            assert_eq!(record.sequence, expected_seq);
            assert!(matches!(record.op, Op::Apply(v) if u64::from(v) == expected_seq));
            expected_seq += 1;
        }
        assert_eq!(expected_seq, 10);
    }

    #[test]
    fn get_on_empty_returns_none() {
        let q: CommandQueue<u32> = CommandQueue::new("empty", 4, OverflowPolicy::Reject);
        assert!(q.get().is_none());
    }

    #[test]
    fn reject_leaves_contents_unchanged() {
        let q = CommandQueue::new("reject", 3, OverflowPolicy::Reject);
        for i in 0..3u32 {
            q.put(i).unwrap();
        }
        for _ in 0..5 {
            match q.put(99) {
                Err(PutError::Full(v)) => assert_eq!(v, 99),
                other => panic!("expected Full, got {other:?}"),
            }
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.stats().rejected, 5);
        assert_eq!(drain(&q), vec![0, 1, 2]);
    }

    #[test]
    fn grow_doubles_capacity() {
        let q = CommandQueue::new("grow", 2, OverflowPolicy::Grow);
        for i in 0..5u32 {
            q.put(i).unwrap();
        }
        assert_eq!(q.capacity(), 8);
        assert_eq!(q.stats().grown, 2);
        assert_eq!(drain(&q), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn block_waits_for_consumer() {
        let q = Arc::new(CommandQueue::new("block", 1, OverflowPolicy::Block));
        q.put(1u32).unwrap();
        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || q.put(2u32).is_ok())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(q.len(), 1, "producer must be blocked");
        assert!(matches!(q.get().map(|r| r.op), Some(Op::Apply(1))));
        assert!(producer.join().unwrap());
        assert_eq!(drain(&q), vec![2]);
    }

    #[test]
    fn close_releases_blocked_producer() {
        let q = Arc::new(CommandQueue::new("close", 1, OverflowPolicy::Block));
        q.put(1u32).unwrap();
        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || matches!(q.put(2u32), Err(PutError::Closed(2))))
        };
        std::thread::sleep(Duration::from_millis(20));
        q.close();
        assert!(producer.join().unwrap());
        assert!(q.put_terminate().is_none());
        assert_eq!(drain(&q), vec![1]);
    }

    #[test]
    fn terminate_ignores_capacity() {
        let q = CommandQueue::new("terminate", 1, OverflowPolicy::Reject);
        q.put(1u32).unwrap();
        assert_eq!(q.put_terminate(), Some(1));
        assert!(matches!(q.get().map(|r| r.op), Some(Op::Apply(1))));
        assert!(matches!(q.get().map(|r| r.op), Some(Op::Terminate)));
    }

    #[test]
    fn discard_pending_counts() {
        let q = CommandQueue::new("discard", 8, OverflowPolicy::Reject);
        for i in 0..4u32 {
            q.put(i).unwrap();
        }
        assert_eq!(q.discard_pending(), 4);
        assert!(q.is_empty());
        assert_eq!(q.stats().discarded, 4);
        assert_eq!(q.stats().high_water, 4);
    }

    #[test]
    fn multiple_producers_preserve_per_producer_order() {
        let q = Arc::new(CommandQueue::new("mp", 64, OverflowPolicy::Block));
        let producers: Vec<_> = (0..4u32)
            .map(|p| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for i in 0..500u32 {
                        q.put(p * 10_000 + i).unwrap();
                    }
                })
            })
            .collect();

        let mut last = [None::<u32>; 4];
        let mut received = 0;
        let mut last_seq = None;
        while received < 2000 {
            if let Some(record) = q.get() {
                if let Some(prev) = last_seq {
                    assert_eq!(record.sequence, prev + 1);
                }
                last_seq = Some(record.sequence);
                if let Op::Apply(v) = record.op {
                    let p = (v / 10_000) as usize;
                    let i = v % 10_000;
                    if let Some(prev) = last[p] {
                        assert!(i > prev, "producer {p} reordered: {prev} then {i}");
                    }
                    last[p] = Some(i);
                    received += 1;
                }
            } else {
                std::thread::yield_now();
            }
        }
        for p in producers {
            p.join().unwrap();
        }
    }
}
