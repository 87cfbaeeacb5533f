//! Counting semaphore.
//!
//! A [`Semaphore`] holds a count between zero and a fixed maximum. `wait`
//! blocks while the count is zero and then decrements it; `post` increments it
//! (saturating at the maximum) and wakes waiters.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::SyncError;

/// A counting semaphore with an initial and a maximum count.
#[derive(Debug)]
pub struct Semaphore {
    count: Mutex<u32>,
    available: Condvar,
    max: u32,
}

impl Semaphore {
    /// Create a semaphore.
    ///
    /// Fails with [`SyncError::InvalidSemaphore`] when `max` is zero or
    /// `initial` exceeds `max`.
    pub fn new(initial: u32, max: u32) -> Result<Self, SyncError> {
        if max == 0 || initial > max {
            return Err(SyncError::InvalidSemaphore { initial, max });
        }
        Ok(Self {
            count: Mutex::new(initial),
            available: Condvar::new(),
            max,
        })
    }

    /// Block until the count is positive, then decrement it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    ///
    /// Returns `true` if the semaphore was acquired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if self.available.wait_until(&mut count, deadline).timed_out() {
                break;
            }
        }
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Decrement the count if it is positive, without blocking.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Increment the count by `n`, saturating at the maximum.
    ///
    /// Returns how many units were actually added.
    pub fn post(&self, n: u32) -> u32 {
        let mut count = self.count.lock();
        let added = n.min(self.max - *count);
        if added < n {
            debug!(
                requested = n,
                added,
                max = self.max,
                "semaphore post saturated at maximum count"
            );
        }
        *count += added;
        drop(count);
        for _ in 0..added {
            self.available.notify_one();
        }
        added
    }

    /// Current count.
    pub fn count(&self) -> u32 {
        *self.count.lock()
    }

    /// Maximum count given at creation.
    pub fn max_count(&self) -> u32 {
        self.max
    }
}
