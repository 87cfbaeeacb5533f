//! Named mutual exclusion.
//!
//! [`Mutex`] wraps [`parking_lot::Mutex`] and carries a static name so that
//! contended acquisitions can be traced back to the lock that caused them.
//! Unlocking happens when the returned [`MutexGuard`] is dropped.

use std::time::Duration;

use tracing::trace;

pub use parking_lot::{Condvar, MutexGuard};

/// A named mutex.
///
/// The guard type is [`parking_lot::MutexGuard`], so a [`Condvar`] can wait on
/// it directly.
pub struct Mutex<T> {
    name: &'static str,
    raw: parking_lot::Mutex<T>,
}

impl<T> Mutex<T> {
    /// Create a new unlocked mutex protecting `value`.
    pub fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            raw: parking_lot::Mutex::new(value),
        }
    }

    /// Name given at creation.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire the lock, blocking the calling thread until it is available.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        if let Some(guard) = self.raw.try_lock() {
            return guard;
        }
        trace!(mutex = self.name, "lock contended, blocking");
        self.raw.lock()
    }

    /// Attempt to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.raw.try_lock()
    }

    /// Attempt to acquire the lock, giving up after `timeout`.
    pub fn lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, T>> {
        self.raw.try_lock_for(timeout)
    }

    /// Mutable access without locking; the borrow checker proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.raw.get_mut()
    }

    /// Consume the mutex and return the protected value.
    pub fn into_inner(self) -> T {
        self.raw.into_inner()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new("unnamed", T::default())
    }
}

impl<T> std::fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("name", &self.name)
            .field("locked", &self.raw.is_locked())
            .finish()
    }
}
