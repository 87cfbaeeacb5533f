//! Named OS threads with explicit stack size and start mode.

use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::SyncError;

/// How a spawned thread relates to its spawner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    /// The thread runs independently; it can never be joined.
    Detached,
    /// The spawner keeps a join handle and may wait for the thread to finish.
    Joinable,
}

/// A spawned thread.
///
/// Dropping a joinable `Thread` without calling [`join`](Self::join) detaches
/// it.
#[derive(Debug)]
pub struct Thread {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Name given at spawn time.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether [`join`](Self::join) will actually wait for the thread.
    pub fn is_joinable(&self) -> bool {
        self.handle.is_some()
    }

    /// Whether the thread's routine has returned. Always `false` for detached
    /// threads, whose completion cannot be observed here.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_finished())
    }

    /// Wait for a joinable thread to finish. Detached threads return
    /// immediately.
    pub fn join(mut self) -> Result<(), SyncError> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| SyncError::ThreadPanicked {
                name: self.name.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Spawn a named thread.
///
/// A `stack_size` of zero uses the platform default.
pub fn spawn<F>(
    name: &str,
    stack_size: usize,
    mode: StartMode,
    routine: F,
) -> Result<Thread, SyncError>
where
    F: FnOnce() + Send + 'static,
{
    let mut builder = std::thread::Builder::new().name(name.to_owned());
    if stack_size > 0 {
        builder = builder.stack_size(stack_size);
    }
    let handle = builder.spawn(routine).map_err(|source| SyncError::ThreadSpawn {
        name: name.to_owned(),
        source,
    })?;

    debug!(thread = name, stack_size, ?mode, "thread spawned");

    let handle = match mode {
        StartMode::Joinable => Some(handle),
        StartMode::Detached => None,
    };
    Ok(Thread {
        name: name.to_owned(),
        handle,
    })
}

/// Put the calling thread to sleep for `milliseconds`.
pub fn sleep_ms(milliseconds: u32) {
    std::thread::sleep(Duration::from_millis(u64::from(milliseconds)));
}

/// Put the calling thread to sleep for `microseconds`.
pub fn sleep_us(microseconds: u32) {
    std::thread::sleep(Duration::from_micros(u64::from(microseconds)));
}
