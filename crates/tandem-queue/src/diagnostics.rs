//! Bounded record of absorbed command failures.
//!
//! The consumer never propagates a command failure back through the queue.
//! Instead it logs it and pushes a [`Diagnostic`] here, where the producer
//! side (usually the host, once per frame) can drain it.

use std::collections::VecDeque;

use tandem_sync::mutex::Mutex;

use crate::CommandError;

/// Default number of diagnostics retained before the oldest are dropped.
pub const DEFAULT_DIAGNOSTIC_CAPACITY: usize = 256;

/// One failed command.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    /// Sequence number of the record in its queue.
    pub sequence: u64,
    /// Name of the backend that rejected it.
    pub subsystem: String,
    /// Opcode of the failed command.
    pub opcode: &'static str,
    /// Why it failed.
    pub error: CommandError,
}

#[derive(Debug, Default)]
struct SinkState {
    entries: VecDeque<Diagnostic>,
    dropped: u64,
}

/// Thread-safe ring of recent [`Diagnostic`]s.
#[derive(Debug)]
pub struct DiagnosticSink {
    state: Mutex<SinkState>,
    capacity: usize,
}

impl DiagnosticSink {
    /// Create a sink retaining at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new("diagnostic_sink", SinkState::default()),
            capacity: capacity.max(1),
        }
    }

    /// Record a failure, evicting the oldest entry if the sink is full.
    pub fn push(&self, diagnostic: Diagnostic) {
        let mut state = self.state.lock();
        if state.entries.len() == self.capacity {
            state.entries.pop_front();
            state.dropped += 1;
        }
        state.entries.push_back(diagnostic);
    }

    /// Take every retained entry, oldest first.
    pub fn drain(&self) -> Vec<Diagnostic> {
        self.state.lock().entries.drain(..).collect()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether no entries are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries evicted because the sink was full.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}

impl Default for DiagnosticSink {
    fn default() -> Self {
        Self::new(DEFAULT_DIAGNOSTIC_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Handle;

    fn stale(sequence: u64) -> Diagnostic {
        Diagnostic {
            sequence,
            subsystem: "test".into(),
            opcode: "poke",
            error: CommandError::StaleHandle {
                handle: Handle::new(1, 0),
            },
        }
    }

    #[test]
    fn drain_returns_oldest_first_and_empties() {
        let sink = DiagnosticSink::new(8);
        sink.push(stale(1));
        sink.push(stale(2));
        let drained: Vec<u64> = sink.drain().iter().map(|d| d.sequence).collect();
        assert_eq!(drained, vec![1, 2]);
        assert!(sink.is_empty());
    }

    #[test]
    fn full_sink_evicts_oldest() {
        let sink = DiagnosticSink::new(2);
        for seq in 0..5 {
            sink.push(stale(seq));
        }
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.dropped(), 3);
        let drained: Vec<u64> = sink.drain().iter().map(|d| d.sequence).collect();
        assert_eq!(drained, vec![3, 4]);
    }
}
