//! Result delivery from the consumer back to producers.

use std::fmt;
use std::sync::mpsc;

/// A one-shot function the consumer calls with a query's result.
///
/// The callback runs **on the consumer thread**, during the tick that
/// evaluates the query, and never on the producer that created it. Anything it
/// captures must therefore be `Send`, and it must not block: the consumer's
/// tick is waiting on it. Forward the result (through a channel or an atomic)
/// rather than doing heavy work inline.
///
/// `FnOnce` makes a second invocation impossible; the consumer invokes every
/// query it evaluates exactly once. A query discarded unevaluated (queued
/// behind a terminate record, or still pending when the consumer finishes)
/// is dropped without its callback ever running. Captured state is dropped
/// with it, which is what disconnects a [`channel`](Self::channel) receiver.
pub struct ConsumerCallback<R: ?Sized> {
    f: Box<dyn FnOnce(&R) + Send + 'static>,
}

impl<R: ?Sized> ConsumerCallback<R> {
    /// Wrap a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&R) + Send + 'static,
    {
        Self { f: Box::new(f) }
    }

    /// Deliver `result`, consuming the callback.
    pub fn invoke(self, result: &R) {
        (self.f)(result)
    }
}

impl<R: Clone + Send + 'static> ConsumerCallback<R> {
    /// A callback that forwards a clone of its result into a channel.
    ///
    /// The receiver yields exactly one value once the query has been
    /// evaluated, or disconnects if the query is discarded.
    pub fn channel() -> (Self, mpsc::Receiver<R>) {
        let (tx, rx) = mpsc::sync_channel(1);
        let callback = Self::new(move |result: &R| {
            // The receiver may have been dropped; the result is then unwanted.
            let _ = tx.try_send(result.clone());
        });
        (callback, rx)
    }
}

impl<R: ?Sized> fmt::Debug for ConsumerCallback<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConsumerCallback(..)")
    }
}
