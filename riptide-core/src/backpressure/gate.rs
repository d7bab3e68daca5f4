//! Serializes one item-emitting path against terminal signals racing in
//! from other threads (timeouts, gate publishers, inner errors), so the
//! downstream keeps seeing a sequential, terminal-once signal stream.
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::backpressure::{Terminal, TerminalLatch};
use crate::error::FlowError;
use crate::flow::Subscriber;

/// Once a terminal has been published the counter never returns to zero,
/// which is what locks item emission out for good.
pub(crate) struct SignalGate {
    wip: AtomicUsize,
    latch: TerminalLatch,
}

impl SignalGate {
    pub(crate) fn new() -> Self {
        SignalGate {
            wip: AtomicUsize::new(0),
            latch: TerminalLatch::new(),
        }
    }

    /// Emit an item unless a terminal beat it. Returns false if the item
    /// was dropped. Only one thread at a time may be the item path.
    pub(crate) fn next<T>(&self, downstream: &dyn Subscriber<T>, item: T) -> bool {
        if self
            .wip
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        downstream.on_next(item);
        if self.wip.fetch_sub(1, Ordering::AcqRel) - 1 != 0 {
            // a terminal arrived while we were emitting; it is ours to
            // deliver, and the counter stays pinned above zero
            self.emit_terminal(downstream);
        }
        true
    }

    pub(crate) fn error<T>(&self, downstream: &dyn Subscriber<T>, error: FlowError) {
        if self.latch.error(error) && self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
            self.emit_terminal(downstream);
        }
    }

    pub(crate) fn complete<T>(&self, downstream: &dyn Subscriber<T>) {
        if self.latch.complete() && self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
            self.emit_terminal(downstream);
        }
    }

    fn emit_terminal<T>(&self, downstream: &dyn Subscriber<T>) {
        match self.latch.get() {
            Some(Terminal::Complete) => downstream.on_complete(),
            Some(Terminal::Errored(error)) => downstream.on_error(error.clone()),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::TestSubscriber;

    #[test]
    fn items_flow_until_terminal() {
        let ts: Arc<TestSubscriber<i32>> = TestSubscriber::new(u64::MAX);
        let gate = SignalGate::new();
        assert!(gate.next(ts.as_ref(), 1));
        assert!(gate.next(ts.as_ref(), 2));
        gate.complete(ts.as_ref());
        assert!(!gate.next(ts.as_ref(), 3));
        ts.assert_values(&[1, 2]);
        ts.assert_complete();
    }

    #[test]
    fn second_terminal_is_dropped() {
        let ts: Arc<TestSubscriber<i32>> = TestSubscriber::new(u64::MAX);
        let gate = SignalGate::new();
        gate.error(ts.as_ref(), FlowError::MissingBackpressure);
        gate.complete(ts.as_ref());
        ts.assert_error(&FlowError::MissingBackpressure);
    }
}
