use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::backpressure::RelaySubscription;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Upstream};
use crate::types::Element;

/// Replay a flow several times
pub trait Repeat<T>: super::sealed::Sealed {
    /// Play the whole sequence `times` times, resubscribing on each
    /// completion. `repeat(0)` is empty; use `u64::MAX` for "forever".
    /// Outstanding demand carries across the resubscriptions.
    fn repeat(self, times: u64) -> Flow<T>;
}

impl<T: Element> Repeat<T> for Flow<T> {
    fn repeat(self, times: u64) -> Flow<T> {
        Flow::new(RepeatPublisher {
            upstream: self,
            times,
        })
    }
}

struct RepeatPublisher<T> {
    upstream: Flow<T>,
    times: u64,
}

impl<T: Element> Publisher<T> for RepeatPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        if self.times == 0 {
            subscriber.on_subscribe(Upstream::plain(Arc::new(crate::flow::NoopSubscription)));
            subscriber.on_complete();
            return;
        }
        let adapter = Arc::new_cyclic(|this: &Weak<RepeatSubscriber<T>>| RepeatSubscriber {
            this: this.clone(),
            source: self.upstream.clone(),
            downstream: subscriber.clone(),
            relay: Arc::new(RelaySubscription::new()),
            remaining: AtomicU64::new(self.times),
            wip: AtomicUsize::new(0),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.relay.clone()));
        adapter.resubscribe();
    }
}

struct RepeatSubscriber<T> {
    this: Weak<RepeatSubscriber<T>>,
    source: Flow<T>,
    downstream: Arc<dyn Subscriber<T>>,
    relay: Arc<RelaySubscription<T>>,
    remaining: AtomicU64,
    /// trampoline counter keeping synchronous completions off the stack
    wip: AtomicUsize,
}

impl<T: Element> RepeatSubscriber<T> {
    fn resubscribe(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            if !self.relay.is_cancelled() {
                if let Some(this) = self.this.upgrade() {
                    self.source.subscribe(this);
                }
            }
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                return;
            }
        }
    }
}

impl<T: Element> Subscriber<T> for RepeatSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.relay.set_upstream(upstream);
    }

    fn on_next(&self, item: T) {
        self.relay.produced(1);
        self.downstream.on_next(item);
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        let remaining = self.remaining.load(Ordering::Relaxed);
        if remaining != u64::MAX {
            let left = remaining - 1;
            self.remaining.store(left, Ordering::Relaxed);
            if left == 0 {
                self.downstream.on_complete();
                return;
            }
        }
        self.resubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSubscriber;

    #[test]
    fn plays_the_sequence_that_many_times() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 2).repeat(3).subscribe(ts.clone());
        ts.assert_values(&[0, 1, 0, 1, 0, 1]);
        ts.assert_complete();
    }

    #[test]
    fn repeat_zero_is_empty() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 5).repeat(0).subscribe(ts.clone());
        ts.assert_values(&[]);
        ts.assert_complete();
    }

    #[test]
    fn demand_spans_repetitions() {
        let ts = TestSubscriber::new(3);
        Flow::range(0, 2).repeat(2).subscribe(ts.clone());
        ts.assert_values(&[0, 1, 0]);
        ts.assert_no_terminal();
        ts.request(1);
        ts.assert_values(&[0, 1, 0, 1]);
        ts.assert_complete();
    }

    #[test]
    fn cancellation_stops_the_loop() {
        let ts = TestSubscriber::new(2);
        Flow::range(0, 1).repeat(u64::MAX).subscribe(ts.clone());
        ts.cancel();
        ts.request(100);
        assert!(ts.value_count() <= 3);
    }
}
