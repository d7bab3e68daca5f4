use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backpressure::RelaySubscription;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Upstream};
use crate::types::Element;

/// Substitutes for flows that complete without items
pub trait DefaultIfEmpty<T>: super::sealed::Sealed {
    /// Emit `fallback` if the flow completes without a single item.
    fn default_if_empty(self, fallback: T) -> Flow<T>
    where
        T: Clone + Sync;

    /// Switch to `fallback` if the flow completes without a single
    /// item. Outstanding downstream demand carries over to the
    /// fallback subscription.
    fn switch_if_empty(self, fallback: Flow<T>) -> Flow<T>;
}

impl<T: Element> DefaultIfEmpty<T> for Flow<T> {
    fn default_if_empty(self, fallback: T) -> Flow<T>
    where
        T: Clone + Sync,
    {
        self.switch_if_empty(Flow::just(fallback))
    }

    fn switch_if_empty(self, fallback: Flow<T>) -> Flow<T> {
        Flow::new(SwitchIfEmptyPublisher {
            upstream: self,
            fallback,
        })
    }
}

struct SwitchIfEmptyPublisher<T> {
    upstream: Flow<T>,
    fallback: Flow<T>,
}

impl<T: Element> Publisher<T> for SwitchIfEmptyPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let relay = Arc::new(RelaySubscription::new());
        subscriber.on_subscribe(Upstream::plain(relay.clone()));
        self.upstream.subscribe(Arc::new(PrimarySubscriber {
            downstream: subscriber,
            fallback: self.fallback.clone(),
            relay,
            non_empty: AtomicBool::new(false),
        }));
    }
}

struct PrimarySubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    fallback: Flow<T>,
    relay: Arc<RelaySubscription<T>>,
    non_empty: AtomicBool,
}

impl<T: Element> Subscriber<T> for PrimarySubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.relay.set_upstream(upstream);
    }

    fn on_next(&self, item: T) {
        self.non_empty.store(true, Ordering::Release);
        self.relay.produced(1);
        self.downstream.on_next(item);
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        if self.non_empty.load(Ordering::Acquire) || self.relay.is_cancelled() {
            self.downstream.on_complete();
        } else {
            self.fallback.subscribe(Arc::new(FallbackSubscriber {
                downstream: self.downstream.clone(),
                relay: self.relay.clone(),
            }));
        }
    }
}

struct FallbackSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    relay: Arc<RelaySubscription<T>>,
}

impl<T: Element> Subscriber<T> for FallbackSubscriber<T> {
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
        self.downstream.on_complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSubscriber;

    #[test]
    fn non_empty_flows_are_untouched() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(1, 2).default_if_empty(99).subscribe(ts.clone());
        ts.assert_values(&[1, 2]);
        ts.assert_complete();
    }

    #[test]
    fn empty_flows_yield_the_default() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 0).default_if_empty(99).subscribe(ts.clone());
        ts.assert_values(&[99]);
        ts.assert_complete();
    }

    #[test]
    fn switch_if_empty_runs_the_fallback_flow() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::<i64>::empty()
            .switch_if_empty(Flow::range(5, 3))
            .subscribe(ts.clone());
        ts.assert_values(&[5, 6, 7]);
        ts.assert_complete();
    }

    #[test]
    fn demand_carries_over_to_the_fallback() {
        let ts = TestSubscriber::new(2);
        Flow::<i64>::empty()
            .switch_if_empty(Flow::range(0, 10))
            .subscribe(ts.clone());
        ts.assert_values(&[0, 1]);
        ts.assert_no_terminal();
    }
}
