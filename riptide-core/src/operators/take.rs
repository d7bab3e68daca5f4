use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::backpressure::SubscriptionSlot;
use crate::error::FlowError;
use crate::flow::{Flow, NoopSubscription, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

/// Emit only the first items of a flow
pub trait Take<T>: super::sealed::Sealed {
    /// Emit the first `count` items, then complete and cancel upstream.
    /// Downstream requests pass through untouched; whatever upstream
    /// produces past the cut-off is dropped. `take(0)` completes without
    /// requesting anything.
    fn take(self, count: u64) -> Flow<T>;

    /// Cap the total demand sent upstream at `count` and complete after
    /// that many items: the variant for upstreams that must never see
    /// more demand than they can serve.
    fn limit_request(self, count: u64) -> Flow<T>;
}

impl<T: Element> Take<T> for Flow<T> {
    fn take(self, count: u64) -> Flow<T> {
        Flow::new(TakePublisher {
            upstream: self,
            count,
            limit: false,
        })
    }

    fn limit_request(self, count: u64) -> Flow<T> {
        Flow::new(TakePublisher {
            upstream: self,
            count,
            limit: true,
        })
    }
}

struct TakePublisher<T> {
    upstream: Flow<T>,
    count: u64,
    limit: bool,
}

impl<T: Element> Publisher<T> for TakePublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        if self.count == 0 {
            subscriber.on_subscribe(Upstream::plain(Arc::new(NoopSubscription)));
            subscriber.on_complete();
            return;
        }
        let adapter = Arc::new(TakeSubscriber {
            downstream: subscriber.clone(),
            remaining: AtomicU64::new(self.count),
            to_request: AtomicU64::new(self.count),
            limit: self.limit,
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

struct TakeSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    remaining: AtomicU64,
    /// demand budget still grantable upstream in limit mode
    to_request: AtomicU64,
    limit: bool,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T: Element> Subscriber<T> for TakeSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.upstream.set(upstream);
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let mut remaining = self.remaining.load(Ordering::Relaxed);
        loop {
            if remaining == 0 {
                return;
            }
            match self.remaining.compare_exchange_weak(
                remaining,
                remaining - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => remaining = observed,
            }
        }
        self.downstream.on_next(item);
        if remaining == 1 {
            // that was the cut-off item
            self.done.store(true, Ordering::Release);
            self.upstream.cancel();
            self.downstream.on_complete();
        }
    }

    fn on_error(&self, error: FlowError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.downstream.on_error(error);
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.downstream.on_complete();
        }
    }
}

impl<T: Element> Subscription for TakeSubscriber<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        if !self.limit {
            self.upstream.request(n);
            return;
        }
        // grant at most the remaining budget
        let mut budget = self.to_request.load(Ordering::Relaxed);
        loop {
            if budget == 0 {
                return;
            }
            let grant = budget.min(n);
            match self.to_request.compare_exchange_weak(
                budget,
                budget - grant,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.upstream.request(grant);
                    return;
                }
                Err(observed) => budget = observed,
            }
        }
    }

    fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        self.upstream.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestPublisher, TestSubscriber};

    #[test]
    fn completes_after_the_cut_off() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 100).take(3).subscribe(ts.clone());
        ts.assert_values(&[0, 1, 2]);
        ts.assert_complete();
    }

    #[test]
    fn take_zero_is_empty_and_requests_nothing() {
        let publisher = TestPublisher::<i32>::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher.flow().take(0).subscribe(ts.clone());
        assert_eq!(publisher.requested(), 0);
        assert!(!publisher.has_subscriber());
        ts.assert_complete();
    }

    #[test]
    fn cancels_upstream_at_the_cut_off() {
        let publisher = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher.flow().take(2).subscribe(ts.clone());
        publisher.emit(1);
        publisher.emit(2);
        assert!(publisher.is_cancelled());
        ts.assert_values(&[1, 2]);
        ts.assert_complete();
    }

    #[test]
    fn excess_production_is_dropped() {
        let publisher = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher.flow().take(1).subscribe(ts.clone());
        publisher.emit(1);
        publisher.emit(2);
        publisher.emit(3);
        ts.assert_values(&[1]);
        ts.assert_complete();
    }

    #[test]
    fn limit_request_caps_upstream_demand() {
        let publisher = TestPublisher::<i32>::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher.flow().limit_request(5).subscribe(ts.clone());
        assert_eq!(publisher.requested(), 5);
        ts.request(100);
        assert_eq!(publisher.requested(), 5);
    }

    #[test]
    fn limit_request_grants_in_pieces() {
        let publisher = TestPublisher::<i32>::new();
        let ts = TestSubscriber::new(2);
        publisher.flow().limit_request(5).subscribe(ts.clone());
        assert_eq!(publisher.requested(), 2);
        ts.request(2);
        assert_eq!(publisher.requested(), 4);
        ts.request(10);
        assert_eq!(publisher.requested(), 5);
    }
}
