use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::backpressure::SubscriptionSlot;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

/// Drop the first items of a flow
pub trait Skip<T>: super::sealed::Sealed {
    /// Drop the first `count` items. The skipped amount is requested
    /// upstream on top of downstream demand, so downstream still gets
    /// everything it asked for.
    fn skip(self, count: u64) -> Flow<T>;
}

impl<T: Element> Skip<T> for Flow<T> {
    fn skip(self, count: u64) -> Flow<T> {
        Flow::new(SkipPublisher {
            upstream: self,
            count,
        })
    }
}

struct SkipPublisher<T> {
    upstream: Flow<T>,
    count: u64,
}

impl<T: Element> Publisher<T> for SkipPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let adapter = Arc::new(SkipSubscriber {
            downstream: subscriber.clone(),
            remaining: AtomicU64::new(self.count),
            skip: self.count,
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

struct SkipSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    remaining: AtomicU64,
    skip: u64,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T: Element> Subscriber<T> for SkipSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if self.upstream.set(upstream) && self.skip > 0 {
            // cover the items we are going to swallow
            self.upstream.request(self.skip);
        }
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let remaining = self.remaining.load(Ordering::Relaxed);
        if remaining > 0 {
            self.remaining.store(remaining - 1, Ordering::Relaxed);
            return;
        }
        self.downstream.on_next(item);
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

impl<T: Element> Subscription for SkipSubscriber<T> {
    fn request(&self, n: u64) {
        self.upstream.request(n);
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
    fn drops_the_prefix() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 6).skip(2).subscribe(ts.clone());
        ts.assert_values(&[2, 3, 4, 5]);
        ts.assert_complete();
    }

    #[test]
    fn skipping_more_than_the_flow_is_empty() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 3).skip(10).subscribe(ts.clone());
        ts.assert_values(&[]);
        ts.assert_complete();
    }

    #[test]
    fn requests_the_skipped_amount_on_top() {
        let publisher = TestPublisher::<i32>::new();
        let ts = TestSubscriber::new(4);
        publisher.flow().skip(3).subscribe(ts.clone());
        assert_eq!(publisher.requested(), 7);
    }
}
