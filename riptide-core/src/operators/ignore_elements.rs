use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backpressure::SubscriptionSlot;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

/// Swallow all items, relay only the terminal
pub trait IgnoreElements<T>: super::sealed::Sealed {
    /// Consume the upstream unboundedly, dropping every item, and
    /// forward only completion or error.
    fn ignore_elements(self) -> Flow<T>;
}

impl<T: Element> IgnoreElements<T> for Flow<T> {
    fn ignore_elements(self) -> Flow<T> {
        Flow::new(IgnoreElementsPublisher { upstream: self })
    }
}

struct IgnoreElementsPublisher<T> {
    upstream: Flow<T>,
}

impl<T: Element> Publisher<T> for IgnoreElementsPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let adapter = Arc::new(IgnoreElementsSubscriber {
            downstream: subscriber.clone(),
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

struct IgnoreElementsSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T: Element> Subscriber<T> for IgnoreElementsSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if self.upstream.set(upstream) {
            self.upstream.request(u64::MAX);
        }
    }

    fn on_next(&self, _item: T) {}

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

impl<T: Element> Subscription for IgnoreElementsSubscriber<T> {
    fn request(&self, _n: u64) {
        // there will never be items to deliver
    }

    fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        self.upstream.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSubscriber;

    #[test]
    fn drops_items_keeps_completion() {
        let ts = TestSubscriber::new(0);
        Flow::range(0, 100).ignore_elements().subscribe(ts.clone());
        ts.assert_values(&[]);
        ts.assert_complete();
    }

    #[test]
    fn errors_still_pass() {
        let ts: Arc<TestSubscriber<i32>> = TestSubscriber::new(0);
        Flow::<i32>::error(FlowError::MissingBackpressure)
            .ignore_elements()
            .subscribe(ts.clone());
        ts.assert_error(&FlowError::MissingBackpressure);
    }
}
