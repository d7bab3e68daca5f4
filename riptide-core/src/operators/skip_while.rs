use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backpressure::SubscriptionSlot;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

/// Drop items while a predicate holds
pub trait SkipWhile<T>: super::sealed::Sealed {
    /// Drop items until `predicate` first returns false; from then on
    /// everything passes. Dropped items replenish upstream by one each.
    fn skip_while(self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Flow<T>;
}

impl<T: Element> SkipWhile<T> for Flow<T> {
    fn skip_while(self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Flow<T> {
        Flow::new(SkipWhilePublisher {
            upstream: self,
            predicate: Arc::new(predicate),
        })
    }
}

struct SkipWhilePublisher<T, P> {
    upstream: Flow<T>,
    predicate: Arc<P>,
}

impl<T, P> Publisher<T> for SkipWhilePublisher<T, P>
where
    T: Element,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let adapter = Arc::new(SkipWhileSubscriber {
            downstream: subscriber.clone(),
            predicate: Arc::clone(&self.predicate),
            skipping: AtomicBool::new(true),
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

struct SkipWhileSubscriber<T, P> {
    downstream: Arc<dyn Subscriber<T>>,
    predicate: Arc<P>,
    skipping: AtomicBool,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T, P> Subscriber<T> for SkipWhileSubscriber<T, P>
where
    T: Element,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.upstream.set(upstream);
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if self.skipping.load(Ordering::Acquire) {
            if (self.predicate)(&item) {
                self.upstream.request(1);
                return;
            }
            self.skipping.store(false, Ordering::Release);
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

impl<T, P> Subscription for SkipWhileSubscriber<T, P>
where
    T: Element,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
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
    use crate::testing::TestSubscriber;

    #[test]
    fn passes_everything_after_the_first_miss() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::from_iter([1, 2, 3, 1, 2])
            .skip_while(|x| *x < 3)
            .subscribe(ts.clone());
        ts.assert_values(&[3, 1, 2]);
        ts.assert_complete();
    }
}
