use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backpressure::SubscriptionSlot;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

/// Emit items while a predicate holds
pub trait TakeWhile<T>: super::sealed::Sealed {
    /// Emit items until `predicate` first returns false, then complete
    /// and cancel upstream. The failing item is not emitted.
    fn take_while(self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Flow<T>;
}

impl<T: Element> TakeWhile<T> for Flow<T> {
    fn take_while(self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Flow<T> {
        Flow::new(TakeWhilePublisher {
            upstream: self,
            predicate: Arc::new(predicate),
        })
    }
}

struct TakeWhilePublisher<T, P> {
    upstream: Flow<T>,
    predicate: Arc<P>,
}

impl<T, P> Publisher<T> for TakeWhilePublisher<T, P>
where
    T: Element,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let adapter = Arc::new(TakeWhileSubscriber {
            downstream: subscriber.clone(),
            predicate: Arc::clone(&self.predicate),
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

struct TakeWhileSubscriber<T, P> {
    downstream: Arc<dyn Subscriber<T>>,
    predicate: Arc<P>,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T, P> Subscriber<T> for TakeWhileSubscriber<T, P>
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
        if (self.predicate)(&item) {
            self.downstream.on_next(item);
        } else {
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

impl<T, P> Subscription for TakeWhileSubscriber<T, P>
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
    use crate::testing::{TestPublisher, TestSubscriber};

    #[test]
    fn stops_at_the_first_rejection() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::from_iter([1, 2, 3, 2, 1])
            .take_while(|x| *x < 3)
            .subscribe(ts.clone());
        ts.assert_values(&[1, 2]);
        ts.assert_complete();
    }

    #[test]
    fn cancels_upstream_on_rejection() {
        let publisher = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher
            .flow()
            .take_while(|x: &i32| *x > 0)
            .subscribe(ts.clone());
        publisher.emit(1);
        publisher.emit(0);
        assert!(publisher.is_cancelled());
        ts.assert_values(&[1]);
        ts.assert_complete();
    }
}
