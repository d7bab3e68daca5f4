use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backpressure::SubscriptionSlot;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

/// Keep only items matching a predicate
pub trait Filter<T>: super::sealed::Sealed {
    /// Drop items for which `predicate` returns false. Every rejected
    /// item is compensated with a `request(1)` upstream, so downstream
    /// demand is preserved.
    ///
    /// # Example
    /// ```rust
    /// use riptide::flow::Flow;
    /// use riptide::operators::*;
    /// use riptide::testing::TestSubscriber;
    ///
    /// let ts = TestSubscriber::new(u64::MAX);
    /// Flow::range(1, 6).filter(|x| x % 2 == 0).subscribe(ts.clone());
    /// ts.assert_values(&[2, 4, 6]);
    /// ```
    fn filter(self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Flow<T>;

    /// Like [Filter::filter], but a failing predicate cancels upstream
    /// and ends the flow with the returned error.
    fn try_filter(
        self,
        predicate: impl Fn(&T) -> Result<bool, FlowError> + Send + Sync + 'static,
    ) -> Flow<T>;
}

impl<T: Element> Filter<T> for Flow<T> {
    fn filter(self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Flow<T> {
        self.try_filter(move |item| Ok(predicate(item)))
    }

    fn try_filter(
        self,
        predicate: impl Fn(&T) -> Result<bool, FlowError> + Send + Sync + 'static,
    ) -> Flow<T> {
        Flow::new(FilterPublisher {
            upstream: self,
            predicate: Arc::new(predicate),
        })
    }
}

struct FilterPublisher<T, P> {
    upstream: Flow<T>,
    predicate: Arc<P>,
}

impl<T, P> Publisher<T> for FilterPublisher<T, P>
where
    T: Element,
    P: Fn(&T) -> Result<bool, FlowError> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let adapter = Arc::new(FilterSubscriber {
            downstream: subscriber.clone(),
            predicate: Arc::clone(&self.predicate),
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

struct FilterSubscriber<T, P> {
    downstream: Arc<dyn Subscriber<T>>,
    predicate: Arc<P>,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T, P> Subscriber<T> for FilterSubscriber<T, P>
where
    T: Element,
    P: Fn(&T) -> Result<bool, FlowError> + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.upstream.set(upstream);
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        match (self.predicate)(&item) {
            Ok(true) => self.downstream.on_next(item),
            Ok(false) => self.upstream.request(1),
            Err(error) => {
                self.done.store(true, Ordering::Release);
                self.upstream.cancel();
                self.downstream.on_error(error);
            }
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

impl<T, P> Subscription for FilterSubscriber<T, P>
where
    T: Element,
    P: Fn(&T) -> Result<bool, FlowError> + Send + Sync + 'static,
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
    fn keeps_matching_items_only() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(1, 10).filter(|x| x % 2 == 0).subscribe(ts.clone());
        ts.assert_values(&[2, 4, 6, 8, 10]);
        ts.assert_complete();
    }

    #[test]
    fn rejected_items_replenish_upstream() {
        let publisher = TestPublisher::new();
        let ts = TestSubscriber::new(2);
        publisher
            .flow()
            .filter(|x: &i32| x % 2 == 0)
            .subscribe(ts.clone());
        assert_eq!(publisher.requested(), 2);
        publisher.emit(1);
        // the rejection asked for one replacement item
        assert_eq!(publisher.requested(), 3);
        publisher.emit(2);
        assert_eq!(publisher.requested(), 3);
        ts.assert_values(&[2]);
    }

    #[test]
    fn failing_predicate_ends_the_flow() {
        let publisher = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher
            .flow()
            .try_filter(|_: &i32| Err(FlowError::callback("bad")))
            .subscribe(ts.clone());
        publisher.emit(1);
        assert!(publisher.is_cancelled());
        ts.assert_error(&FlowError::callback("bad"));
    }
}
