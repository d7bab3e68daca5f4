use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backpressure::SubscriptionSlot;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

/// Apply a function to every item in a flow
pub trait Map<T>: super::sealed::Sealed {
    /// Transform every item by applying `mapper`.
    ///
    /// # Example
    /// ```rust
    /// use riptide::flow::Flow;
    /// use riptide::operators::*;
    /// use riptide::testing::TestSubscriber;
    ///
    /// let ts = TestSubscriber::new(u64::MAX);
    /// Flow::range(1, 3).map(|x| x * 10).subscribe(ts.clone());
    /// ts.assert_values(&[10, 20, 30]);
    /// ```
    fn map<R: Element>(self, mapper: impl Fn(T) -> R + Send + Sync + 'static) -> Flow<R>;

    /// Like [Map::map], but a failing mapper cancels upstream and ends
    /// the flow with the returned error.
    fn try_map<R: Element>(
        self,
        mapper: impl Fn(T) -> Result<R, FlowError> + Send + Sync + 'static,
    ) -> Flow<R>;
}

impl<T: Element> Map<T> for Flow<T> {
    fn map<R: Element>(self, mapper: impl Fn(T) -> R + Send + Sync + 'static) -> Flow<R> {
        self.try_map(move |item| Ok(mapper(item)))
    }

    fn try_map<R: Element>(
        self,
        mapper: impl Fn(T) -> Result<R, FlowError> + Send + Sync + 'static,
    ) -> Flow<R> {
        Flow::new(MapPublisher {
            upstream: self,
            mapper: Arc::new(mapper),
        })
    }
}

struct MapPublisher<T, F> {
    upstream: Flow<T>,
    mapper: Arc<F>,
}

impl<T, R, F> Publisher<R> for MapPublisher<T, F>
where
    T: Element,
    R: Element,
    F: Fn(T) -> Result<R, FlowError> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<R>>) {
        let adapter = Arc::new(MapSubscriber {
            downstream: subscriber.clone(),
            mapper: Arc::clone(&self.mapper),
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

struct MapSubscriber<T, R, F> {
    downstream: Arc<dyn Subscriber<R>>,
    mapper: Arc<F>,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T, R, F> Subscriber<T> for MapSubscriber<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(T) -> Result<R, FlowError> + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.upstream.set(upstream);
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        match (self.mapper)(item) {
            Ok(mapped) => self.downstream.on_next(mapped),
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

impl<T, R, F> Subscription for MapSubscriber<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(T) -> Result<R, FlowError> + Send + Sync + 'static,
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
    fn maps_every_item() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::from_iter(["a", "bb", "ccc"])
            .map(|s| s.len())
            .subscribe(ts.clone());
        ts.assert_values(&[1, 2, 3]);
        ts.assert_complete();
    }

    #[test]
    fn composed_maps_equal_composed_function() {
        let f = |x: i64| x + 1;
        let g = |x: i64| x * 2;

        let chained = TestSubscriber::new(u64::MAX);
        Flow::range(0, 10).map(f).map(g).subscribe(chained.clone());

        let fused = TestSubscriber::new(u64::MAX);
        Flow::range(0, 10).map(move |x| g(f(x))).subscribe(fused.clone());

        assert_eq!(chained.values(), fused.values());
    }

    #[test]
    fn requests_pass_through_untouched() {
        let publisher = TestPublisher::new();
        let ts = TestSubscriber::new(3);
        publisher.flow().map(|x: i32| x).subscribe(ts.clone());
        assert_eq!(publisher.requested(), 3);
    }

    #[test]
    fn failing_mapper_cancels_upstream() {
        let publisher = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher
            .flow()
            .try_map(|x: i32| {
                if x > 1 {
                    Err(FlowError::callback("too big"))
                } else {
                    Ok(x)
                }
            })
            .subscribe(ts.clone());
        publisher.emit(1);
        publisher.emit(2);
        assert!(publisher.is_cancelled());
        ts.assert_values(&[1]);
        ts.assert_error(&FlowError::callback("too big"));
    }

    #[test]
    fn no_items_after_mapper_failure() {
        let publisher = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher
            .flow()
            .try_map(|_: i32| Err::<i32, _>(FlowError::callback("always")))
            .subscribe(ts.clone());
        publisher.emit(1);
        publisher.emit(2);
        assert_eq!(ts.value_count(), 0);
        ts.assert_error(&FlowError::callback("always"));
    }
}
