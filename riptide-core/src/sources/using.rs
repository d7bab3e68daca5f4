//! Scopes a resource to the lifetime of one subscription.
use std::sync::{Arc, Mutex};

use crate::backpressure::SubscriptionSlot;
use crate::error::FlowError;
use crate::flow::{Flow, NoopSubscription, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

impl<T: Element> Flow<T> {
    /// Acquire a resource per subscriber, derive the flow from it, and
    /// release it on terminal or cancel, whichever comes first. A failed
    /// acquisition surfaces as the flow's error.
    pub fn using<R: Send + 'static>(
        acquire: impl Fn() -> Result<R, FlowError> + Send + Sync + 'static,
        source: impl Fn(&R) -> Flow<T> + Send + Sync + 'static,
        release: impl Fn(R) + Send + Sync + 'static,
    ) -> Flow<T> {
        Flow::new(UsingPublisher {
            acquire,
            source,
            release: Arc::new(release),
        })
    }
}

struct UsingPublisher<A, S, R: Send> {
    acquire: A,
    source: S,
    release: Arc<dyn Fn(R) + Send + Sync>,
}

impl<T, A, S, R> Publisher<T> for UsingPublisher<A, S, R>
where
    T: Element,
    A: Fn() -> Result<R, FlowError> + Send + Sync,
    S: Fn(&R) -> Flow<T> + Send + Sync,
    R: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let resource = match (self.acquire)() {
            Ok(resource) => resource,
            Err(error) => {
                subscriber.on_subscribe(Upstream::plain(Arc::new(NoopSubscription)));
                subscriber.on_error(error);
                return;
            }
        };
        let flow = (self.source)(&resource);
        let adapter = Arc::new(UsingSubscriber {
            downstream: subscriber.clone(),
            resource: Mutex::new(Some(resource)),
            release: Arc::clone(&self.release),
            upstream: SubscriptionSlot::new(),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        flow.subscribe(adapter);
    }
}

struct UsingSubscriber<T, R> {
    downstream: Arc<dyn Subscriber<T>>,
    resource: Mutex<Option<R>>,
    release: Arc<dyn Fn(R) + Send + Sync>,
    upstream: SubscriptionSlot<T>,
}

impl<T, R: Send> UsingSubscriber<T, R> {
    /// Release exactly once, before the terminal is forwarded.
    fn release_resource(&self) {
        if let Some(resource) = self.resource.lock().unwrap().take() {
            (self.release)(resource);
        }
    }
}

impl<T: Element, R: Send + 'static> Subscriber<T> for UsingSubscriber<T, R> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.upstream.set(upstream);
    }

    fn on_next(&self, item: T) {
        self.downstream.on_next(item);
    }

    fn on_error(&self, error: FlowError) {
        self.release_resource();
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        self.release_resource();
        self.downstream.on_complete();
    }
}

impl<T: Element, R: Send + 'static> Subscription for UsingSubscriber<T, R> {
    fn request(&self, n: u64) {
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.release_resource();
        self.upstream.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::testing::TestSubscriber;

    #[test]
    fn releases_on_completion() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let flow = Flow::using(
            || Ok(7i64),
            |seed| Flow::range(*seed, 2),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        let ts = TestSubscriber::new(u64::MAX);
        flow.subscribe(ts.clone());
        ts.assert_values(&[7, 8]);
        ts.assert_complete();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn releases_on_cancel_exactly_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let flow = Flow::using(
            || Ok(0i64),
            |_| Flow::<i64>::never(),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        let ts = TestSubscriber::new(0);
        flow.subscribe(ts.clone());
        ts.cancel();
        ts.cancel();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_acquisition_errors_the_flow() {
        let flow: Flow<i64> = Flow::using(
            || Err(FlowError::callback("no resource")),
            |_: &i64| Flow::<i64>::never(),
            |_| {},
        );
        let ts = TestSubscriber::new(0);
        flow.subscribe(ts.clone());
        ts.assert_error(&FlowError::callback("no resource"));
    }
}
