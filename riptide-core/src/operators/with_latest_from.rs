use std::sync::{Arc, Mutex};

use crate::backpressure::{SignalGate, SubscriptionSlot};
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

/// Attach the latest value of a second flow to each item
pub trait WithLatestFrom<T>: super::sealed::Sealed {
    /// Combine each item of this flow with the most recent value of
    /// `other`. Items arriving before `other` has emitted are dropped
    /// (replenishing upstream by one). `other` never terminates the
    /// output, but its errors do fail it.
    fn with_latest_from<U, R>(
        self,
        other: Flow<U>,
        combine: impl Fn(T, &U) -> R + Send + Sync + 'static,
    ) -> Flow<R>
    where
        U: Element + Sync,
        R: Element;
}

impl<T: Element> WithLatestFrom<T> for Flow<T> {
    fn with_latest_from<U, R>(
        self,
        other: Flow<U>,
        combine: impl Fn(T, &U) -> R + Send + Sync + 'static,
    ) -> Flow<R>
    where
        U: Element + Sync,
        R: Element,
    {
        Flow::new(WithLatestFromPublisher {
            upstream: self,
            other,
            combine: Arc::new(combine),
        })
    }
}

struct WithLatestFromPublisher<T, U, F> {
    upstream: Flow<T>,
    other: Flow<U>,
    combine: Arc<F>,
}

impl<T, U, R, F> Publisher<R> for WithLatestFromPublisher<T, U, F>
where
    T: Element,
    U: Element + Sync,
    R: Element,
    F: Fn(T, &U) -> R + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<R>>) {
        let shared = Arc::new(LatestShared {
            downstream: subscriber.clone(),
            combine: Arc::clone(&self.combine),
            gate: SignalGate::new(),
            latest: Mutex::new(None),
            main: SubscriptionSlot::new(),
            other: SubscriptionSlot::new(),
        });
        subscriber.on_subscribe(Upstream::plain(Arc::new(LatestSubscription {
            shared: shared.clone(),
        })));
        self.other.subscribe(Arc::new(OtherSubscriber {
            shared: shared.clone(),
        }));
        self.upstream.subscribe(Arc::new(MainSubscriber { shared }));
    }
}

struct LatestShared<T, U, R, F> {
    downstream: Arc<dyn Subscriber<R>>,
    combine: Arc<F>,
    gate: SignalGate,
    latest: Mutex<Option<U>>,
    main: SubscriptionSlot<T>,
    other: SubscriptionSlot<U>,
}

struct MainSubscriber<T, U, R, F> {
    shared: Arc<LatestShared<T, U, R, F>>,
}

impl<T, U, R, F> Subscriber<T> for MainSubscriber<T, U, R, F>
where
    T: Element,
    U: Element + Sync,
    R: Element,
    F: Fn(T, &U) -> R + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.shared.main.set(upstream);
    }

    fn on_next(&self, item: T) {
        let combined = {
            let latest = self.shared.latest.lock().unwrap();
            latest
                .as_ref()
                .map(|value| (self.shared.combine)(item, value))
        };
        match combined {
            Some(combined) => {
                self.shared
                    .gate
                    .next(self.shared.downstream.as_ref(), combined);
            }
            None => {
                // nothing to pair with yet; keep the demand alive
                self.shared.main.request(1);
            }
        }
    }

    fn on_error(&self, error: FlowError) {
        self.shared.other.cancel();
        self.shared
            .gate
            .error(self.shared.downstream.as_ref(), error);
    }

    fn on_complete(&self) {
        self.shared.other.cancel();
        self.shared.gate.complete(self.shared.downstream.as_ref());
    }
}

struct OtherSubscriber<T, U, R, F> {
    shared: Arc<LatestShared<T, U, R, F>>,
}

impl<T, U, R, F> Subscriber<U> for OtherSubscriber<T, U, R, F>
where
    T: Element,
    U: Element + Sync,
    R: Element,
    F: Fn(T, &U) -> R + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<U>) {
        if self.shared.other.set(upstream) {
            self.shared.other.request(u64::MAX);
        }
    }

    fn on_next(&self, item: U) {
        *self.shared.latest.lock().unwrap() = Some(item);
    }

    fn on_error(&self, error: FlowError) {
        // the sampled side does not terminate the flow, but its failure
        // must surface
        self.shared.main.cancel();
        self.shared
            .gate
            .error(self.shared.downstream.as_ref(), error);
    }

    fn on_complete(&self) {}
}

struct LatestSubscription<T, U, R, F> {
    shared: Arc<LatestShared<T, U, R, F>>,
}

impl<T, U, R, F> Subscription for LatestSubscription<T, U, R, F>
where
    T: Element,
    U: Element + Sync,
    R: Element,
    F: Fn(T, &U) -> R + Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        self.shared.main.request(n);
    }

    fn cancel(&self) {
        self.shared.main.cancel();
        self.shared.other.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestPublisher, TestSubscriber};

    #[test]
    fn items_pair_with_the_latest_sample() {
        let main: TestPublisher<i32> = TestPublisher::new();
        let other: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        main.flow()
            .with_latest_from(other.flow(), |a, b| (a, *b))
            .subscribe(ts.clone());
        main.emit(1);
        ts.assert_values(&[]);
        other.emit(10);
        main.emit(2);
        other.emit(20);
        main.emit(3);
        ts.assert_values(&[(2, 10), (3, 20)]);
    }

    #[test]
    fn other_completion_does_not_terminate() {
        let main: TestPublisher<i32> = TestPublisher::new();
        let other: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        main.flow()
            .with_latest_from(other.flow(), |a, b| a + b)
            .subscribe(ts.clone());
        other.emit(100);
        other.complete();
        main.emit(1);
        ts.assert_values(&[101]);
        ts.assert_no_terminal();
    }

    #[test]
    fn other_error_fails_the_flow() {
        let main: TestPublisher<i32> = TestPublisher::new();
        let other: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        main.flow()
            .with_latest_from(other.flow(), |a, b| a + b)
            .subscribe(ts.clone());
        other.error(FlowError::callback("sampled side"));
        assert!(main.is_cancelled());
        ts.assert_error(&FlowError::callback("sampled side"));
    }
}
