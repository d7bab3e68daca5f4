use std::sync::Arc;

use crate::backpressure::{SignalGate, SubscriptionSlot};
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

/// Emit items until another flow signals
pub trait TakeUntil<T>: super::sealed::Sealed {
    /// Relay the flow until `other` emits any item or terminates; then
    /// complete and cancel both subscriptions.
    fn take_until<U: Element>(self, other: Flow<U>) -> Flow<T>;
}

impl<T: Element> TakeUntil<T> for Flow<T> {
    fn take_until<U: Element>(self, other: Flow<U>) -> Flow<T> {
        Flow::new(TakeUntilPublisher {
            upstream: self,
            other,
        })
    }
}

struct TakeUntilPublisher<T, U> {
    upstream: Flow<T>,
    other: Flow<U>,
}

impl<T: Element, U: Element> Publisher<T> for TakeUntilPublisher<T, U> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let shared = Arc::new(TakeUntilShared {
            downstream: subscriber.clone(),
            gate: SignalGate::new(),
            main: SubscriptionSlot::new(),
            other: SubscriptionSlot::new(),
        });
        subscriber.on_subscribe(Upstream::plain(Arc::new(TakeUntilSubscription {
            shared: shared.clone(),
        })));
        self.other.subscribe(Arc::new(OtherSubscriber {
            shared: shared.clone(),
        }));
        self.upstream.subscribe(Arc::new(MainSubscriber { shared }));
    }
}

struct TakeUntilShared<T, U> {
    downstream: Arc<dyn Subscriber<T>>,
    gate: SignalGate,
    main: SubscriptionSlot<T>,
    other: SubscriptionSlot<U>,
}

impl<T: Element, U: Element> TakeUntilShared<T, U> {
    fn finish(&self) {
        self.main.cancel();
        self.other.cancel();
        self.gate.complete(self.downstream.as_ref());
    }

    fn fail(&self, error: FlowError) {
        self.main.cancel();
        self.other.cancel();
        self.gate.error(self.downstream.as_ref(), error);
    }
}

struct MainSubscriber<T, U> {
    shared: Arc<TakeUntilShared<T, U>>,
}

impl<T: Element, U: Element> Subscriber<T> for MainSubscriber<T, U> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.shared.main.set(upstream);
    }

    fn on_next(&self, item: T) {
        self.shared.gate.next(self.shared.downstream.as_ref(), item);
    }

    fn on_error(&self, error: FlowError) {
        self.shared.other.cancel();
        self.shared.gate.error(self.shared.downstream.as_ref(), error);
    }

    fn on_complete(&self) {
        self.shared.other.cancel();
        self.shared.gate.complete(self.shared.downstream.as_ref());
    }
}

struct OtherSubscriber<T, U> {
    shared: Arc<TakeUntilShared<T, U>>,
}

impl<T: Element, U: Element> Subscriber<U> for OtherSubscriber<T, U> {
    fn on_subscribe(&self, upstream: Upstream<U>) {
        if self.shared.other.set(upstream) {
            self.shared.other.request(u64::MAX);
        }
    }

    fn on_next(&self, _item: U) {
        self.shared.finish();
    }

    fn on_error(&self, error: FlowError) {
        self.shared.fail(error);
    }

    fn on_complete(&self) {
        self.shared.finish();
    }
}

struct TakeUntilSubscription<T, U> {
    shared: Arc<TakeUntilShared<T, U>>,
}

impl<T: Element, U: Element> Subscription for TakeUntilSubscription<T, U> {
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
    fn other_signal_completes_the_flow() {
        let main = TestPublisher::new();
        let other = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        main.flow().take_until(other.flow()).subscribe(ts.clone());
        main.emit(1);
        main.emit(2);
        other.emit(());
        assert!(main.is_cancelled());
        ts.assert_values(&[1, 2]);
        ts.assert_complete();
    }

    #[test]
    fn other_completion_also_ends_the_flow() {
        let main = TestPublisher::new();
        let other: TestPublisher<()> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        main.flow().take_until(other.flow()).subscribe(ts.clone());
        main.emit(1);
        other.complete();
        ts.assert_values(&[1]);
        ts.assert_complete();
    }

    #[test]
    fn main_items_flow_freely_while_other_is_silent() {
        let main = TestPublisher::new();
        let other: TestPublisher<()> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        main.flow().take_until(other.flow()).subscribe(ts.clone());
        main.emit(1);
        main.emit(2);
        main.emit(3);
        ts.assert_values(&[1, 2, 3]);
        ts.assert_no_terminal();
    }

    #[test]
    fn other_error_is_forwarded() {
        let main: TestPublisher<i32> = TestPublisher::new();
        let other: TestPublisher<()> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        main.flow().take_until(other.flow()).subscribe(ts.clone());
        other.error(FlowError::MissingBackpressure);
        assert!(main.is_cancelled());
        ts.assert_error(&FlowError::MissingBackpressure);
    }
}
