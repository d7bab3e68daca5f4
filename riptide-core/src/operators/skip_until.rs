use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backpressure::{SignalGate, SubscriptionSlot};
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

/// Drop items until another flow signals
pub trait SkipUntil<T>: super::sealed::Sealed {
    /// Drop items until `other` emits its first item; from then on
    /// everything passes. Dropped items replenish upstream by one each;
    /// an error from `other` fails the flow.
    fn skip_until<U: Element>(self, other: Flow<U>) -> Flow<T>;
}

impl<T: Element> SkipUntil<T> for Flow<T> {
    fn skip_until<U: Element>(self, other: Flow<U>) -> Flow<T> {
        Flow::new(SkipUntilPublisher {
            upstream: self,
            other,
        })
    }
}

struct SkipUntilPublisher<T, U> {
    upstream: Flow<T>,
    other: Flow<U>,
}

impl<T: Element, U: Element> Publisher<T> for SkipUntilPublisher<T, U> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let shared = Arc::new(SkipUntilShared {
            downstream: subscriber.clone(),
            gate: SignalGate::new(),
            open: AtomicBool::new(false),
            main: SubscriptionSlot::new(),
            other: SubscriptionSlot::new(),
        });
        subscriber.on_subscribe(Upstream::plain(Arc::new(SkipUntilSubscription {
            shared: shared.clone(),
        })));
        self.other.subscribe(Arc::new(GateSubscriber {
            shared: shared.clone(),
        }));
        self.upstream.subscribe(Arc::new(MainSubscriber { shared }));
    }
}

struct SkipUntilShared<T, U> {
    downstream: Arc<dyn Subscriber<T>>,
    gate: SignalGate,
    open: AtomicBool,
    main: SubscriptionSlot<T>,
    other: SubscriptionSlot<U>,
}

struct MainSubscriber<T, U> {
    shared: Arc<SkipUntilShared<T, U>>,
}

impl<T: Element, U: Element> Subscriber<T> for MainSubscriber<T, U> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.shared.main.set(upstream);
    }

    fn on_next(&self, item: T) {
        if self.shared.open.load(Ordering::Acquire) {
            self.shared.gate.next(self.shared.downstream.as_ref(), item);
        } else {
            self.shared.main.request(1);
        }
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

struct GateSubscriber<T, U> {
    shared: Arc<SkipUntilShared<T, U>>,
}

impl<T: Element, U: Element> Subscriber<U> for GateSubscriber<T, U> {
    fn on_subscribe(&self, upstream: Upstream<U>) {
        if self.shared.other.set(upstream) {
            self.shared.other.request(u64::MAX);
        }
    }

    fn on_next(&self, _item: U) {
        self.shared.open.store(true, Ordering::Release);
        self.shared.other.cancel();
    }

    fn on_error(&self, error: FlowError) {
        if !self.shared.open.load(Ordering::Acquire) {
            self.shared.main.cancel();
            self.shared.gate.error(self.shared.downstream.as_ref(), error);
        }
    }

    fn on_complete(&self) {
        // a gate that completes without opening leaves the flow skipping
        // forever; nothing to do
    }
}

struct SkipUntilSubscription<T, U> {
    shared: Arc<SkipUntilShared<T, U>>,
}

impl<T: Element, U: Element> Subscription for SkipUntilSubscription<T, U> {
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
    fn items_pass_only_after_the_gate_opens() {
        let main = TestPublisher::new();
        let gate: TestPublisher<()> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        main.flow().skip_until(gate.flow()).subscribe(ts.clone());
        main.emit(1);
        main.emit(2);
        gate.emit(());
        main.emit(3);
        ts.assert_values(&[3]);
    }

    #[test]
    fn gate_error_before_opening_fails_the_flow() {
        let main: TestPublisher<i32> = TestPublisher::new();
        let gate: TestPublisher<()> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        main.flow().skip_until(gate.flow()).subscribe(ts.clone());
        gate.error(FlowError::MissingBackpressure);
        assert!(main.is_cancelled());
        ts.assert_error(&FlowError::MissingBackpressure);
    }
}
