//! Constant sources: a single value, nothing, silence, or an error.
use std::sync::Arc;

use crate::backpressure::ScalarSubscription;
use crate::error::FlowError;
use crate::flow::{Flow, NoopSubscription, Publisher, Subscriber, Upstream};
use crate::types::Element;

impl<T: Element> Flow<T> {
    /// A flow of exactly one value.
    pub fn just(value: T) -> Flow<T>
    where
        T: Clone + Sync,
    {
        Flow::new(JustPublisher { value })
    }

    /// Completes immediately, without items.
    pub fn empty() -> Flow<T> {
        Flow::new(EmptyPublisher)
    }

    /// Never signals anything after the subscription.
    pub fn never() -> Flow<T> {
        Flow::new(NeverPublisher)
    }

    /// Errors immediately, without items.
    pub fn error(error: FlowError) -> Flow<T> {
        Flow::new(ErrorPublisher { error })
    }
}

struct JustPublisher<T> {
    value: T,
}

impl<T: Element + Clone + Sync> Publisher<T> for JustPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let subscription = Arc::new(ScalarSubscription::new(subscriber.clone()));
        subscriber.on_subscribe(Upstream::plain(subscription.clone()));
        subscription.complete(self.value.clone());
    }

    fn scalar_value(&self) -> Option<T> {
        Some(self.value.clone())
    }
}

struct EmptyPublisher;

impl<T: Element> Publisher<T> for EmptyPublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        subscriber.on_subscribe(Upstream::plain(Arc::new(NoopSubscription)));
        subscriber.on_complete();
    }
}

struct NeverPublisher;

impl<T: Element> Publisher<T> for NeverPublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        subscriber.on_subscribe(Upstream::plain(Arc::new(NoopSubscription)));
    }
}

struct ErrorPublisher {
    error: FlowError,
}

impl<T: Element> Publisher<T> for ErrorPublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        subscriber.on_subscribe(Upstream::plain(Arc::new(NoopSubscription)));
        subscriber.on_error(self.error.clone());
    }
}
