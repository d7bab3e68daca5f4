use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::backpressure::requests;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

struct TestPublisherInner<T> {
    subscriber: Mutex<Option<Arc<dyn Subscriber<T>>>>,
    requested: AtomicU64,
    cancelled: AtomicBool,
}

/// A hand-driven publisher for protocol tests: the test decides when to
/// emit, the publisher records the demand and cancellation it receives.
/// Emission deliberately ignores demand so tests can provoke violations.
pub struct TestPublisher<T> {
    inner: Arc<TestPublisherInner<T>>,
}

impl<T> Clone for TestPublisher<T> {
    fn clone(&self) -> Self {
        TestPublisher {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Element> TestPublisher<T> {
    pub fn new() -> Self {
        TestPublisher {
            inner: Arc::new(TestPublisherInner {
                subscriber: Mutex::new(None),
                requested: AtomicU64::new(0),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    pub fn flow(&self) -> Flow<T> {
        Flow::new(self.clone())
    }

    /// Emit to the attached subscriber, demand or not.
    pub fn emit(&self, item: T) {
        let subscriber = self.inner.subscriber.lock().unwrap().clone();
        if let Some(subscriber) = subscriber {
            subscriber.on_next(item);
        }
    }

    pub fn complete(&self) {
        let subscriber = self.inner.subscriber.lock().unwrap().clone();
        if let Some(subscriber) = subscriber {
            subscriber.on_complete();
        }
    }

    pub fn error(&self, error: FlowError) {
        let subscriber = self.inner.subscriber.lock().unwrap().clone();
        if let Some(subscriber) = subscriber {
            subscriber.on_error(error);
        }
    }

    /// Total demand received so far.
    pub fn requested(&self) -> u64 {
        self.inner.requested.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn has_subscriber(&self) -> bool {
        self.inner.subscriber.lock().unwrap().is_some()
    }
}

impl<T: Element> Default for TestPublisher<T> {
    fn default() -> Self {
        TestPublisher::new()
    }
}

impl<T: Element> Publisher<T> for TestPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        *self.inner.subscriber.lock().unwrap() = Some(subscriber.clone());
        let subscription = Arc::new(TestPublisherSubscription {
            inner: Arc::clone(&self.inner),
        });
        subscriber.on_subscribe(Upstream::plain(subscription));
    }
}

struct TestPublisherSubscription<T> {
    inner: Arc<TestPublisherInner<T>>,
}

impl<T: Element> Subscription for TestPublisherSubscription<T> {
    fn request(&self, n: u64) {
        requests::add(&self.inner.requested, n);
    }

    fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.subscriber.lock().unwrap().take();
    }
}
