use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::backpressure::{requests, SubscriptionSlot, Terminal, TerminalLatch};
use crate::error::FlowError;
use crate::flow::{Flow, NoopSubscription, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

/// A hot stage broadcasting every signal to all currently attached
/// subscribers. It holds no backpressure state of its own: each
/// subscriber's demand is tracked individually, and a subscriber that
/// falls behind is failed with [FlowError::MissingBackpressure] while
/// the others keep receiving.
///
/// Late subscribers to a terminated processor receive the terminal
/// immediately.
pub struct DirectProcessor<T> {
    inner: Arc<DirectInner<T>>,
}

impl<T> Clone for DirectProcessor<T> {
    fn clone(&self) -> Self {
        DirectProcessor {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct DirectInner<T> {
    subscribers: Mutex<Vec<Arc<DirectSubscription<T>>>>,
    latch: TerminalLatch,
    upstream: SubscriptionSlot<T>,
}

impl<T: Element + Clone> DirectProcessor<T> {
    pub fn new() -> Self {
        DirectProcessor {
            inner: Arc::new(DirectInner {
                subscribers: Mutex::new(Vec::new()),
                latch: TerminalLatch::new(),
                upstream: SubscriptionSlot::new(),
            }),
        }
    }

    /// The cold-style view of this processor.
    pub fn flow(&self) -> Flow<T> {
        Flow::new(self.clone())
    }

    pub fn has_subscribers(&self) -> bool {
        !self.inner.subscribers.lock().unwrap().is_empty()
    }

    /// Wrap this processor so concurrent signal calls are serialized.
    pub fn serialized(&self) -> super::SerializedSubscriber<T> {
        super::SerializedSubscriber::new(Arc::new(self.clone()))
    }

    /// Detach from the upstream feeding this processor, if any.
    pub(crate) fn detach(&self) {
        self.inner.upstream.cancel();
    }

    /// Whether two handles refer to the same processor.
    pub(crate) fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn snapshot(&self) -> Vec<Arc<DirectSubscription<T>>> {
        self.inner.subscribers.lock().unwrap().clone()
    }
}

impl<T: Element + Clone> Default for DirectProcessor<T> {
    fn default() -> Self {
        DirectProcessor::new()
    }
}

impl<T: Element + Clone> Publisher<T> for DirectProcessor<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        if let Some(terminal) = self.inner.latch.get() {
            subscriber.on_subscribe(Upstream::plain(Arc::new(NoopSubscription)));
            match terminal {
                Terminal::Complete => subscriber.on_complete(),
                Terminal::Errored(error) => subscriber.on_error(error.clone()),
            }
            return;
        }
        let slot = Arc::new(DirectSubscription {
            downstream: subscriber.clone(),
            requested: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            parent: Arc::downgrade(&self.inner),
        });
        self.inner.subscribers.lock().unwrap().push(slot.clone());
        subscriber.on_subscribe(Upstream::plain(slot));
    }
}

impl<T: Element + Clone> Subscriber<T> for DirectProcessor<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if self.inner.upstream.set(upstream) {
            self.inner.upstream.request(u64::MAX);
        }
    }

    fn on_next(&self, item: T) {
        if self.inner.latch.is_set() {
            return;
        }
        for subscriber in self.snapshot() {
            if subscriber.cancelled.load(Ordering::Acquire) {
                continue;
            }
            if requests::consume_one(&subscriber.requested) {
                subscriber.downstream.on_next(item.clone());
            } else {
                // only the slow subscriber is punished
                subscriber.remove();
                subscriber.downstream.on_error(FlowError::MissingBackpressure);
            }
        }
    }

    fn on_error(&self, error: FlowError) {
        if !self.inner.latch.error(error.clone()) {
            return;
        }
        let all: Vec<_> = self.inner.subscribers.lock().unwrap().drain(..).collect();
        for subscriber in all {
            if !subscriber.cancelled.load(Ordering::Acquire) {
                subscriber.downstream.on_error(error.clone());
            }
        }
    }

    fn on_complete(&self) {
        if !self.inner.latch.complete() {
            return;
        }
        let all: Vec<_> = self.inner.subscribers.lock().unwrap().drain(..).collect();
        for subscriber in all {
            if !subscriber.cancelled.load(Ordering::Acquire) {
                subscriber.downstream.on_complete();
            }
        }
    }
}

struct DirectSubscription<T> {
    downstream: Arc<dyn Subscriber<T>>,
    requested: AtomicU64,
    cancelled: AtomicBool,
    parent: Weak<DirectInner<T>>,
}

impl<T: Element> DirectSubscription<T> {
    fn remove(self: &Arc<Self>) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(parent) = self.parent.upgrade() {
            parent
                .subscribers
                .lock()
                .unwrap()
                .retain(|candidate| !Arc::ptr_eq(candidate, self));
        }
    }
}

impl<T: Element> Subscription for DirectSubscription<T> {
    fn request(&self, n: u64) {
        requests::add(&self.requested, n);
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(parent) = self.parent.upgrade() {
            parent
                .subscribers
                .lock()
                .unwrap()
                .retain(|candidate| !candidate.cancelled.load(Ordering::Acquire));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSubscriber;

    #[test]
    fn broadcasts_to_everyone_attached() {
        let processor: DirectProcessor<i32> = DirectProcessor::new();
        let first = TestSubscriber::new(u64::MAX);
        let second = TestSubscriber::new(u64::MAX);
        processor.flow().subscribe(first.clone());
        processor.flow().subscribe(second.clone());
        processor.on_next(1);
        processor.on_next(2);
        processor.on_complete();
        first.assert_values(&[1, 2]);
        second.assert_values(&[1, 2]);
        first.assert_complete();
        second.assert_complete();
    }

    #[test]
    fn a_slow_subscriber_fails_alone() {
        let processor: DirectProcessor<i32> = DirectProcessor::new();
        let slow = TestSubscriber::new(1);
        let fast = TestSubscriber::new(u64::MAX);
        processor.flow().subscribe(slow.clone());
        processor.flow().subscribe(fast.clone());
        processor.on_next(1);
        processor.on_next(2);
        slow.assert_values(&[1]);
        slow.assert_error(&FlowError::MissingBackpressure);
        fast.assert_values(&[1, 2]);
        fast.assert_no_terminal();
    }

    #[test]
    fn late_subscribers_get_the_terminal() {
        let processor: DirectProcessor<i32> = DirectProcessor::new();
        processor.on_complete();
        let late = TestSubscriber::new(u64::MAX);
        processor.flow().subscribe(late.clone());
        late.assert_complete();
    }

    #[test]
    fn cancelled_subscribers_stop_receiving() {
        let processor: DirectProcessor<i32> = DirectProcessor::new();
        let ts = TestSubscriber::new(u64::MAX);
        processor.flow().subscribe(ts.clone());
        processor.on_next(1);
        ts.cancel();
        processor.on_next(2);
        ts.assert_values(&[1]);
        assert!(!processor.has_subscribers());
    }
}
