use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::backpressure::SubscriptionSlot;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

/// Suppress duplicate items
pub trait Distinct<T>: super::sealed::Sealed {
    /// Drop every item that equals one already seen. Suppressed items
    /// replenish upstream by one to preserve downstream demand.
    fn distinct(self) -> Flow<T>
    where
        T: Clone + Eq + Hash;

    /// Drop items equal to their immediate predecessor.
    fn distinct_until_changed(self) -> Flow<T>
    where
        T: Clone + PartialEq;
}

impl<T: Element> Distinct<T> for Flow<T> {
    fn distinct(self) -> Flow<T>
    where
        T: Clone + Eq + Hash,
    {
        Flow::new(DistinctPublisher { upstream: self })
    }

    fn distinct_until_changed(self) -> Flow<T>
    where
        T: Clone + PartialEq,
    {
        Flow::new(DistinctUntilChangedPublisher { upstream: self })
    }
}

struct DistinctPublisher<T> {
    upstream: Flow<T>,
}

impl<T: Element + Clone + Eq + Hash> Publisher<T> for DistinctPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let adapter = Arc::new(DistinctSubscriber {
            downstream: subscriber.clone(),
            seen: Mutex::new(HashSet::new()),
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

struct DistinctSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    seen: Mutex<HashSet<T>>,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T: Element + Clone + Eq + Hash> Subscriber<T> for DistinctSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.upstream.set(upstream);
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let fresh = self.seen.lock().unwrap().insert(item.clone());
        if fresh {
            self.downstream.on_next(item);
        } else {
            self.upstream.request(1);
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

impl<T: Element + Clone + Eq + Hash> Subscription for DistinctSubscriber<T> {
    fn request(&self, n: u64) {
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        self.upstream.cancel();
    }
}

struct DistinctUntilChangedPublisher<T> {
    upstream: Flow<T>,
}

impl<T: Element + Clone + PartialEq> Publisher<T> for DistinctUntilChangedPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let adapter = Arc::new(DistinctUntilChangedSubscriber {
            downstream: subscriber.clone(),
            last: Mutex::new(None),
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

struct DistinctUntilChangedSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    last: Mutex<Option<T>>,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T: Element + Clone + PartialEq> Subscriber<T> for DistinctUntilChangedSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.upstream.set(upstream);
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let changed = {
            let mut last = self.last.lock().unwrap();
            if last.as_ref() == Some(&item) {
                false
            } else {
                *last = Some(item.clone());
                true
            }
        };
        if changed {
            self.downstream.on_next(item);
        } else {
            self.upstream.request(1);
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

impl<T: Element + Clone + PartialEq> Subscription for DistinctUntilChangedSubscriber<T> {
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
    use crate::testing::TestSubscriber;

    #[test]
    fn distinct_drops_every_repeat() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::from_iter([1, 2, 1, 3, 2, 4]).distinct().subscribe(ts.clone());
        ts.assert_values(&[1, 2, 3, 4]);
        ts.assert_complete();
    }

    #[test]
    fn until_changed_only_compares_neighbours() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::from_iter([1, 1, 2, 2, 1, 1])
            .distinct_until_changed()
            .subscribe(ts.clone());
        ts.assert_values(&[1, 2, 1]);
        ts.assert_complete();
    }
}
