use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::backpressure::SubscriptionSlot;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

/// Gather items into fixed-size batches
pub trait Buffer<T>: super::sealed::Sealed {
    /// Collect every `count` consecutive items into a `Vec`. Requesting
    /// `n` batches requests `n * count` items upstream; completion
    /// flushes a partial final batch.
    fn buffer(self, count: usize) -> Flow<Vec<T>>;
}

impl<T: Element> Buffer<T> for Flow<T> {
    fn buffer(self, count: usize) -> Flow<Vec<T>> {
        assert!(count > 0, "buffer size must be > 0");
        Flow::new(BufferPublisher {
            upstream: self,
            count,
        })
    }
}

struct BufferPublisher<T> {
    upstream: Flow<T>,
    count: usize,
}

impl<T: Element> Publisher<Vec<T>> for BufferPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Vec<T>>>) {
        let adapter = Arc::new(BufferSubscriber {
            downstream: subscriber.clone(),
            count: self.count,
            batch: Mutex::new(Vec::with_capacity(self.count)),
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

struct BufferSubscriber<T> {
    downstream: Arc<dyn Subscriber<Vec<T>>>,
    count: usize,
    batch: Mutex<Vec<T>>,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T: Element> Subscriber<T> for BufferSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.upstream.set(upstream);
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let full = {
            let mut batch = self.batch.lock().unwrap();
            batch.push(item);
            if batch.len() == self.count {
                Some(std::mem::replace(
                    &mut *batch,
                    Vec::with_capacity(self.count),
                ))
            } else {
                None
            }
        };
        if let Some(full) = full {
            self.downstream.on_next(full);
        }
    }

    fn on_error(&self, error: FlowError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.batch.lock().unwrap().clear();
            self.downstream.on_error(error);
        }
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let tail = std::mem::take(&mut *self.batch.lock().unwrap());
        if !tail.is_empty() {
            // the final batch replaces a full one the demand already
            // covered
            self.downstream.on_next(tail);
        }
        self.downstream.on_complete();
    }
}

impl<T: Element> Subscription for BufferSubscriber<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.upstream.request(n.saturating_mul(self.count as u64));
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
    fn batches_are_exact_and_ordered() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 6).buffer(2).subscribe(ts.clone());
        ts.assert_values(&[vec![0, 1], vec![2, 3], vec![4, 5]]);
        ts.assert_complete();
    }

    #[test]
    fn completion_flushes_the_partial_batch() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 5).buffer(3).subscribe(ts.clone());
        ts.assert_values(&[vec![0, 1, 2], vec![3, 4]]);
        ts.assert_complete();
    }

    #[test]
    fn one_batch_of_demand_is_count_items_upstream() {
        let publisher: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(2);
        publisher.flow().buffer(4).subscribe(ts.clone());
        assert_eq!(publisher.requested(), 8);
    }
}
