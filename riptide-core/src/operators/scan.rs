use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::backpressure::SubscriptionSlot;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

/// Running accumulation over a flow
pub trait Scan<T>: super::sealed::Sealed {
    /// Fold every item into an accumulator seeded with `seed` and emit
    /// the updated accumulator after each item; one output per input.
    ///
    /// # Example
    /// ```rust
    /// use riptide::flow::Flow;
    /// use riptide::operators::*;
    /// use riptide::testing::TestSubscriber;
    ///
    /// let ts = TestSubscriber::new(u64::MAX);
    /// Flow::range(1, 4).scan(0, |acc, x| acc + x).subscribe(ts.clone());
    /// ts.assert_values(&[1, 3, 6, 10]);
    /// ```
    fn scan<A: Element + Clone + Sync>(
        self,
        seed: A,
        accumulate: impl Fn(A, T) -> A + Send + Sync + 'static,
    ) -> Flow<A>;
}

impl<T: Element> Scan<T> for Flow<T> {
    fn scan<A: Element + Clone + Sync>(
        self,
        seed: A,
        accumulate: impl Fn(A, T) -> A + Send + Sync + 'static,
    ) -> Flow<A> {
        Flow::new(ScanPublisher {
            upstream: self,
            seed,
            accumulate: Arc::new(accumulate),
        })
    }
}

struct ScanPublisher<T, A, F> {
    upstream: Flow<T>,
    seed: A,
    accumulate: Arc<F>,
}

impl<T, A, F> Publisher<A> for ScanPublisher<T, A, F>
where
    T: Element,
    A: Element + Clone + Sync,
    F: Fn(A, T) -> A + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<A>>) {
        let adapter = Arc::new(ScanSubscriber {
            downstream: subscriber.clone(),
            accumulate: Arc::clone(&self.accumulate),
            state: Mutex::new(self.seed.clone()),
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

struct ScanSubscriber<T, A, F> {
    downstream: Arc<dyn Subscriber<A>>,
    accumulate: Arc<F>,
    state: Mutex<A>,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T, A, F> Subscriber<T> for ScanSubscriber<T, A, F>
where
    T: Element,
    A: Element + Clone,
    F: Fn(A, T) -> A + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.upstream.set(upstream);
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let next = {
            let mut state = self.state.lock().unwrap();
            let next = (self.accumulate)(state.clone(), item);
            *state = next.clone();
            next
        };
        self.downstream.on_next(next);
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

impl<T, A, F> Subscription for ScanSubscriber<T, A, F>
where
    T: Element,
    A: Element + Clone,
    F: Fn(A, T) -> A + Send + Sync + 'static,
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
    use crate::testing::TestSubscriber;

    #[test]
    fn emits_running_totals() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(1, 5).scan(0, |acc, x| acc + x).subscribe(ts.clone());
        ts.assert_values(&[1, 3, 6, 10, 15]);
        ts.assert_complete();
    }

    #[test]
    fn every_subscription_starts_from_the_seed() {
        let flow = Flow::range(1, 3).scan(100, |acc, x| acc + x);
        let first = TestSubscriber::new(u64::MAX);
        flow.subscribe(first.clone());
        let second = TestSubscriber::new(u64::MAX);
        flow.subscribe(second.clone());
        first.assert_values(&[101, 103, 106]);
        second.assert_values(&[101, 103, 106]);
    }
}
