//! The canonical cold generator: an iterator served strictly by request,
//! with SYNC fusion for downstreams that want to poll it directly.
use std::iter::Peekable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use crate::backpressure::requests;
use crate::flow::{
    Flow, FusionMode, Publisher, QueueSubscription, Subscriber, Subscription, Upstream,
};
use crate::types::Element;

impl<T: Element> Flow<T> {
    /// A flow replaying `iter` for every subscriber, one item per unit
    /// of demand.
    ///
    /// # Example
    /// ```rust
    /// use riptide::blocking::Blocking;
    /// use riptide::flow::Flow;
    ///
    /// let out = Flow::from_iter(vec![1, 2, 3]).blocking_collect().unwrap();
    /// assert_eq!(out, vec![1, 2, 3]);
    /// ```
    pub fn from_iter<I>(iter: I) -> Flow<T>
    where
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        I::IntoIter: Send,
    {
        Flow::new(IterPublisher { iter })
    }
}

impl Flow<i64> {
    /// The integers `start..start + count`.
    pub fn range(start: i64, count: u64) -> Flow<i64> {
        Flow::from_iter(start..start.saturating_add_unsigned(count))
    }
}

struct IterPublisher<I> {
    iter: I,
}

impl<T, I> Publisher<T> for IterPublisher<I>
where
    T: Element,
    I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
    I::IntoIter: Send,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let subscription = Arc::new(IterSubscription {
            iter: Mutex::new(self.iter.clone().into_iter().peekable()),
            downstream: subscriber.clone(),
            requested: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            fused: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Upstream::fused(subscription));
    }
}

struct IterSubscription<T, I: Iterator<Item = T>> {
    iter: Mutex<Peekable<I>>,
    downstream: Arc<dyn Subscriber<T>>,
    requested: AtomicU64,
    cancelled: AtomicBool,
    fused: AtomicBool,
}

impl<T, I> IterSubscription<T, I>
where
    T: Element,
    I: Iterator<Item = T> + Send,
{
    fn drain(&self) {
        let mut emitted = 0u64;
        let mut outstanding = self.requested.load(Ordering::Acquire);
        loop {
            while emitted < outstanding {
                if self.cancelled.load(Ordering::Acquire) {
                    return;
                }
                let next = self.iter.lock().unwrap().next();
                match next {
                    Some(item) => {
                        self.downstream.on_next(item);
                        emitted += 1;
                    }
                    None => {
                        if !self.cancelled.load(Ordering::Acquire) {
                            self.downstream.on_complete();
                        }
                        return;
                    }
                }
            }
            if self.iter.lock().unwrap().peek().is_none() {
                if !self.cancelled.load(Ordering::Acquire) {
                    self.downstream.on_complete();
                }
                return;
            }
            // demand exhausted; settle what we emitted and stop unless
            // more arrived in the meantime
            let fresh = self.requested.load(Ordering::Acquire);
            if fresh == outstanding {
                outstanding = requests::consume(&self.requested, emitted);
                if outstanding == 0 {
                    return;
                }
                emitted = 0;
            } else {
                outstanding = fresh;
            }
        }
    }
}

impl<T, I> Subscription for IterSubscription<T, I>
where
    T: Element,
    I: Iterator<Item = T> + Send,
{
    fn request(&self, n: u64) {
        if n == 0 || self.fused.load(Ordering::Acquire) {
            return;
        }
        if requests::add(&self.requested, n) == 0 {
            self.drain();
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl<T, I> QueueSubscription<T> for IterSubscription<T, I>
where
    T: Element,
    I: Iterator<Item = T> + Send,
{
    fn enable_fusion(&self, requested: FusionMode) -> FusionMode {
        if requested == FusionMode::Sync {
            self.fused.store(true, Ordering::Release);
            FusionMode::Sync
        } else {
            FusionMode::None
        }
    }

    fn poll(&self) -> Option<T> {
        if self.cancelled.load(Ordering::Acquire) {
            return None;
        }
        self.iter.lock().unwrap().next()
    }

    fn is_queue_empty(&self) -> bool {
        self.iter.lock().unwrap().peek().is_none()
    }

    fn clear(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::TestSubscriber;

    #[test]
    fn honours_demand_exactly() {
        let ts = TestSubscriber::new(2);
        Flow::from_iter(1..=5).subscribe(ts.clone());
        ts.assert_values(&[1, 2]);
        ts.assert_no_terminal();
        ts.request(2);
        ts.assert_values(&[1, 2, 3, 4]);
        ts.request(10);
        ts.assert_values(&[1, 2, 3, 4, 5]);
        ts.assert_complete();
    }

    #[test]
    fn completes_empty_input_without_demand() {
        let ts: std::sync::Arc<TestSubscriber<i32>> = TestSubscriber::new(0);
        Flow::from_iter(Vec::<i32>::new()).subscribe(ts.clone());
        assert!(ts.await_terminal(Duration::from_secs(1)));
        ts.assert_complete();
    }

    #[test]
    fn range_yields_the_exact_integers() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(3, 4).subscribe(ts.clone());
        ts.assert_values(&[3, 4, 5, 6]);
        ts.assert_complete();
    }

    #[test]
    fn cancel_stops_emission() {
        let ts = TestSubscriber::new(1);
        Flow::range(0, 1000).subscribe(ts.clone());
        ts.cancel();
        ts.request(100);
        assert_eq!(ts.value_count(), 1);
    }

    #[test]
    fn unbounded_demand_runs_to_completion() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 100).subscribe(ts.clone());
        assert_eq!(ts.value_count(), 100);
        ts.assert_complete();
    }
}
