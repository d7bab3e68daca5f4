use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::backpressure::SubscriptionSlot;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

/// Drop the last items of a flow
pub trait SkipLast<T>: super::sealed::Sealed {
    /// Withhold the trailing `count` items: each item is emitted only
    /// once `count` further items have arrived behind it. The withheld
    /// amount is requested upstream on top of downstream demand.
    fn skip_last(self, count: usize) -> Flow<T>;
}

impl<T: Element> SkipLast<T> for Flow<T> {
    fn skip_last(self, count: usize) -> Flow<T> {
        Flow::new(SkipLastPublisher {
            upstream: self,
            count,
        })
    }
}

struct SkipLastPublisher<T> {
    upstream: Flow<T>,
    count: usize,
}

impl<T: Element> Publisher<T> for SkipLastPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let adapter = Arc::new(SkipLastSubscriber {
            downstream: subscriber.clone(),
            count: self.count,
            delay_line: Mutex::new(VecDeque::with_capacity(self.count + 1)),
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

struct SkipLastSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    count: usize,
    delay_line: Mutex<VecDeque<T>>,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T: Element> Subscriber<T> for SkipLastSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if self.upstream.set(upstream) && self.count > 0 {
            self.upstream.request(self.count as u64);
        }
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let ready = {
            let mut line = self.delay_line.lock().unwrap();
            line.push_back(item);
            if line.len() > self.count {
                line.pop_front()
            } else {
                None
            }
        };
        if let Some(item) = ready {
            self.downstream.on_next(item);
        }
    }

    fn on_error(&self, error: FlowError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.delay_line.lock().unwrap().clear();
            self.downstream.on_error(error);
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.delay_line.lock().unwrap().clear();
            self.downstream.on_complete();
        }
    }
}

impl<T: Element> Subscription for SkipLastSubscriber<T> {
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
    use crate::testing::{TestPublisher, TestSubscriber};

    #[test]
    fn withholds_the_tail() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 6).skip_last(2).subscribe(ts.clone());
        ts.assert_values(&[0, 1, 2, 3]);
        ts.assert_complete();
    }

    #[test]
    fn short_flows_are_swallowed_entirely() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 2).skip_last(5).subscribe(ts.clone());
        ts.assert_values(&[]);
        ts.assert_complete();
    }

    #[test]
    fn requests_the_withheld_amount_upfront() {
        let publisher = TestPublisher::<i32>::new();
        let ts = TestSubscriber::new(10);
        publisher.flow().skip_last(4).subscribe(ts.clone());
        assert_eq!(publisher.requested(), 14);
    }
}
