use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::backpressure::{DrainControl, SubscriptionSlot};
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

/// Emit only the last items of a flow
pub trait TakeLast<T>: super::sealed::Sealed {
    /// Remember the last `count` items and emit them, by request, once
    /// upstream completes. The whole upstream is consumed unboundedly.
    fn take_last(self, count: usize) -> Flow<T>;
}

impl<T: Element> TakeLast<T> for Flow<T> {
    fn take_last(self, count: usize) -> Flow<T> {
        Flow::new(TakeLastPublisher {
            upstream: self,
            count,
        })
    }
}

struct TakeLastPublisher<T> {
    upstream: Flow<T>,
    count: usize,
}

impl<T: Element> Publisher<T> for TakeLastPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let adapter = Arc::new(TakeLastSubscriber {
            downstream: subscriber.clone(),
            count: self.count,
            buffer: Mutex::new(VecDeque::with_capacity(self.count)),
            ctl: DrainControl::new(),
            finished: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            upstream: SubscriptionSlot::new(),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

struct TakeLastSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    count: usize,
    buffer: Mutex<VecDeque<T>>,
    ctl: DrainControl,
    /// upstream has completed; the buffer now holds the result
    finished: AtomicBool,
    terminated: AtomicBool,
    upstream: SubscriptionSlot<T>,
}

impl<T: Element> TakeLastSubscriber<T> {
    fn drain(&self) {
        if !self.ctl.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if self.ctl.is_cancelled() {
                self.buffer.lock().unwrap().clear();
            } else if self.finished.load(Ordering::Acquire) {
                let requested = self.ctl.requested();
                let mut emitted = 0u64;
                while emitted < requested {
                    let item = self.buffer.lock().unwrap().pop_front();
                    match item {
                        Some(item) => {
                            self.downstream.on_next(item);
                            emitted += 1;
                        }
                        None => break,
                    }
                }
                let empty = self.buffer.lock().unwrap().is_empty();
                if empty && !self.terminated.swap(true, Ordering::AcqRel) {
                    self.downstream.on_complete();
                }
                self.ctl.produced(emitted);
            }
            missed = self.ctl.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }
}

impl<T: Element> Subscriber<T> for TakeLastSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if self.upstream.set(upstream) {
            // the whole upstream must be seen to know its tail
            self.upstream.request(u64::MAX);
        }
    }

    fn on_next(&self, item: T) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        let mut buffer = self.buffer.lock().unwrap();
        if self.count == 0 {
            return;
        }
        if buffer.len() == self.count {
            buffer.pop_front();
        }
        buffer.push_back(item);
    }

    fn on_error(&self, error: FlowError) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.buffer.lock().unwrap().clear();
            self.downstream.on_error(error);
        }
    }

    fn on_complete(&self) {
        self.finished.store(true, Ordering::Release);
        self.drain();
    }
}

impl<T: Element> Subscription for TakeLastSubscriber<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.ctl.request(n);
        self.drain();
    }

    fn cancel(&self) {
        self.ctl.cancel();
        self.upstream.cancel();
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSubscriber;

    #[test]
    fn keeps_only_the_tail() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 10).take_last(3).subscribe(ts.clone());
        ts.assert_values(&[7, 8, 9]);
        ts.assert_complete();
    }

    #[test]
    fn shorter_flows_pass_whole() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 2).take_last(5).subscribe(ts.clone());
        ts.assert_values(&[0, 1]);
        ts.assert_complete();
    }

    #[test]
    fn tail_respects_demand() {
        let ts = TestSubscriber::new(0);
        Flow::range(0, 10).take_last(2).subscribe(ts.clone());
        ts.assert_values(&[]);
        ts.request(1);
        ts.assert_values(&[8]);
        ts.request(1);
        ts.assert_values(&[8, 9]);
        ts.assert_complete();
    }

    #[test]
    fn take_last_zero_just_completes() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 5).take_last(0).subscribe(ts.clone());
        ts.assert_values(&[]);
        ts.assert_complete();
    }
}
