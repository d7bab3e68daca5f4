use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::backpressure::{requests, SignalGate, SubscriptionSlot};
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::scheduler::{Scheduler, Worker};
use crate::types::Element;

/// Rate-limit a flow
pub trait Throttle<T>: super::sealed::Sealed {
    /// Emit the first item of every `window`; everything else inside the
    /// window is dropped. The upstream is consumed unboundedly.
    fn throttle_first(self, window: Duration, scheduler: Arc<dyn Scheduler>) -> Flow<T>;

    /// Emit the first item immediately, then at most one item — the
    /// newest — per `period`.
    fn throttle_latest(self, period: Duration, scheduler: Arc<dyn Scheduler>) -> Flow<T>;
}

impl<T: Element> Throttle<T> for Flow<T> {
    fn throttle_first(self, window: Duration, scheduler: Arc<dyn Scheduler>) -> Flow<T> {
        Flow::new(ThrottleFirstPublisher {
            upstream: self,
            window,
            scheduler,
        })
    }

    fn throttle_latest(self, period: Duration, scheduler: Arc<dyn Scheduler>) -> Flow<T> {
        Flow::new(ThrottleLatestPublisher {
            upstream: self,
            period,
            scheduler,
        })
    }
}

struct ThrottleFirstPublisher<T> {
    upstream: Flow<T>,
    window: Duration,
    scheduler: Arc<dyn Scheduler>,
}

impl<T: Element> Publisher<T> for ThrottleFirstPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let adapter = Arc::new_cyclic(|this: &Weak<ThrottleFirstSubscriber<T>>| {
            ThrottleFirstSubscriber {
                this: this.clone(),
                downstream: subscriber.clone(),
                worker: self.scheduler.worker(),
                window: self.window,
                open: AtomicBool::new(true),
                requested: AtomicU64::new(0),
                gate: SignalGate::new(),
                upstream: SubscriptionSlot::new(),
                done: AtomicBool::new(false),
            }
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

struct ThrottleFirstSubscriber<T> {
    this: Weak<ThrottleFirstSubscriber<T>>,
    downstream: Arc<dyn Subscriber<T>>,
    worker: Arc<dyn Worker>,
    window: Duration,
    /// true while the next arrival may pass
    open: AtomicBool,
    requested: AtomicU64,
    gate: SignalGate,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T: Element> Subscriber<T> for ThrottleFirstSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if self.upstream.set(upstream) {
            self.upstream.request(u64::MAX);
        }
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        if !requests::consume_one(&self.requested) {
            self.done.store(true, Ordering::Release);
            self.upstream.cancel();
            self.worker.dispose();
            self.gate
                .error(self.downstream.as_ref(), FlowError::MissingBackpressure);
            return;
        }
        self.gate.next(self.downstream.as_ref(), item);
        if let Some(this) = self.this.upgrade() {
            self.worker.schedule_delayed(
                Box::new(move || {
                    this.open.store(true, Ordering::Release);
                }),
                self.window,
            );
        }
    }

    fn on_error(&self, error: FlowError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.worker.dispose();
            self.gate.error(self.downstream.as_ref(), error);
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.worker.dispose();
            self.gate.complete(self.downstream.as_ref());
        }
    }
}

impl<T: Element> Subscription for ThrottleFirstSubscriber<T> {
    fn request(&self, n: u64) {
        requests::add(&self.requested, n);
    }

    fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        self.upstream.cancel();
        self.worker.dispose();
    }
}

struct ThrottleLatestPublisher<T> {
    upstream: Flow<T>,
    period: Duration,
    scheduler: Arc<dyn Scheduler>,
}

impl<T: Element> Publisher<T> for ThrottleLatestPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let adapter = Arc::new_cyclic(|this: &Weak<ThrottleLatestSubscriber<T>>| {
            ThrottleLatestSubscriber {
                this: this.clone(),
                downstream: subscriber.clone(),
                worker: self.scheduler.worker(),
                period: self.period,
                latest: Mutex::new(None),
                timing: AtomicBool::new(false),
                requested: AtomicU64::new(0),
                gate: SignalGate::new(),
                upstream: SubscriptionSlot::new(),
                done: AtomicBool::new(false),
            }
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

struct ThrottleLatestSubscriber<T> {
    this: Weak<ThrottleLatestSubscriber<T>>,
    downstream: Arc<dyn Subscriber<T>>,
    worker: Arc<dyn Worker>,
    period: Duration,
    latest: Mutex<Option<T>>,
    /// whether the periodic emitter is running
    timing: AtomicBool,
    requested: AtomicU64,
    gate: SignalGate,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T: Element> ThrottleLatestSubscriber<T> {
    fn deliver(&self, item: T) {
        if requests::consume_one(&self.requested) {
            self.gate.next(self.downstream.as_ref(), item);
        } else {
            self.done.store(true, Ordering::Release);
            self.upstream.cancel();
            self.worker.dispose();
            self.gate
                .error(self.downstream.as_ref(), FlowError::MissingBackpressure);
        }
    }

    fn tick(&self) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let item = self.latest.lock().unwrap().take();
        if let Some(item) = item {
            self.deliver(item);
        }
    }
}

impl<T: Element> Subscriber<T> for ThrottleLatestSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if self.upstream.set(upstream) {
            self.upstream.request(u64::MAX);
        }
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if !self.timing.swap(true, Ordering::AcqRel) {
            // the window opener goes straight through
            self.deliver(item);
            if let Some(this) = self.this.upgrade() {
                self.worker.schedule_periodic(
                    Box::new(move || this.tick()),
                    self.period,
                    self.period,
                );
            }
        } else {
            *self.latest.lock().unwrap() = Some(item);
        }
    }

    fn on_error(&self, error: FlowError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.latest.lock().unwrap().take();
            self.worker.dispose();
            self.gate.error(self.downstream.as_ref(), error);
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.latest.lock().unwrap().take();
            self.worker.dispose();
            self.gate.complete(self.downstream.as_ref());
        }
    }
}

impl<T: Element> Subscription for ThrottleLatestSubscriber<T> {
    fn request(&self, n: u64) {
        requests::add(&self.requested, n);
    }

    fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        self.upstream.cancel();
        self.worker.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestPublisher, TestScheduler, TestSubscriber};

    #[test]
    fn first_per_window_passes() {
        let scheduler = TestScheduler::new();
        let publisher: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher
            .flow()
            .throttle_first(Duration::from_millis(100), Arc::new(scheduler.clone()))
            .subscribe(ts.clone());
        publisher.emit(1);
        publisher.emit(2);
        publisher.emit(3);
        ts.assert_values(&[1]);
        scheduler.advance_by(Duration::from_millis(100));
        publisher.emit(4);
        publisher.emit(5);
        ts.assert_values(&[1, 4]);
    }

    #[test]
    fn latest_emits_the_newest_per_period() {
        let scheduler = TestScheduler::new();
        let publisher: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher
            .flow()
            .throttle_latest(Duration::from_millis(100), Arc::new(scheduler.clone()))
            .subscribe(ts.clone());
        publisher.emit(1);
        ts.assert_values(&[1]);
        publisher.emit(2);
        publisher.emit(3);
        scheduler.advance_by(Duration::from_millis(100));
        ts.assert_values(&[1, 3]);
    }
}
