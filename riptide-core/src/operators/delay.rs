use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backpressure::SubscriptionSlot;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::scheduler::{Scheduler, Worker};
use crate::types::Element;

/// Shift signals forward in time
pub trait Delay<T>: super::sealed::Sealed {
    /// Deliver every item (and the completion) `delay` later on a worker
    /// of `scheduler`; ordering is preserved by the worker's FIFO
    /// trampoline. Errors are not delayed — they overtake pending items.
    fn delay(self, delay: Duration, scheduler: Arc<dyn Scheduler>) -> Flow<T>;

    /// Delay the subscription itself rather than the items.
    fn delay_subscription(self, delay: Duration, scheduler: Arc<dyn Scheduler>) -> Flow<T>;
}

impl<T: Element> Delay<T> for Flow<T> {
    fn delay(self, delay: Duration, scheduler: Arc<dyn Scheduler>) -> Flow<T> {
        Flow::new(DelayPublisher {
            upstream: self,
            delay,
            scheduler,
        })
    }

    fn delay_subscription(self, delay: Duration, scheduler: Arc<dyn Scheduler>) -> Flow<T> {
        Flow::new(DelaySubscriptionPublisher {
            upstream: self,
            delay,
            scheduler,
        })
    }
}

struct DelayPublisher<T> {
    upstream: Flow<T>,
    delay: Duration,
    scheduler: Arc<dyn Scheduler>,
}

impl<T: Element> Publisher<T> for DelayPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let adapter = Arc::new(DelaySubscriber {
            downstream: subscriber.clone(),
            worker: self.scheduler.worker(),
            delay: self.delay,
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
            dead: Arc::new(AtomicBool::new(false)),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

struct DelaySubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    worker: Arc<dyn Worker>,
    delay: Duration,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
    /// set when an error or cancel preempted the delayed deliveries
    dead: Arc<AtomicBool>,
}

impl<T: Element> Subscriber<T> for DelaySubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.upstream.set(upstream);
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let downstream = self.downstream.clone();
        let dead = Arc::clone(&self.dead);
        self.worker.schedule_delayed(
            Box::new(move || {
                if !dead.load(Ordering::Acquire) {
                    downstream.on_next(item);
                }
            }),
            self.delay,
        );
    }

    fn on_error(&self, error: FlowError) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let downstream = self.downstream.clone();
        let dead = Arc::clone(&self.dead);
        // errors jump the queue: scheduled without delay, they run
        // before items still waiting out their delay
        self.worker.schedule(Box::new(move || {
            dead.store(true, Ordering::Release);
            downstream.on_error(error);
        }));
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let downstream = self.downstream.clone();
        self.worker.schedule_delayed(
            Box::new(move || {
                downstream.on_complete();
            }),
            self.delay,
        );
    }
}

impl<T: Element> Subscription for DelaySubscriber<T> {
    fn request(&self, n: u64) {
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        self.dead.store(true, Ordering::Release);
        self.upstream.cancel();
        self.worker.dispose();
    }
}

struct DelaySubscriptionPublisher<T> {
    upstream: Flow<T>,
    delay: Duration,
    scheduler: Arc<dyn Scheduler>,
}

impl<T: Element> Publisher<T> for DelaySubscriptionPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let adapter = Arc::new(DelayedAttachSubscriber {
            downstream: subscriber.clone(),
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        let upstream = self.upstream.clone();
        let worker = self.scheduler.worker();
        let attach_worker = worker.clone();
        worker.schedule_delayed(
            Box::new(move || {
                upstream.subscribe(adapter);
                attach_worker.dispose();
            }),
            self.delay,
        );
    }
}

struct DelayedAttachSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T: Element> Subscriber<T> for DelayedAttachSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.upstream.set(upstream);
    }

    fn on_next(&self, item: T) {
        if !self.done.load(Ordering::Acquire) {
            self.downstream.on_next(item);
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

impl<T: Element> Subscription for DelayedAttachSubscriber<T> {
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
    use crate::testing::{TestPublisher, TestScheduler, TestSubscriber};

    #[test]
    fn items_arrive_after_the_delay() {
        let scheduler = TestScheduler::new();
        let publisher: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher
            .flow()
            .delay(Duration::from_millis(100), Arc::new(scheduler.clone()))
            .subscribe(ts.clone());
        publisher.emit(1);
        publisher.emit(2);
        scheduler.advance_by(Duration::from_millis(99));
        ts.assert_values(&[]);
        scheduler.advance_by(Duration::from_millis(1));
        ts.assert_values(&[1, 2]);
    }

    #[test]
    fn completion_is_delayed_too() {
        let scheduler = TestScheduler::new();
        let publisher: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher
            .flow()
            .delay(Duration::from_millis(50), Arc::new(scheduler.clone()))
            .subscribe(ts.clone());
        publisher.emit(7);
        publisher.complete();
        scheduler.advance_by(Duration::from_millis(50));
        ts.assert_values(&[7]);
        ts.assert_complete();
    }

    #[test]
    fn errors_overtake_delayed_items() {
        let scheduler = TestScheduler::new();
        let publisher: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher
            .flow()
            .delay(Duration::from_millis(50), Arc::new(scheduler.clone()))
            .subscribe(ts.clone());
        publisher.emit(1);
        publisher.error(FlowError::callback("now"));
        scheduler.advance_by(Duration::from_millis(100));
        ts.assert_error(&FlowError::callback("now"));
        ts.assert_values(&[]);
    }

    #[test]
    fn delay_subscription_defers_the_attach() {
        let scheduler = TestScheduler::new();
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 3)
            .delay_subscription(Duration::from_millis(30), Arc::new(scheduler.clone()))
            .subscribe(ts.clone());
        ts.assert_values(&[]);
        scheduler.advance_by(Duration::from_millis(30));
        ts.assert_values(&[0, 1, 2]);
        ts.assert_complete();
    }
}
