//! Time-driven sources.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backpressure::requests;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::scheduler::{Scheduler, Worker};

impl Flow<u64> {
    /// Emits `0` once after `delay`, then completes. Demand must exist by
    /// the time the timer fires, otherwise the flow errors.
    pub fn timer(delay: Duration, scheduler: Arc<dyn Scheduler>) -> Flow<u64> {
        Flow::new(TimerPublisher { delay, scheduler })
    }

    /// Emits `0, 1, 2, …` every `period`. A tick finding no outstanding
    /// demand errors with [FlowError::MissingBackpressure].
    pub fn interval(period: Duration, scheduler: Arc<dyn Scheduler>) -> Flow<u64> {
        Flow::new(IntervalPublisher { period, scheduler })
    }
}

struct TimerPublisher {
    delay: Duration,
    scheduler: Arc<dyn Scheduler>,
}

impl Publisher<u64> for TimerPublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<u64>>) {
        let worker = self.scheduler.worker();
        let subscription = Arc::new(TimerSubscription {
            requested: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            worker: worker.clone(),
        });
        subscriber.on_subscribe(Upstream::plain(subscription.clone()));
        let fire = subscription.clone();
        worker.schedule_delayed(
            Box::new(move || {
                if fire.cancelled.load(Ordering::Acquire) {
                    return;
                }
                if fire.requested.load(Ordering::Acquire) {
                    subscriber.on_next(0);
                    if !fire.cancelled.load(Ordering::Acquire) {
                        subscriber.on_complete();
                    }
                } else {
                    subscriber.on_error(FlowError::MissingBackpressure);
                }
                fire.worker.dispose();
            }),
            self.delay,
        );
    }
}

struct TimerSubscription {
    requested: AtomicBool,
    cancelled: AtomicBool,
    worker: Arc<dyn Worker>,
}

impl Subscription for TimerSubscription {
    fn request(&self, n: u64) {
        if n > 0 {
            self.requested.store(true, Ordering::Release);
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.worker.dispose();
    }
}

struct IntervalPublisher {
    period: Duration,
    scheduler: Arc<dyn Scheduler>,
}

impl Publisher<u64> for IntervalPublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<u64>>) {
        let worker = self.scheduler.worker();
        let subscription = Arc::new(IntervalSubscription {
            requested: AtomicU64::new(0),
            count: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            worker: worker.clone(),
        });
        subscriber.on_subscribe(Upstream::plain(subscription.clone()));
        let tick = subscription.clone();
        worker.schedule_periodic(
            Box::new(move || {
                if tick.cancelled.load(Ordering::Acquire) {
                    return;
                }
                let emitted = tick.count.load(Ordering::Relaxed);
                if emitted < tick.requested.load(Ordering::Acquire) {
                    tick.count.store(emitted + 1, Ordering::Relaxed);
                    subscriber.on_next(emitted);
                } else {
                    tick.worker.dispose();
                    subscriber.on_error(FlowError::MissingBackpressure);
                }
            }),
            self.period,
            self.period,
        );
    }
}

struct IntervalSubscription {
    requested: AtomicU64,
    count: AtomicU64,
    cancelled: AtomicBool,
    worker: Arc<dyn Worker>,
}

impl Subscription for IntervalSubscription {
    fn request(&self, n: u64) {
        requests::add(&self.requested, n);
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.worker.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestScheduler, TestSubscriber};

    #[test]
    fn timer_fires_once_after_the_delay() {
        let scheduler = TestScheduler::new();
        let ts = TestSubscriber::new(u64::MAX);
        Flow::timer(Duration::from_millis(100), Arc::new(scheduler.clone())).subscribe(ts.clone());
        scheduler.advance_by(Duration::from_millis(99));
        ts.assert_values(&[]);
        scheduler.advance_by(Duration::from_millis(1));
        ts.assert_values(&[0]);
        ts.assert_complete();
    }

    #[test]
    fn timer_without_demand_errors() {
        let scheduler = TestScheduler::new();
        let ts = TestSubscriber::new(0);
        Flow::timer(Duration::from_millis(10), Arc::new(scheduler.clone())).subscribe(ts.clone());
        scheduler.advance_by(Duration::from_millis(10));
        ts.assert_error(&FlowError::MissingBackpressure);
    }

    #[test]
    fn interval_counts_up() {
        let scheduler = TestScheduler::new();
        let ts = TestSubscriber::new(u64::MAX);
        Flow::interval(Duration::from_millis(10), Arc::new(scheduler.clone()))
            .subscribe(ts.clone());
        scheduler.advance_by(Duration::from_millis(35));
        ts.assert_values(&[0, 1, 2]);
        ts.assert_no_terminal();
    }

    #[test]
    fn cancelled_interval_stops_ticking() {
        let scheduler = TestScheduler::new();
        let ts = TestSubscriber::new(u64::MAX);
        Flow::interval(Duration::from_millis(10), Arc::new(scheduler.clone()))
            .subscribe(ts.clone());
        scheduler.advance_by(Duration::from_millis(20));
        ts.cancel();
        scheduler.advance_by(Duration::from_millis(50));
        ts.assert_values(&[0, 1]);
    }
}
