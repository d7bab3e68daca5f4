use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backpressure::{requests, SignalGate, SubscriptionSlot};
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::scheduler::{Scheduler, Worker};
use crate::types::Element;

/// Periodic snapshots of the latest item
pub trait Sample<T>: super::sealed::Sealed {
    /// Every `period`, emit the most recent item (if any arrived since
    /// the last tick). The upstream is consumed unboundedly; a tick that
    /// finds no downstream demand fails the flow.
    fn sample(self, period: Duration, scheduler: Arc<dyn Scheduler>) -> Flow<T>;
}

impl<T: Element> Sample<T> for Flow<T> {
    fn sample(self, period: Duration, scheduler: Arc<dyn Scheduler>) -> Flow<T> {
        Flow::new(SamplePublisher {
            upstream: self,
            period,
            scheduler,
        })
    }
}

struct SamplePublisher<T> {
    upstream: Flow<T>,
    period: Duration,
    scheduler: Arc<dyn Scheduler>,
}

impl<T: Element> Publisher<T> for SamplePublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let adapter = Arc::new(SampleSubscriber {
            downstream: subscriber.clone(),
            worker: self.scheduler.worker(),
            latest: Mutex::new(None),
            requested: AtomicU64::new(0),
            gate: SignalGate::new(),
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        let tick = adapter.clone();
        adapter.worker.schedule_periodic(
            Box::new(move || tick.tick()),
            self.period,
            self.period,
        );
        self.upstream.subscribe(adapter);
    }
}

struct SampleSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    worker: Arc<dyn Worker>,
    latest: Mutex<Option<T>>,
    requested: AtomicU64,
    /// serializes the periodic emitter against upstream terminals
    gate: SignalGate,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T: Element> SampleSubscriber<T> {
    fn tick(&self) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let Some(item) = self.latest.lock().unwrap().take() else {
            return;
        };
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
}

impl<T: Element> Subscriber<T> for SampleSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if self.upstream.set(upstream) {
            self.upstream.request(u64::MAX);
        }
    }

    fn on_next(&self, item: T) {
        if !self.done.load(Ordering::Acquire) {
            *self.latest.lock().unwrap() = Some(item);
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

impl<T: Element> Subscription for SampleSubscriber<T> {
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
    fn ticks_emit_only_the_newest() {
        let scheduler = TestScheduler::new();
        let publisher: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher
            .flow()
            .sample(Duration::from_millis(10), Arc::new(scheduler.clone()))
            .subscribe(ts.clone());
        publisher.emit(1);
        publisher.emit(2);
        scheduler.advance_by(Duration::from_millis(10));
        ts.assert_values(&[2]);
        scheduler.advance_by(Duration::from_millis(10));
        // no new item between ticks, nothing emitted
        ts.assert_values(&[2]);
        publisher.emit(3);
        scheduler.advance_by(Duration::from_millis(10));
        ts.assert_values(&[2, 3]);
    }

    #[test]
    fn completion_passes_straight_through() {
        let scheduler = TestScheduler::new();
        let publisher: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher
            .flow()
            .sample(Duration::from_millis(10), Arc::new(scheduler.clone()))
            .subscribe(ts.clone());
        publisher.complete();
        ts.assert_complete();
    }

    #[test]
    fn a_tick_without_demand_fails() {
        let scheduler = TestScheduler::new();
        let publisher: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(0);
        publisher
            .flow()
            .sample(Duration::from_millis(10), Arc::new(scheduler.clone()))
            .subscribe(ts.clone());
        publisher.emit(5);
        scheduler.advance_by(Duration::from_millis(10));
        ts.assert_error(&FlowError::MissingBackpressure);
        assert!(publisher.is_cancelled());
    }
}
