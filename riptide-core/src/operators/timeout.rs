use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::backpressure::RelaySubscription;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::scheduler::{Cancellation, Scheduler, Worker};
use crate::types::Element;

const TERMINATED: u64 = u64::MAX;

/// Bound the silence between items
pub trait Timeout<T>: super::sealed::Sealed {
    /// Error with [FlowError::Timeout] when the first item takes longer
    /// than `first`, or any later item longer than `each` after its
    /// predecessor.
    fn timeout(self, first: Duration, each: Duration, scheduler: Arc<dyn Scheduler>) -> Flow<T>;

    /// Like [Timeout::timeout], but switch to `fallback` instead of
    /// erroring. Outstanding demand carries over to the fallback.
    fn timeout_with(
        self,
        first: Duration,
        each: Duration,
        fallback: Flow<T>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Flow<T>;
}

impl<T: Element> Timeout<T> for Flow<T> {
    fn timeout(self, first: Duration, each: Duration, scheduler: Arc<dyn Scheduler>) -> Flow<T> {
        Flow::new(TimeoutPublisher {
            upstream: self,
            first,
            each,
            fallback: None,
            scheduler,
        })
    }

    fn timeout_with(
        self,
        first: Duration,
        each: Duration,
        fallback: Flow<T>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Flow<T> {
        Flow::new(TimeoutPublisher {
            upstream: self,
            first,
            each,
            fallback: Some(fallback),
            scheduler,
        })
    }
}

struct TimeoutPublisher<T> {
    upstream: Flow<T>,
    first: Duration,
    each: Duration,
    fallback: Option<Flow<T>>,
    scheduler: Arc<dyn Scheduler>,
}

impl<T: Element> Publisher<T> for TimeoutPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let adapter = Arc::new_cyclic(|this: &Weak<TimeoutSubscriber<T>>| TimeoutSubscriber {
            this: this.clone(),
            downstream: subscriber.clone(),
            worker: self.scheduler.worker(),
            each: self.each,
            fallback: self.fallback.clone(),
            relay: Arc::new(RelaySubscription::new()),
            index: AtomicU64::new(0),
            pending: Mutex::new(None),
        });
        subscriber.on_subscribe(Upstream::plain(Arc::new(TimeoutSubscription {
            adapter: adapter.clone(),
        })));
        adapter.arm(0, self.first);
        self.upstream.subscribe(adapter);
    }
}

struct TimeoutSubscriber<T> {
    this: Weak<TimeoutSubscriber<T>>,
    downstream: Arc<dyn Subscriber<T>>,
    worker: Arc<dyn Worker>,
    each: Duration,
    fallback: Option<Flow<T>>,
    relay: Arc<RelaySubscription<T>>,
    /// item generation; [TERMINATED] once the flow settled either way
    index: AtomicU64,
    pending: Mutex<Option<Cancellation>>,
}

impl<T: Element> TimeoutSubscriber<T> {
    /// Schedule the countdown watching generation `index`.
    fn arm(&self, index: u64, window: Duration) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let handle = self.worker.schedule_delayed(
            Box::new(move || {
                this.fire(index);
            }),
            window,
        );
        let stale = self.pending.lock().unwrap().replace(handle);
        if let Some(stale) = stale {
            stale.cancel();
        }
    }

    /// The countdown for generation `index` elapsed.
    fn fire(&self, index: u64) {
        if self
            .index
            .compare_exchange(index, TERMINATED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        match &self.fallback {
            Some(fallback) => {
                self.relay.cancel_current();
                let Some(this) = self.this.upgrade() else {
                    return;
                };
                fallback.subscribe(Arc::new(TimeoutFallback { parent: this }));
            }
            None => {
                self.relay.cancel();
                self.downstream.on_error(FlowError::Timeout(self.each));
                self.worker.dispose();
            }
        }
    }

    fn disarm(&self) {
        if let Some(pending) = self.pending.lock().unwrap().take() {
            pending.cancel();
        }
    }
}

impl<T: Element> Subscriber<T> for TimeoutSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.relay.set_upstream(upstream);
    }

    fn on_next(&self, item: T) {
        let index = self.index.load(Ordering::Acquire);
        if index == TERMINATED {
            return;
        }
        if self
            .index
            .compare_exchange(index, index + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // the countdown beat this item
            return;
        }
        self.relay.produced(1);
        self.downstream.on_next(item);
        self.arm(index + 1, self.each);
    }

    fn on_error(&self, error: FlowError) {
        if self.index.swap(TERMINATED, Ordering::AcqRel) != TERMINATED {
            self.disarm();
            self.downstream.on_error(error);
            self.worker.dispose();
        }
    }

    fn on_complete(&self) {
        if self.index.swap(TERMINATED, Ordering::AcqRel) != TERMINATED {
            self.disarm();
            self.downstream.on_complete();
            self.worker.dispose();
        }
    }
}

/// Relays the fallback flow once the timeout tripped.
struct TimeoutFallback<T> {
    parent: Arc<TimeoutSubscriber<T>>,
}

impl<T: Element> Subscriber<T> for TimeoutFallback<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.parent.relay.set_upstream(upstream);
    }

    fn on_next(&self, item: T) {
        self.parent.relay.produced(1);
        self.parent.downstream.on_next(item);
    }

    fn on_error(&self, error: FlowError) {
        self.parent.downstream.on_error(error);
        self.parent.worker.dispose();
    }

    fn on_complete(&self) {
        self.parent.downstream.on_complete();
        self.parent.worker.dispose();
    }
}

struct TimeoutSubscription<T> {
    adapter: Arc<TimeoutSubscriber<T>>,
}

impl<T: Element> Subscription for TimeoutSubscription<T> {
    fn request(&self, n: u64) {
        self.adapter.relay.request(n);
    }

    fn cancel(&self) {
        self.adapter.index.store(TERMINATED, Ordering::Release);
        self.adapter.disarm();
        self.adapter.relay.cancel();
        self.adapter.worker.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestPublisher, TestScheduler, TestSubscriber};

    #[test]
    fn quiet_upstream_times_out() {
        let scheduler = TestScheduler::new();
        let publisher: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher
            .flow()
            .timeout(
                Duration::from_millis(50),
                Duration::from_millis(50),
                Arc::new(scheduler.clone()),
            )
            .subscribe(ts.clone());
        publisher.emit(1);
        scheduler.advance_by(Duration::from_millis(49));
        publisher.emit(2);
        scheduler.advance_by(Duration::from_millis(50));
        ts.assert_values(&[1, 2]);
        ts.assert_error(&FlowError::Timeout(Duration::from_millis(50)));
        assert!(publisher.is_cancelled());
    }

    #[test]
    fn each_item_resets_the_countdown() {
        let scheduler = TestScheduler::new();
        let publisher: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher
            .flow()
            .timeout(
                Duration::from_millis(50),
                Duration::from_millis(50),
                Arc::new(scheduler.clone()),
            )
            .subscribe(ts.clone());
        for i in 0..5 {
            publisher.emit(i);
            scheduler.advance_by(Duration::from_millis(30));
        }
        ts.assert_values(&[0, 1, 2, 3, 4]);
        ts.assert_no_terminal();
    }

    #[test]
    fn stalled_flow_switches_to_the_fallback() {
        let scheduler = TestScheduler::new();
        let publisher: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher
            .flow()
            .timeout_with(
                Duration::from_millis(50),
                Duration::from_millis(50),
                Flow::just(99),
                Arc::new(scheduler.clone()),
            )
            .subscribe(ts.clone());
        publisher.emit(1);
        scheduler.advance_by(Duration::from_millis(50));
        assert!(publisher.is_cancelled());
        ts.assert_values(&[1, 99]);
        ts.assert_complete();
    }

    #[test]
    fn the_first_window_may_differ() {
        let scheduler = TestScheduler::new();
        let publisher: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher
            .flow()
            .timeout(
                Duration::from_millis(200),
                Duration::from_millis(10),
                Arc::new(scheduler.clone()),
            )
            .subscribe(ts.clone());
        scheduler.advance_by(Duration::from_millis(150));
        ts.assert_no_terminal();
        publisher.emit(1);
        scheduler.advance_by(Duration::from_millis(10));
        ts.assert_errored();
    }
}
