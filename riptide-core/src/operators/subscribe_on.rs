use std::sync::{Arc, Weak};

use crate::backpressure::SubscriptionSlot;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::scheduler::{Scheduler, Worker};
use crate::types::Element;

/// Move the act of subscribing onto a scheduler
pub trait SubscribeOn<T>: super::sealed::Sealed {
    /// Perform the upstream subscription call on a worker of
    /// `scheduler`. With `request_on` set, downstream requests hop onto
    /// the same worker too — required when the upstream generates items
    /// synchronously inside `request` and must not run on the
    /// requesting thread.
    fn subscribe_on(self, scheduler: Arc<dyn Scheduler>, request_on: bool) -> Flow<T>;
}

impl<T: Element> SubscribeOn<T> for Flow<T> {
    fn subscribe_on(self, scheduler: Arc<dyn Scheduler>, request_on: bool) -> Flow<T> {
        Flow::new(SubscribeOnPublisher {
            upstream: self,
            scheduler,
            request_on,
        })
    }
}

struct SubscribeOnPublisher<T> {
    upstream: Flow<T>,
    scheduler: Arc<dyn Scheduler>,
    request_on: bool,
}

impl<T: Element> Publisher<T> for SubscribeOnPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let worker = self.scheduler.worker();
        let adapter = Arc::new_cyclic(|this: &Weak<SubscribeOnSubscriber<T>>| {
            SubscribeOnSubscriber {
                this: this.clone(),
                downstream: subscriber.clone(),
                upstream: SubscriptionSlot::new(),
                worker: worker.clone(),
                request_on: self.request_on,
            }
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        let upstream = self.upstream.clone();
        let attach = adapter.clone();
        worker.schedule(Box::new(move || {
            upstream.subscribe(attach);
        }));
    }
}

struct SubscribeOnSubscriber<T> {
    this: Weak<SubscribeOnSubscriber<T>>,
    downstream: Arc<dyn Subscriber<T>>,
    upstream: SubscriptionSlot<T>,
    worker: Arc<dyn Worker>,
    request_on: bool,
}

impl<T: Element> Subscriber<T> for SubscribeOnSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.upstream.set(upstream);
    }

    fn on_next(&self, item: T) {
        self.downstream.on_next(item);
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
        self.worker.dispose();
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
        self.worker.dispose();
    }
}

impl<T: Element> Subscription for SubscribeOnSubscriber<T> {
    fn request(&self, n: u64) {
        if self.request_on {
            if let Some(this) = self.this.upgrade() {
                self.worker.schedule(Box::new(move || {
                    this.upstream.request(n);
                }));
            }
        } else {
            self.upstream.request(n);
        }
    }

    fn cancel(&self) {
        self.upstream.cancel();
        self.worker.dispose();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::scheduler::SingleScheduler;
    use crate::testing::TestSubscriber;

    #[test]
    fn subscription_happens_on_the_worker() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(SingleScheduler::new());
        let seen = Arc::new(Mutex::new(None));
        let record = Arc::clone(&seen);
        let flow = Flow::defer(move || {
            *record.lock().unwrap() = Some(thread::current().id());
            Flow::range(0, 3)
        });
        let ts = TestSubscriber::new(u64::MAX);
        flow.subscribe_on(scheduler, false).subscribe(ts.clone());
        assert!(ts.await_terminal(Duration::from_secs(5)));
        let subscribe_thread = seen.lock().unwrap().take();
        assert!(subscribe_thread.is_some());
        assert_ne!(subscribe_thread, Some(thread::current().id()));
        ts.assert_values(&[0, 1, 2]);
    }

    #[test]
    fn requests_can_hop_to_the_worker_too() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(SingleScheduler::new());
        let ts = TestSubscriber::new(0);
        Flow::range(0, 5)
            .subscribe_on(scheduler, true)
            .subscribe(ts.clone());
        ts.request(5);
        assert!(ts.await_terminal(Duration::from_secs(5)));
        ts.assert_values(&[0, 1, 2, 3, 4]);
        ts.assert_complete();
    }
}
