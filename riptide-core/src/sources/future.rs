//! One-shot task adapter: drives a future on a scheduler worker and
//! emits its output as a single item.
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use crate::backpressure::ScalarSubscription;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Upstream};
use crate::scheduler::{Scheduler, Worker};
use crate::types::Element;

impl<T: Element> Flow<T> {
    /// Run `future` on a worker of `scheduler` once a subscriber
    /// attaches, delivering its item (or error) when demand exists.
    ///
    /// The future is consumed by the first subscriber; later subscribers
    /// see a callback error.
    pub fn from_future<F>(future: F, scheduler: Arc<dyn Scheduler>) -> Flow<T>
    where
        F: Future<Output = Result<T, FlowError>> + Send + 'static,
    {
        Flow::new(FuturePublisher {
            future: Mutex::new(Some(Box::pin(future))),
            scheduler,
        })
    }
}

struct FuturePublisher<F> {
    future: Mutex<Option<Pin<Box<F>>>>,
    scheduler: Arc<dyn Scheduler>,
}

impl<T, F> Publisher<T> for FuturePublisher<F>
where
    T: Element,
    F: Future<Output = Result<T, FlowError>> + Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let subscription = Arc::new(ScalarSubscription::new(subscriber.clone()));
        subscriber.on_subscribe(Upstream::plain(subscription.clone()));
        let Some(future) = self.future.lock().unwrap().take() else {
            subscriber.on_error(FlowError::callback("future already consumed"));
            return;
        };
        let poller = Arc::new(FuturePoller {
            future: Mutex::new(Some(future)),
            subscription,
            downstream: subscriber,
            worker: self.scheduler.worker(),
        });
        poller.reschedule();
    }
}

struct FuturePoller<T, F> {
    future: Mutex<Option<Pin<Box<F>>>>,
    subscription: Arc<ScalarSubscription<T>>,
    downstream: Arc<dyn Subscriber<T>>,
    worker: Arc<dyn Worker>,
}

impl<T, F> FuturePoller<T, F>
where
    T: Element,
    F: Future<Output = Result<T, FlowError>> + Send + 'static,
{
    fn reschedule(self: &Arc<Self>) {
        let poller = Arc::clone(self);
        self.worker.schedule(Box::new(move || poller.poll_once()));
    }

    fn poll_once(self: Arc<Self>) {
        let mut slot = self.future.lock().unwrap();
        let Some(future) = slot.as_mut() else {
            return;
        };
        if self.subscription.is_cancelled() {
            slot.take();
            self.worker.dispose();
            return;
        }
        let waker = Waker::from(Arc::clone(&self));
        let mut ctx = Context::from_waker(&waker);
        match future.as_mut().poll(&mut ctx) {
            Poll::Ready(outcome) => {
                slot.take();
                drop(slot);
                match outcome {
                    Ok(item) => self.subscription.complete(item),
                    Err(error) => self.downstream.on_error(error),
                }
                self.worker.dispose();
            }
            Poll::Pending => {}
        }
    }
}

impl<T, F> Wake for FuturePoller<T, F>
where
    T: Element,
    F: Future<Output = Result<T, FlowError>> + Send + 'static,
{
    fn wake(self: Arc<Self>) {
        self.reschedule();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::scheduler::SingleScheduler;
    use crate::testing::TestSubscriber;

    #[test]
    fn ready_future_emits_one_item() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(SingleScheduler::new());
        let flow = Flow::from_future(async { Ok(41) }, scheduler);
        let ts = TestSubscriber::new(u64::MAX);
        flow.subscribe(ts.clone());
        assert!(ts.await_terminal(Duration::from_secs(2)));
        ts.assert_values(&[41]);
        ts.assert_complete();
    }

    #[test]
    fn failed_future_errors() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(SingleScheduler::new());
        let flow: Flow<i32> =
            Flow::from_future(async { Err(FlowError::callback("boom")) }, scheduler);
        let ts = TestSubscriber::new(u64::MAX);
        flow.subscribe(ts.clone());
        assert!(ts.await_terminal(Duration::from_secs(2)));
        ts.assert_error(&FlowError::callback("boom"));
    }

    #[test]
    fn item_waits_for_demand() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(SingleScheduler::new());
        let flow = Flow::from_future(async { Ok(9) }, scheduler);
        let ts = TestSubscriber::new(0);
        flow.subscribe(ts.clone());
        assert!(!ts.await_terminal(Duration::from_millis(100)));
        ts.request(1);
        assert!(ts.await_terminal(Duration::from_secs(2)));
        ts.assert_values(&[9]);
    }
}
