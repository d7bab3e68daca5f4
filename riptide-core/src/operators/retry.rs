use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::backpressure::RelaySubscription;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Upstream};
use crate::types::Element;

/// Resubscribe after errors
pub trait Retry<T>: super::sealed::Sealed {
    /// Resubscribe up to `attempts` times when the flow errors; the
    /// error that exhausts the budget is delivered downstream.
    fn retry(self, attempts: u64) -> Flow<T>;

    /// Resubscribe for as long as `should_retry` approves the error.
    fn retry_if(
        self,
        should_retry: impl Fn(&FlowError) -> bool + Send + Sync + 'static,
    ) -> Flow<T>;
}

impl<T: Element> Retry<T> for Flow<T> {
    fn retry(self, attempts: u64) -> Flow<T> {
        Flow::new(RetryPublisher {
            upstream: self,
            budget: attempts,
            should_retry: Arc::new(|_: &FlowError| true),
        })
    }

    fn retry_if(
        self,
        should_retry: impl Fn(&FlowError) -> bool + Send + Sync + 'static,
    ) -> Flow<T> {
        Flow::new(RetryPublisher {
            upstream: self,
            budget: u64::MAX,
            should_retry: Arc::new(should_retry),
        })
    }
}

struct RetryPublisher<T> {
    upstream: Flow<T>,
    budget: u64,
    should_retry: Arc<dyn Fn(&FlowError) -> bool + Send + Sync>,
}

impl<T: Element> Publisher<T> for RetryPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let adapter = Arc::new_cyclic(|this: &Weak<RetrySubscriber<T>>| RetrySubscriber {
            this: this.clone(),
            source: self.upstream.clone(),
            downstream: subscriber.clone(),
            relay: Arc::new(RelaySubscription::new()),
            budget: AtomicU64::new(self.budget),
            should_retry: Arc::clone(&self.should_retry),
            wip: AtomicUsize::new(0),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.relay.clone()));
        adapter.resubscribe();
    }
}

struct RetrySubscriber<T> {
    this: Weak<RetrySubscriber<T>>,
    source: Flow<T>,
    downstream: Arc<dyn Subscriber<T>>,
    relay: Arc<RelaySubscription<T>>,
    budget: AtomicU64,
    should_retry: Arc<dyn Fn(&FlowError) -> bool + Send + Sync>,
    wip: AtomicUsize,
}

impl<T: Element> RetrySubscriber<T> {
    fn resubscribe(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            if !self.relay.is_cancelled() {
                if let Some(this) = self.this.upgrade() {
                    self.source.subscribe(this);
                }
            }
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                return;
            }
        }
    }
}

impl<T: Element> Subscriber<T> for RetrySubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.relay.set_upstream(upstream);
    }

    fn on_next(&self, item: T) {
        self.relay.produced(1);
        self.downstream.on_next(item);
    }

    fn on_error(&self, error: FlowError) {
        if !(self.should_retry)(&error) {
            self.downstream.on_error(error);
            return;
        }
        let budget = self.budget.load(Ordering::Relaxed);
        if budget == 0 {
            self.downstream.on_error(error);
            return;
        }
        if budget != u64::MAX {
            self.budget.store(budget - 1, Ordering::Relaxed);
        }
        self.resubscribe();
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}
