use std::sync::atomic::{AtomicBool, Ordering};

use crate::backpressure::SubscriptionSlot;
use crate::error::FlowError;
use crate::flow::{Subscriber, Subscription, Upstream};

/// Callback-based subscriber with unbounded demand, backing
/// `Flow::subscribe_fn` and `Flow::subscribe_each`.
pub(crate) struct LambdaSubscriber<T, N, E, C> {
    on_next: N,
    on_error: E,
    on_complete: C,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T, N, E, C> LambdaSubscriber<T, N, E, C>
where
    N: Fn(T) + Send + Sync,
    E: Fn(FlowError) + Send + Sync,
    C: Fn() + Send + Sync,
{
    pub(crate) fn new(on_next: N, on_error: E, on_complete: C) -> Self {
        LambdaSubscriber {
            on_next,
            on_error,
            on_complete,
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        }
    }
}

impl<T, N, E, C> Subscriber<T> for LambdaSubscriber<T, N, E, C>
where
    T: Send,
    N: Fn(T) + Send + Sync,
    E: Fn(FlowError) + Send + Sync,
    C: Fn() + Send + Sync,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if self.upstream.set(upstream) {
            self.upstream.request(u64::MAX);
        }
    }

    fn on_next(&self, item: T) {
        if !self.done.load(Ordering::Acquire) {
            (self.on_next)(item);
        }
    }

    fn on_error(&self, error: FlowError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            (self.on_error)(error);
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            (self.on_complete)();
        }
    }
}

impl<T, N, E, C> Subscription for LambdaSubscriber<T, N, E, C>
where
    T: Send,
    N: Fn(T) + Send + Sync,
    E: Fn(FlowError) + Send + Sync,
    C: Fn() + Send + Sync,
{
    fn request(&self, n: u64) {
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        self.upstream.cancel();
    }
}
