//! The flow-control protocol: publishers hand subscribers a subscription,
//! subscribers pull items by requesting them, and every chain ends in at
//! most one terminal signal.
mod fusion;
mod lambda;

pub use fusion::{FusionMode, QueueSubscription, Upstream};
pub(crate) use lambda::LambdaSubscriber;

use std::sync::Arc;

use crate::error::FlowError;
use crate::types::Element;

/// The handle a subscriber holds towards its upstream.
///
/// `request(n)` declares that up to `n` additional items are acceptable;
/// `u64::MAX` means "any number" and saturates under further requests.
/// `cancel` irrevocably detaches and propagates upstream.
pub trait Subscription: Send + Sync {
    fn request(&self, n: u64);
    fn cancel(&self);
}

/// Consumer of a flow. Receives exactly one `on_subscribe`, then zero or
/// more `on_next`, then at most one of `on_complete` / `on_error`.
///
/// Signals to one subscriber are sequential: a signal returns before the
/// next begins. Blocking inside any of these callbacks stalls the whole
/// pipeline that delivers them.
pub trait Subscriber<T>: Send + Sync {
    fn on_subscribe(&self, upstream: Upstream<T>);
    fn on_next(&self, item: T);
    fn on_error(&self, error: FlowError);
    fn on_complete(&self);
}

/// A factory that, on attach, produces a stream for exactly one
/// subscriber. Construction is cheap; all behavior happens at attach.
pub trait Publisher<T>: Send + Sync {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);

    /// A constant single-value source may expose its value here so that
    /// coordinators can route it through their scalar fast path.
    fn scalar_value(&self) -> Option<T> {
        None
    }
}

/// A composable stream description. `Flow`s are value-like: cloning is
/// cheap and every subscription re-runs the chain from its sources.
///
/// Operators are brought into scope through the extension traits in
/// [crate::operators]; sources live in [crate::sources].
pub struct Flow<T> {
    source: Arc<dyn Publisher<T>>,
}

impl<T> Clone for Flow<T> {
    fn clone(&self) -> Self {
        Flow {
            source: Arc::clone(&self.source),
        }
    }
}

impl<T: Element> Flow<T> {
    /// Wrap a publisher into a composable flow.
    pub fn new(publisher: impl Publisher<T> + 'static) -> Self {
        Flow {
            source: Arc::new(publisher),
        }
    }

    /// Attach a subscriber. The subscriber receives `on_subscribe` and
    /// from then on drives delivery through its subscription.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.source.subscribe(subscriber);
    }

    /// Attach a plain callback with unbounded demand. Errors that reach
    /// the callback subscriber are routed to the process-wide error hook.
    /// The returned subscription only serves to cancel.
    pub fn subscribe_fn(
        &self,
        on_next: impl Fn(T) + Send + Sync + 'static,
    ) -> Arc<dyn Subscription> {
        self.subscribe_each(on_next, |error| crate::hooks::late_error(&error), || {})
    }

    /// Attach callbacks for every signal kind, with unbounded demand.
    pub fn subscribe_each(
        &self,
        on_next: impl Fn(T) + Send + Sync + 'static,
        on_error: impl Fn(FlowError) + Send + Sync + 'static,
        on_complete: impl Fn() + Send + Sync + 'static,
    ) -> Arc<dyn Subscription> {
        let subscriber = Arc::new(LambdaSubscriber::new(on_next, on_error, on_complete));
        self.subscribe(subscriber.clone());
        subscriber
    }

    pub(crate) fn scalar_value(&self) -> Option<T> {
        self.source.scalar_value()
    }
}

/// Subscription of sources that terminate at attach time (empty, error):
/// there will never be items, so demand and cancellation are no-ops.
pub(crate) struct NoopSubscription;

impl Subscription for NoopSubscription {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {}
}
