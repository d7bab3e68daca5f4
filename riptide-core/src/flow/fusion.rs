//! The fused-source handshake: adjacent stages may negotiate direct
//! queue access so items skip one level of per-item dispatch at an
//! asynchronous boundary.
use std::sync::Arc;

use super::Subscription;

/// Outcome of the fusion negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FusionMode {
    /// No fusion; items arrive through `on_next`.
    None,
    /// Upstream is a cold generator the downstream polls synchronously;
    /// requests are not needed.
    Sync,
    /// Upstream pushes into its queue and signals availability; the
    /// downstream polls when signalled.
    Async,
}

/// A subscription that doubles as a queue the downstream may poll
/// directly, once a mode other than [FusionMode::None] was negotiated.
pub trait QueueSubscription<T>: Subscription {
    /// Negotiate fusion. `requested` is the set of modes the downstream
    /// can work in; the return value is binding for both sides.
    fn enable_fusion(&self, requested: FusionMode) -> FusionMode;

    /// Take the next item from the fused queue. In SYNC mode, `None`
    /// means the source is exhausted.
    fn poll(&self) -> Option<T>;

    fn is_queue_empty(&self) -> bool;

    /// Discard all queued items.
    fn clear(&self);
}

/// The handle delivered by `on_subscribe`: either a plain subscription or
/// one that additionally offers queue fusion. Subscribers that do not
/// care about fusion use it exactly like a plain subscription.
pub enum Upstream<T> {
    Plain(Arc<dyn Subscription>),
    Fused(Arc<dyn QueueSubscription<T>>),
}

impl<T> Upstream<T> {
    pub fn plain(subscription: Arc<dyn Subscription>) -> Self {
        Upstream::Plain(subscription)
    }

    pub fn fused(subscription: Arc<dyn QueueSubscription<T>>) -> Self {
        Upstream::Fused(subscription)
    }

    pub fn request(&self, n: u64) {
        match self {
            Upstream::Plain(s) => s.request(n),
            Upstream::Fused(s) => s.request(n),
        }
    }

    pub fn cancel(&self) {
        match self {
            Upstream::Plain(s) => s.cancel(),
            Upstream::Fused(s) => s.cancel(),
        }
    }

    /// Attempt the fusion handshake; a plain upstream always answers
    /// [FusionMode::None].
    pub fn try_fuse(&self, requested: FusionMode) -> FusionMode {
        match self {
            Upstream::Plain(_) => FusionMode::None,
            Upstream::Fused(s) => s.enable_fusion(requested),
        }
    }

    /// The queue view of a fused upstream.
    pub fn as_queue(&self) -> Option<&Arc<dyn QueueSubscription<T>>> {
        match self {
            Upstream::Plain(_) => None,
            Upstream::Fused(s) => Some(s),
        }
    }
}

impl<T> Clone for Upstream<T> {
    fn clone(&self) -> Self {
        match self {
            Upstream::Plain(s) => Upstream::Plain(Arc::clone(s)),
            Upstream::Fused(s) => Upstream::Fused(Arc::clone(s)),
        }
    }
}
