use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::backpressure::requests;
use crate::flow::{Subscription, Upstream};

/// Records the request and cancel traffic an operator sends upstream.
pub struct SubscriptionProbe {
    requested: AtomicU64,
    cancelled: AtomicBool,
}

impl SubscriptionProbe {
    /// Total amount requested so far (saturating at `u64::MAX`).
    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Subscription for SubscriptionProbe {
    fn request(&self, n: u64) {
        requests::add(&self.requested, n);
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// A plain upstream handle plus the probe observing it.
pub fn probe_subscription<T>() -> (Upstream<T>, Arc<SubscriptionProbe>) {
    let probe = Arc::new(SubscriptionProbe {
        requested: AtomicU64::new(0),
        cancelled: AtomicBool::new(false),
    });
    (Upstream::plain(probe.clone()), probe)
}
