//! The once-only upstream slot: holds the subscription a subscriber was
//! handed, accumulates requests made before it arrived, and turns into a
//! terminal sentinel on cancellation.
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::OnceLock;

use crate::backpressure::requests;
use crate::flow::Upstream;

const EMPTY: u8 = 0;
const READY: u8 = 1;
const CANCELLED: u8 = 2;

/// Atomic holder of at most one [Upstream] handle.
///
/// First `set` wins and forwards any deferred requests; later sets cancel
/// their argument (the double-subscribe rule). `cancel` is idempotent and
/// cancels whichever upstream is or later becomes present.
pub(crate) struct SubscriptionSlot<T> {
    state: AtomicU8,
    upstream: OnceLock<Upstream<T>>,
    deferred: AtomicU64,
}

impl<T> SubscriptionSlot<T> {
    pub(crate) fn new() -> Self {
        SubscriptionSlot {
            state: AtomicU8::new(EMPTY),
            upstream: OnceLock::new(),
            deferred: AtomicU64::new(0),
        }
    }

    /// Install the upstream handle. Returns false (and cancels the
    /// argument) if the slot was already set or cancelled.
    pub(crate) fn set(&self, upstream: Upstream<T>) -> bool {
        if self.upstream.set(upstream.clone()).is_err() {
            upstream.cancel();
            return false;
        }
        match self
            .state
            .compare_exchange(EMPTY, READY, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let deferred = self.deferred.swap(0, Ordering::AcqRel);
                if deferred > 0 {
                    upstream.request(deferred);
                }
                true
            }
            Err(_) => {
                // cancelled while we were installing
                upstream.cancel();
                false
            }
        }
    }

    /// Forward `n` to the upstream, or defer it until one arrives.
    pub(crate) fn request(&self, n: u64) {
        match self.state.load(Ordering::Acquire) {
            READY => {
                if let Some(upstream) = self.upstream.get() {
                    upstream.request(n);
                }
            }
            EMPTY => {
                requests::add(&self.deferred, n);
                // the upstream may have arrived while we were deferring;
                // whoever observes READY drains the accumulator
                if self.state.load(Ordering::Acquire) == READY {
                    let deferred = self.deferred.swap(0, Ordering::AcqRel);
                    if deferred > 0 {
                        if let Some(upstream) = self.upstream.get() {
                            upstream.request(deferred);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Cancel the slot and any present or future upstream. Idempotent.
    pub(crate) fn cancel(&self) {
        let previous = self.state.swap(CANCELLED, Ordering::AcqRel);
        if previous != CANCELLED {
            if let Some(upstream) = self.upstream.get() {
                upstream.cancel();
            }
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::probe_subscription;

    #[test]
    fn forwards_requests_once_set() {
        let slot: SubscriptionSlot<i32> = SubscriptionSlot::new();
        let (upstream, probe) = probe_subscription();
        assert!(slot.set(upstream));
        slot.request(7);
        assert_eq!(probe.requested(), 7);
        assert!(!probe.cancelled());
    }

    #[test]
    fn defers_requests_made_before_set() {
        let slot: SubscriptionSlot<i32> = SubscriptionSlot::new();
        slot.request(3);
        slot.request(4);
        let (upstream, probe) = probe_subscription();
        assert!(slot.set(upstream));
        assert_eq!(probe.requested(), 7);
    }

    #[test]
    fn second_set_is_rejected_and_cancelled() {
        let slot: SubscriptionSlot<i32> = SubscriptionSlot::new();
        let (first, first_probe) = probe_subscription();
        let (second, second_probe) = probe_subscription();
        assert!(slot.set(first));
        assert!(!slot.set(second));
        assert!(!first_probe.cancelled());
        assert!(second_probe.cancelled());
    }

    #[test]
    fn cancel_reaches_late_upstream() {
        let slot: SubscriptionSlot<i32> = SubscriptionSlot::new();
        slot.cancel();
        let (upstream, probe) = probe_subscription();
        assert!(!slot.set(upstream));
        assert!(probe.cancelled());
        assert!(slot.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let slot: SubscriptionSlot<i32> = SubscriptionSlot::new();
        let (upstream, probe) = probe_subscription();
        slot.set(upstream);
        slot.cancel();
        slot.cancel();
        assert!(probe.cancelled());
    }
}
