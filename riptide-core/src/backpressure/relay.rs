//! A subscription whose upstream can be replaced mid-stream (retry,
//! concatenation, resume-next). Outstanding request accounting survives
//! each replacement: the new upstream is asked for exactly what the
//! downstream is still owed.
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::backpressure::requests;
use crate::flow::{Subscription, Upstream};

pub(crate) struct RelaySubscription<T> {
    wip: AtomicUsize,
    cancelled: AtomicBool,
    /// Outstanding demand. Only the drain winner reads or writes this.
    outstanding: AtomicU64,
    missed_requested: AtomicU64,
    missed_produced: AtomicU64,
    /// Replacement handed over by `set_upstream`, waiting for the drain.
    staged: Mutex<Option<Upstream<T>>>,
    /// The live upstream. Only the drain winner touches this.
    current: Mutex<Option<Upstream<T>>>,
}

impl<T> RelaySubscription<T> {
    pub(crate) fn new() -> Self {
        RelaySubscription {
            wip: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            outstanding: AtomicU64::new(0),
            missed_requested: AtomicU64::new(0),
            missed_produced: AtomicU64::new(0),
            staged: Mutex::new(None),
            current: Mutex::new(None),
        }
    }

    /// Replace the live upstream. The replacement inherits the remaining
    /// outstanding demand.
    pub(crate) fn set_upstream(&self, upstream: Upstream<T>) {
        if self.cancelled.load(Ordering::Acquire) {
            upstream.cancel();
            return;
        }
        let previous = self
            .staged
            .lock()
            .unwrap()
            .replace(upstream);
        if let Some(stale) = previous {
            stale.cancel();
        }
        self.drain();
    }

    /// Record `n` items delivered downstream through the current upstream.
    pub(crate) fn produced(&self, n: u64) {
        requests::add(&self.missed_produced, n);
        self.drain();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Cancel the live upstream without retiring the relay itself; a
    /// replacement set afterwards keeps working. Used when one upstream
    /// is forcibly abandoned (timeout switching to its fallback).
    pub(crate) fn cancel_current(&self) {
        if let Some(up) = self.current.lock().unwrap().take() {
            up.cancel();
        }
    }

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                if let Some(up) = self.current.lock().unwrap().take() {
                    up.cancel();
                }
                if let Some(up) = self.staged.lock().unwrap().take() {
                    up.cancel();
                }
            } else {
                let staged = self.staged.lock().unwrap().take();
                let requested = self.missed_requested.swap(0, Ordering::AcqRel);
                let delivered = self.missed_produced.swap(0, Ordering::AcqRel);

                let mut outstanding = self.outstanding.load(Ordering::Relaxed);
                if outstanding != requests::UNBOUNDED {
                    outstanding = requests::saturating_add(outstanding, requested);
                    if outstanding != requests::UNBOUNDED {
                        outstanding = requests::produced(outstanding, delivered);
                    }
                    self.outstanding.store(outstanding, Ordering::Relaxed);
                }

                if let Some(up) = staged {
                    let mut current = self.current.lock().unwrap();
                    if let Some(stale) = current.replace(up.clone()) {
                        stale.cancel();
                    }
                    drop(current);
                    if outstanding > 0 {
                        up.request(outstanding);
                    }
                } else if requested > 0 {
                    if let Some(up) = self
                        .current
                        .lock()
                        .unwrap()
                        .as_ref()
                        .cloned()
                    {
                        up.request(requested);
                    }
                }
            }
            let remaining = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if remaining == 0 {
                return;
            }
            missed = remaining;
        }
    }
}

impl<T> Subscription for RelaySubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        requests::add(&self.missed_requested, n);
        self.drain();
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.drain();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::probe_subscription;

    #[test]
    fn replacement_inherits_outstanding_demand() {
        let relay: Arc<RelaySubscription<i32>> = Arc::new(RelaySubscription::new());
        relay.request(10);

        let (first, first_probe) = probe_subscription();
        relay.set_upstream(first);
        assert_eq!(first_probe.requested(), 10);

        // the first upstream delivered 4 of the 10
        relay.produced(4);
        let (second, second_probe) = probe_subscription();
        relay.set_upstream(second);
        assert_eq!(second_probe.requested(), 6);
    }

    #[test]
    fn unbounded_demand_stays_unbounded_across_replacements() {
        let relay: Arc<RelaySubscription<i32>> = Arc::new(RelaySubscription::new());
        relay.request(u64::MAX);
        relay.produced(1_000);

        let (up, probe) = probe_subscription();
        relay.set_upstream(up);
        assert_eq!(probe.requested(), u64::MAX);
    }

    #[test]
    fn cancel_reaches_current_and_staged() {
        let relay: Arc<RelaySubscription<i32>> = Arc::new(RelaySubscription::new());
        let (up, probe) = probe_subscription();
        relay.set_upstream(up);
        relay.cancel();
        assert!(probe.cancelled());

        let (late, late_probe) = probe_subscription();
        relay.set_upstream(late);
        assert!(late_probe.cancelled());
    }

    #[test]
    fn later_requests_reach_current_upstream() {
        let relay: Arc<RelaySubscription<i32>> = Arc::new(RelaySubscription::new());
        let (up, probe) = probe_subscription();
        relay.set_upstream(up);
        relay.request(3);
        relay.request(2);
        assert_eq!(probe.requested(), 5);
    }
}
