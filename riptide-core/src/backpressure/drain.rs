//! The queue-drain gate: a work-in-progress counter combined with the
//! request counter and cancelled flag every asynchronous-boundary
//! operator shares. Whoever moves the counter from zero owns the drain;
//! everyone else merely marks the missed work and returns.
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::backpressure::requests;

pub(crate) struct DrainControl {
    wip: AtomicUsize,
    requested: AtomicU64,
    cancelled: AtomicBool,
}

impl DrainControl {
    pub(crate) fn new() -> Self {
        DrainControl {
            wip: AtomicUsize::new(0),
            requested: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Add downstream demand. Returns the demand outstanding beforehand,
    /// so a caller observing zero knows a stalled drain must be kicked.
    pub(crate) fn request(&self, n: u64) -> u64 {
        requests::add(&self.requested, n)
    }

    pub(crate) fn requested(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    /// Subtract items handed downstream, unless demand is unbounded.
    pub(crate) fn produced(&self, n: u64) {
        if n > 0 {
            requests::consume(&self.requested, n);
        }
    }

    /// Try to become the drain. True on the 0→1 transition.
    pub(crate) fn enter(&self) -> bool {
        self.wip.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Leave the drain after settling `observed` entries. Returns the
    /// number of missed entries that force another pass, or 0 when the
    /// drain is quiescent.
    pub(crate) fn leave(&self, observed: usize) -> usize {
        self.wip.fetch_sub(observed, Ordering::AcqRel) - observed
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_first_entry_wins_the_drain() {
        let ctl = DrainControl::new();
        assert!(ctl.enter());
        assert!(!ctl.enter());
        assert!(!ctl.enter());
        // the winner settles all three entries in one pass
        assert_eq!(ctl.leave(1), 2);
        assert_eq!(ctl.leave(2), 0);
        // quiescent again: next entry wins
        assert!(ctl.enter());
    }

    #[test]
    fn request_reports_prior_demand() {
        let ctl = DrainControl::new();
        assert_eq!(ctl.request(5), 0);
        assert_eq!(ctl.request(3), 5);
        ctl.produced(6);
        assert_eq!(ctl.requested(), 2);
    }

    #[test]
    fn unbounded_demand_ignores_production() {
        let ctl = DrainControl::new();
        ctl.request(u64::MAX);
        ctl.produced(10_000);
        assert_eq!(ctl.requested(), u64::MAX);
    }
}
