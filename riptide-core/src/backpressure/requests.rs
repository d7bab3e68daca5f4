//! Saturating request arithmetic. `u64::MAX` encodes an unbounded request
//! and is absorbing under addition.
use std::sync::atomic::{AtomicU64, Ordering};

/// The unbounded request amount.
pub(crate) const UNBOUNDED: u64 = u64::MAX;

/// `current + n`, saturating at [UNBOUNDED].
pub(crate) fn saturating_add(current: u64, n: u64) -> u64 {
    current.saturating_add(n)
}

/// `current - n` unless `current` is unbounded. Consuming more than was
/// requested is a caller bug.
pub(crate) fn produced(current: u64, n: u64) -> u64 {
    if current == UNBOUNDED {
        return UNBOUNDED;
    }
    debug_assert!(n <= current, "produced {n} of only {current} requested");
    current.saturating_sub(n)
}

/// Atomically add `n` to a shared request counter, saturating at
/// [UNBOUNDED]. Returns the amount outstanding before the addition.
pub(crate) fn add(counter: &AtomicU64, n: u64) -> u64 {
    let mut current = counter.load(Ordering::Relaxed);
    loop {
        if current == UNBOUNDED {
            return UNBOUNDED;
        }
        let next = saturating_add(current, n);
        match counter.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return current,
            Err(observed) => current = observed,
        }
    }
}

/// Take one unit of demand if any is available. True when an item may be
/// delivered.
pub(crate) fn consume_one(counter: &AtomicU64) -> bool {
    let mut current = counter.load(Ordering::Relaxed);
    loop {
        if current == UNBOUNDED {
            return true;
        }
        if current == 0 {
            return false;
        }
        match counter.compare_exchange_weak(
            current,
            current - 1,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return true,
            Err(observed) => current = observed,
        }
    }
}

/// Atomically subtract `n` consumed items from a shared request counter,
/// unless it is unbounded. Returns the amount outstanding afterwards.
pub(crate) fn consume(counter: &AtomicU64, n: u64) -> u64 {
    let mut current = counter.load(Ordering::Relaxed);
    loop {
        if current == UNBOUNDED {
            return UNBOUNDED;
        }
        let next = produced(current, n);
        match counter.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => current = observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addition_saturates() {
        assert_eq!(saturating_add(UNBOUNDED - 1, 5), UNBOUNDED);
        assert_eq!(saturating_add(UNBOUNDED, 1), UNBOUNDED);
        assert_eq!(saturating_add(3, 4), 7);
    }

    #[test]
    fn unbounded_is_idempotent() {
        let counter = AtomicU64::new(0);
        add(&counter, UNBOUNDED);
        add(&counter, UNBOUNDED);
        add(&counter, 17);
        assert_eq!(counter.load(Ordering::Relaxed), UNBOUNDED);
    }

    #[test]
    fn consume_leaves_unbounded_alone() {
        let counter = AtomicU64::new(UNBOUNDED);
        assert_eq!(consume(&counter, 1000), UNBOUNDED);
    }

    #[test]
    fn consume_subtracts() {
        let counter = AtomicU64::new(10);
        assert_eq!(consume(&counter, 4), 6);
        assert_eq!(counter.load(Ordering::Relaxed), 6);
    }
}
