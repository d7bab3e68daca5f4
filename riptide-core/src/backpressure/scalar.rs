//! Deferred single-value subscription: operators that produce exactly one
//! item at completion time (reduce, fold, count, the future adapter) may
//! only emit it once downstream demand exists.
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::flow::{Subscriber, Subscription};

const NO_REQUEST_NO_VALUE: u8 = 0;
const NO_REQUEST_HAS_VALUE: u8 = 1;
const HAS_REQUEST_NO_VALUE: u8 = 2;
const HAS_REQUEST_HAS_VALUE: u8 = 3;
const CANCELLED: u8 = 4;

pub(crate) struct ScalarSubscription<T> {
    state: AtomicU8,
    value: Mutex<Option<T>>,
    downstream: Arc<dyn Subscriber<T>>,
}

impl<T: Send> ScalarSubscription<T> {
    pub(crate) fn new(downstream: Arc<dyn Subscriber<T>>) -> Self {
        ScalarSubscription {
            state: AtomicU8::new(NO_REQUEST_NO_VALUE),
            value: Mutex::new(None),
            downstream,
        }
    }

    /// Deliver the single value, now or when demand arrives.
    pub(crate) fn complete(&self, value: T) {
        *self.value.lock().unwrap() = Some(value);
        loop {
            match self.state.load(Ordering::Acquire) {
                NO_REQUEST_NO_VALUE => {
                    if self.transition(NO_REQUEST_NO_VALUE, NO_REQUEST_HAS_VALUE) {
                        return;
                    }
                }
                HAS_REQUEST_NO_VALUE => {
                    if self.transition(HAS_REQUEST_NO_VALUE, HAS_REQUEST_HAS_VALUE) {
                        self.emit();
                        return;
                    }
                }
                _ => {
                    self.value.lock().unwrap().take();
                    return;
                }
            }
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn emit(&self) {
        if let Some(value) = self.value.lock().unwrap().take() {
            self.downstream.on_next(value);
            if self.state.load(Ordering::Acquire) != CANCELLED {
                self.downstream.on_complete();
            }
        }
    }
}

impl<T: Send> Subscription for ScalarSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        loop {
            match self.state.load(Ordering::Acquire) {
                NO_REQUEST_HAS_VALUE => {
                    if self.transition(NO_REQUEST_HAS_VALUE, HAS_REQUEST_HAS_VALUE) {
                        self.emit();
                        return;
                    }
                }
                NO_REQUEST_NO_VALUE => {
                    if self.transition(NO_REQUEST_NO_VALUE, HAS_REQUEST_NO_VALUE) {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn cancel(&self) {
        self.state.store(CANCELLED, Ordering::Release);
        self.value.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSubscriber;

    #[test]
    fn value_waits_for_demand() {
        let ts: Arc<TestSubscriber<i32>> = TestSubscriber::new(0);
        let downstream: Arc<dyn Subscriber<i32>> = ts.clone();
        let scalar = ScalarSubscription::new(downstream);
        scalar.complete(42);
        ts.assert_values(&[]);
        scalar.request(1);
        ts.assert_values(&[42]);
        ts.assert_complete();
    }

    #[test]
    fn demand_waits_for_value() {
        let ts: Arc<TestSubscriber<i32>> = TestSubscriber::new(0);
        let downstream: Arc<dyn Subscriber<i32>> = ts.clone();
        let scalar = ScalarSubscription::new(downstream);
        scalar.request(1);
        ts.assert_values(&[]);
        scalar.complete(7);
        ts.assert_values(&[7]);
        ts.assert_complete();
    }

    #[test]
    fn cancelled_scalar_drops_the_value() {
        let ts: Arc<TestSubscriber<i32>> = TestSubscriber::new(0);
        let downstream: Arc<dyn Subscriber<i32>> = ts.clone();
        let scalar = ScalarSubscription::new(downstream);
        scalar.cancel();
        scalar.complete(9);
        scalar.request(1);
        ts.assert_values(&[]);
        ts.assert_no_terminal();
    }
}
