//! Builds a fresh flow for every subscriber at attach time.
use std::sync::Arc;

use crate::flow::{Flow, Publisher, Subscriber};
use crate::types::Element;

impl<T: Element> Flow<T> {
    /// Call `factory` once per subscriber and attach it to the produced
    /// flow, so side effects and state are per-subscription.
    pub fn defer(factory: impl Fn() -> Flow<T> + Send + Sync + 'static) -> Flow<T> {
        Flow::new(DeferPublisher { factory })
    }
}

struct DeferPublisher<F> {
    factory: F,
}

impl<T, F> Publisher<T> for DeferPublisher<F>
where
    T: Element,
    F: Fn() -> Flow<T> + Send + Sync,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        (self.factory)().subscribe(subscriber);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};

    use super::*;
    use crate::testing::TestSubscriber;

    #[test]
    fn each_subscriber_sees_a_fresh_flow() {
        let calls = Arc::new(AtomicI64::new(0));
        let counter = Arc::clone(&calls);
        let flow = Flow::defer(move || {
            let start = counter.fetch_add(1, Ordering::SeqCst);
            Flow::range(start, 2)
        });

        let first = TestSubscriber::new(u64::MAX);
        flow.subscribe(first.clone());
        first.assert_values(&[0, 1]);

        let second = TestSubscriber::new(u64::MAX);
        flow.subscribe(second.clone());
        second.assert_values(&[1, 2]);
    }
}
