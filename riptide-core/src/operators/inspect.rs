use std::sync::Arc;

use crate::flow::Flow;
use crate::operators::Map;
use crate::types::Element;

/// Peek at items without consuming them
pub trait Inspect<T>: super::sealed::Sealed {
    /// Call `probe` for every item passing through, leaving the flow
    /// otherwise untouched. Useful for debugging mid-chain.
    fn inspect(self, probe: impl Fn(&T) + Send + Sync + 'static) -> Flow<T>;
}

impl<T: Element> Inspect<T> for Flow<T> {
    fn inspect(self, probe: impl Fn(&T) + Send + Sync + 'static) -> Flow<T> {
        let probe = Arc::new(probe);
        self.map(move |item| {
            probe(&item);
            item
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};

    use super::*;
    use crate::testing::TestSubscriber;

    #[test]
    fn sees_every_item_without_changing_them() {
        let sum = Arc::new(AtomicI64::new(0));
        let seen = Arc::clone(&sum);
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(1, 4)
            .inspect(move |x| {
                seen.fetch_add(*x, Ordering::SeqCst);
            })
            .subscribe(ts.clone());
        ts.assert_values(&[1, 2, 3, 4]);
        assert_eq!(sum.load(Ordering::SeqCst), 10);
    }
}
