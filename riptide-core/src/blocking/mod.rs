//! Bridges from flows into blocking code. These are the only places in
//! the crate that block by design; never call them from inside a
//! subscriber callback, that would stall the pipeline delivering it.
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::backpressure::{SubscriptionSlot, Terminal};
use crate::error::FlowError;
use crate::flow::{Flow, Subscriber, Upstream};
use crate::hooks;
use crate::operators::{Take, TakeLast};
use crate::types::Element;

// marker sealing the blocking trait to Flow
mod sealed {
    use crate::flow::Flow;

    pub trait Sealed {}

    impl<T> Sealed for Flow<T> {}
}

/// Blocking consumption of a flow
pub trait Blocking<T>: sealed::Sealed {
    /// Iterate the flow from the calling thread, requesting `prefetch`
    /// upfront and replenishing in 75% batches. The iterator yields an
    /// `Err` once if the flow errors, then ends. Dropping the iterator
    /// cancels the subscription.
    fn blocking_iter_with(self, prefetch: usize) -> BlockingIter<T>;

    /// [Blocking::blocking_iter_with] using the process-wide buffer
    /// size.
    fn blocking_iter(self) -> BlockingIter<T>;

    /// Run the whole flow, calling `each` per item, and return when it
    /// terminates.
    fn blocking_subscribe(self, each: impl FnMut(T)) -> Result<(), FlowError>;

    /// Every item, gathered on the calling thread.
    fn blocking_collect(self) -> Result<Vec<T>, FlowError>;

    /// The first item, if any.
    fn blocking_first(self) -> Result<Option<T>, FlowError>;

    /// The last item, if any.
    fn blocking_last(self) -> Result<Option<T>, FlowError>;
}

impl<T: Element> Blocking<T> for Flow<T> {
    fn blocking_iter_with(self, prefetch: usize) -> BlockingIter<T> {
        assert!(prefetch > 0, "prefetch must be > 0");
        let shared = Arc::new(IterShared {
            state: Mutex::new(IterState {
                items: VecDeque::with_capacity(prefetch),
                terminal: None,
            }),
            available: Condvar::new(),
            upstream: SubscriptionSlot::new(),
        });
        let adapter = Arc::new(IterSubscriber {
            shared: shared.clone(),
        });
        self.subscribe(adapter);
        shared.upstream.request(prefetch as u64);
        BlockingIter {
            shared,
            prefetch: prefetch as u64,
            taken_since_refill: 0,
        }
    }

    fn blocking_iter(self) -> BlockingIter<T> {
        let prefetch = hooks::buffer_size();
        self.blocking_iter_with(prefetch)
    }

    fn blocking_subscribe(self, mut each: impl FnMut(T)) -> Result<(), FlowError> {
        for item in self.blocking_iter() {
            each(item?);
        }
        Ok(())
    }

    fn blocking_collect(self) -> Result<Vec<T>, FlowError> {
        self.blocking_iter().collect()
    }

    fn blocking_first(self) -> Result<Option<T>, FlowError> {
        self.take(1).blocking_iter_with(1).next().transpose()
    }

    fn blocking_last(self) -> Result<Option<T>, FlowError> {
        self.take_last(1).blocking_iter_with(1).next().transpose()
    }
}

struct IterState<T> {
    items: VecDeque<T>,
    terminal: Option<Terminal>,
}

struct IterShared<T> {
    state: Mutex<IterState<T>>,
    available: Condvar,
    upstream: SubscriptionSlot<T>,
}

struct IterSubscriber<T> {
    shared: Arc<IterShared<T>>,
}

impl<T: Element> Subscriber<T> for IterSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        // the iterator issues the initial prefetch itself
        self.shared.upstream.set(upstream);
    }

    fn on_next(&self, item: T) {
        let mut state = self.shared.state.lock().unwrap();
        state.items.push_back(item);
        drop(state);
        self.shared.available.notify_one();
    }

    fn on_error(&self, error: FlowError) {
        let mut state = self.shared.state.lock().unwrap();
        if state.terminal.is_none() {
            state.terminal = Some(Terminal::Errored(error));
        }
        drop(state);
        self.shared.available.notify_one();
    }

    fn on_complete(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.terminal.is_none() {
            state.terminal = Some(Terminal::Complete);
        }
        drop(state);
        self.shared.available.notify_one();
    }
}

/// Iterator over a flow's items; see [Blocking::blocking_iter].
pub struct BlockingIter<T> {
    shared: Arc<IterShared<T>>,
    prefetch: u64,
    taken_since_refill: u64,
}

impl<T: Element> Iterator for BlockingIter<T> {
    type Item = Result<T, FlowError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = {
            let mut state = self.shared.state.lock().unwrap();
            loop {
                if let Some(item) = state.items.pop_front() {
                    break item;
                }
                match state.terminal.take() {
                    Some(Terminal::Complete) => return None,
                    Some(Terminal::Errored(error)) => return Some(Err(error)),
                    None => {
                        state = self.shared.available.wait(state).unwrap();
                    }
                }
            }
        };
        self.taken_since_refill += 1;
        let limit = self.prefetch - (self.prefetch >> 2);
        if self.taken_since_refill >= limit.max(1) {
            self.shared.upstream.request(self.taken_since_refill);
            self.taken_since_refill = 0;
        }
        Some(Ok(item))
    }
}

impl<T> Drop for BlockingIter<T> {
    fn drop(&mut self) {
        self.shared.upstream.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::operators::{Map, SubscribeOn};
    use crate::scheduler::{Scheduler, SingleScheduler};

    #[test]
    fn iterates_a_synchronous_flow() {
        let all: Result<Vec<i64>, FlowError> = Flow::range(0, 100).blocking_iter().collect();
        assert_eq!(all.unwrap(), (0..100).collect::<Vec<i64>>());
    }

    #[test]
    fn iterates_across_threads() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(SingleScheduler::new());
        let all = Flow::range(0, 500)
            .subscribe_on(scheduler, true)
            .blocking_collect()
            .unwrap();
        assert_eq!(all.len(), 500);
    }

    #[test]
    fn surfaces_the_error_last() {
        let outcome: Vec<Result<i64, FlowError>> = Flow::concat([
            Flow::range(0, 2),
            Flow::error(FlowError::callback("broken pipe")),
        ])
        .blocking_iter()
        .collect();
        assert_eq!(outcome.len(), 3);
        assert!(outcome[2].is_err());
    }

    #[test]
    fn first_and_last_work() {
        assert_eq!(Flow::range(5, 10).blocking_first().unwrap(), Some(5));
        assert_eq!(Flow::range(5, 10).blocking_last().unwrap(), Some(14));
        assert_eq!(Flow::<i64>::empty().blocking_first().unwrap(), None);
    }

    #[test]
    fn blocking_subscribe_sees_every_item() {
        let mut sum = 0i64;
        Flow::range(1, 4)
            .map(|x| x * 2)
            .blocking_subscribe(|x| sum += x)
            .unwrap();
        assert_eq!(sum, 20);
    }

    #[test]
    fn dropping_the_iterator_cancels() {
        let publisher = crate::testing::TestPublisher::<i32>::new();
        let iter = publisher.flow().blocking_iter_with(4);
        drop(iter);
        assert!(publisher.is_cancelled());
        // keep this thread clean even if the cancel raced an emission
        thread::yield_now();
    }
}
