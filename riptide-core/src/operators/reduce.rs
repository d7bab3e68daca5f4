use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::backpressure::{ScalarSubscription, SubscriptionSlot};
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

/// Collapse a whole flow into one item
pub trait Reduce<T>: super::sealed::Sealed {
    /// Combine all items pairwise; empty upstream completes empty.
    ///
    /// # Example
    /// ```rust
    /// use riptide::flow::Flow;
    /// use riptide::operators::*;
    /// use riptide::testing::TestSubscriber;
    ///
    /// let ts = TestSubscriber::new(u64::MAX);
    /// Flow::range(1, 10)
    ///     .filter(|x| x % 2 == 0)
    ///     .reduce(|a, b| a + b)
    ///     .subscribe(ts.clone());
    /// ts.assert_values(&[30]);
    /// ```
    fn reduce(self, combine: impl Fn(T, T) -> T + Send + Sync + 'static) -> Flow<T>;

    /// Fold all items into an accumulator and emit it at completion.
    fn fold<A: Element>(
        self,
        seed: A,
        accumulate: impl Fn(A, T) -> A + Send + Sync + 'static,
    ) -> Flow<A>
    where
        A: Clone + Sync;

    /// The number of items in the flow.
    fn count(self) -> Flow<u64>;

    /// Every item, gathered into one `Vec`.
    fn to_vec(self) -> Flow<Vec<T>>;
}

impl<T: Element> Reduce<T> for Flow<T> {
    fn reduce(self, combine: impl Fn(T, T) -> T + Send + Sync + 'static) -> Flow<T> {
        Flow::new(FoldPublisher {
            upstream: self,
            seed: EmptySeed,
            accumulate: Arc::new(move |acc: Option<T>, item| match acc {
                None => Some(item),
                Some(prior) => Some(combine(prior, item)),
            }),
            finish: Arc::new(|acc: Option<T>| acc),
        })
    }

    fn fold<A: Element>(
        self,
        seed: A,
        accumulate: impl Fn(A, T) -> A + Send + Sync + 'static,
    ) -> Flow<A>
    where
        A: Clone + Sync,
    {
        Flow::new(FoldPublisher {
            upstream: self,
            seed: CloneSeed(seed),
            accumulate: Arc::new(move |acc: A, item| accumulate(acc, item)),
            finish: Arc::new(|acc: A| Some(acc)),
        })
    }

    fn count(self) -> Flow<u64> {
        self.fold(0u64, |count, _| count + 1)
    }

    fn to_vec(self) -> Flow<Vec<T>> {
        Flow::new(FoldPublisher {
            upstream: self,
            seed: VecSeed,
            accumulate: Arc::new(|mut all: Vec<T>, item| {
                all.push(item);
                all
            }),
            finish: Arc::new(|all: Vec<T>| Some(all)),
        })
    }
}

/// Produces the per-subscription starting accumulator.
trait Seed<A>: Send + Sync {
    fn seed(&self) -> A;
}

struct EmptySeed;

impl<T> Seed<Option<T>> for EmptySeed {
    fn seed(&self) -> Option<T> {
        None
    }
}

struct CloneSeed<A>(A);

impl<A: Clone + Send + Sync> Seed<A> for CloneSeed<A> {
    fn seed(&self) -> A {
        self.0.clone()
    }
}

struct VecSeed;

impl<T: Send> Seed<Vec<T>> for VecSeed {
    fn seed(&self) -> Vec<T> {
        Vec::new()
    }
}

struct FoldPublisher<T, A, R, S> {
    upstream: Flow<T>,
    seed: S,
    accumulate: Arc<dyn Fn(A, T) -> A + Send + Sync>,
    finish: Arc<dyn Fn(A) -> Option<R> + Send + Sync>,
}

impl<T, A, R, S> Publisher<R> for FoldPublisher<T, A, R, S>
where
    T: Element,
    A: Send + 'static,
    R: Element,
    S: Seed<A>,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<R>>) {
        let scalar = Arc::new(ScalarSubscription::new(subscriber.clone()));
        let adapter = Arc::new(FoldSubscriber {
            downstream: subscriber.clone(),
            scalar: scalar.clone(),
            state: Mutex::new(Some(self.seed.seed())),
            accumulate: Arc::clone(&self.accumulate),
            finish: Arc::clone(&self.finish),
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Upstream::plain(Arc::new(FoldSubscription {
            scalar,
            adapter: adapter.clone(),
        })));
        self.upstream.subscribe(adapter);
    }
}

struct FoldSubscriber<T, A, R> {
    downstream: Arc<dyn Subscriber<R>>,
    scalar: Arc<ScalarSubscription<R>>,
    state: Mutex<Option<A>>,
    accumulate: Arc<dyn Fn(A, T) -> A + Send + Sync>,
    finish: Arc<dyn Fn(A) -> Option<R> + Send + Sync>,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T, A, R> Subscriber<T> for FoldSubscriber<T, A, R>
where
    T: Element,
    A: Send + 'static,
    R: Element,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if self.upstream.set(upstream) {
            self.upstream.request(u64::MAX);
        }
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(acc) = state.take() {
            *state = Some((self.accumulate)(acc, item));
        }
    }

    fn on_error(&self, error: FlowError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.state.lock().unwrap().take();
            self.downstream.on_error(error);
        }
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let acc = self.state.lock().unwrap().take();
        match acc.and_then(|acc| (self.finish)(acc)) {
            Some(result) => self.scalar.complete(result),
            None => self.downstream.on_complete(),
        }
    }
}

struct FoldSubscription<T, A, R> {
    scalar: Arc<ScalarSubscription<R>>,
    adapter: Arc<FoldSubscriber<T, A, R>>,
}

impl<T, A, R> Subscription for FoldSubscription<T, A, R>
where
    T: Element,
    A: Send + 'static,
    R: Element,
{
    fn request(&self, n: u64) {
        self.scalar.request(n);
    }

    fn cancel(&self) {
        self.scalar.cancel();
        self.adapter.done.store(true, Ordering::Release);
        self.adapter.upstream.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::Filter;
    use crate::testing::TestSubscriber;

    #[test]
    fn reduce_combines_everything() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(1, 10)
            .filter(|x| x % 2 == 0)
            .reduce(|a, b| a + b)
            .subscribe(ts.clone());
        ts.assert_values(&[30]);
        ts.assert_complete();
    }

    #[test]
    fn reduce_of_empty_is_empty() {
        let ts: Arc<TestSubscriber<i64>> = TestSubscriber::new(u64::MAX);
        Flow::range(0, 0).reduce(|a, b| a + b).subscribe(ts.clone());
        ts.assert_values(&[]);
        ts.assert_complete();
    }

    #[test]
    fn the_result_waits_for_demand() {
        let ts = TestSubscriber::new(0);
        Flow::range(1, 4).reduce(|a, b| a + b).subscribe(ts.clone());
        ts.assert_values(&[]);
        ts.assert_no_terminal();
        ts.request(1);
        ts.assert_values(&[10]);
        ts.assert_complete();
    }

    #[test]
    fn fold_starts_from_the_seed() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(1, 3).fold(100, |acc, x| acc + x).subscribe(ts.clone());
        ts.assert_values(&[106]);
        ts.assert_complete();
    }

    #[test]
    fn count_counts() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 17).count().subscribe(ts.clone());
        ts.assert_values(&[17]);
    }

    #[test]
    fn to_vec_gathers_in_order() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(1, 4).to_vec().subscribe(ts.clone());
        ts.assert_values(&[vec![1, 2, 3, 4]]);
        ts.assert_complete();
    }
}
