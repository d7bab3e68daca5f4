use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::backpressure::{DrainControl, SubscriptionSlot};
use crate::channels::RingQueue;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::hooks;
use crate::types::Element;

/// Combine flows item-by-item
pub trait Zip<T>: super::sealed::Sealed {
    /// Pair this flow with `other` positionally: the n-th output
    /// combines the n-th item of each side. Completes as soon as either
    /// side completes with its queue empty — the shortest source wins.
    ///
    /// # Example
    /// ```rust
    /// use riptide::flow::Flow;
    /// use riptide::operators::*;
    /// use riptide::testing::TestSubscriber;
    ///
    /// let ts = TestSubscriber::new(u64::MAX);
    /// Flow::range(1, 5)
    ///     .zip_with(Flow::range(10, 3), |a, b| a + b)
    ///     .subscribe(ts.clone());
    /// ts.assert_values(&[11, 13, 15]);
    /// ```
    fn zip_with<U: Element, R: Element>(
        self,
        other: Flow<U>,
        combine: impl Fn(T, U) -> R + Send + Sync + 'static,
    ) -> Flow<R>;
}

impl<T: Element> Zip<T> for Flow<T> {
    fn zip_with<U: Element, R: Element>(
        self,
        other: Flow<U>,
        combine: impl Fn(T, U) -> R + Send + Sync + 'static,
    ) -> Flow<R> {
        let left = crate::operators::Map::map(self, Pair::Left);
        let right = crate::operators::Map::map(other, Pair::Right);
        Flow::zip(vec![left, right], move |mut items: Vec<Pair<T, U>>| {
            let second = items.pop();
            let first = items.pop();
            match (first, second) {
                (Some(Pair::Left(a)), Some(Pair::Right(b))) => combine(a, b),
                _ => unreachable!("zip delivers one item per source, positionally"),
            }
        })
    }
}

enum Pair<A, B> {
    Left(A),
    Right(B),
}

impl<T: Element> Flow<T> {
    /// Combine `sources` positionally: the n-th output is built from the
    /// n-th item of every source. Each source is prefetched with the
    /// process-wide buffer size and replenished as its items are
    /// consumed; the shortest source decides completion.
    pub fn zip<R: Element>(
        sources: Vec<Flow<T>>,
        combine: impl Fn(Vec<T>) -> R + Send + Sync + 'static,
    ) -> Flow<R> {
        Flow::new(ZipPublisher {
            sources,
            combine: Arc::new(combine),
        })
    }
}

struct ZipPublisher<T, F> {
    sources: Vec<Flow<T>>,
    combine: Arc<F>,
}

impl<T, R, F> Publisher<R> for ZipPublisher<T, F>
where
    T: Element,
    R: Element,
    F: Fn(Vec<T>) -> R + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<R>>) {
        if self.sources.is_empty() {
            subscriber.on_subscribe(Upstream::plain(Arc::new(crate::flow::NoopSubscription)));
            subscriber.on_complete();
            return;
        }
        let prefetch = hooks::buffer_size();
        let coordinator = Arc::new_cyclic(|this: &Weak<ZipCoordinator<T, R, F>>| {
            let inners = (0..self.sources.len())
                .map(|_| {
                    Arc::new(ZipInner {
                        parent: this.clone(),
                        queue: RingQueue::new(prefetch),
                        done: AtomicBool::new(false),
                        upstream: SubscriptionSlot::new(),
                        consumed: AtomicU64::new(0),
                        prefetch: prefetch as u64,
                    })
                })
                .collect();
            ZipCoordinator {
                downstream: subscriber.clone(),
                combine: Arc::clone(&self.combine),
                inners,
                ctl: DrainControl::new(),
                error: Mutex::new(None),
                has_error: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
            }
        });
        subscriber.on_subscribe(Upstream::plain(coordinator.clone()));
        for (source, inner) in self.sources.iter().zip(coordinator.inners.iter()) {
            if coordinator.terminated.load(Ordering::Acquire) {
                break;
            }
            source.subscribe(inner.clone());
        }
    }
}

struct ZipCoordinator<T, R, F> {
    downstream: Arc<dyn Subscriber<R>>,
    combine: Arc<F>,
    inners: Vec<Arc<ZipInner<T, R, F>>>,
    ctl: DrainControl,
    error: Mutex<Option<FlowError>>,
    has_error: AtomicBool,
    terminated: AtomicBool,
}

impl<T, R, F> ZipCoordinator<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(Vec<T>) -> R + Send + Sync + 'static,
{
    fn drain(&self) {
        if !self.ctl.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if self.ctl.is_cancelled() {
                self.drop_queues();
                return;
            }
            if self.has_error.load(Ordering::Acquire) {
                self.abort();
                return;
            }
            let requested = self.ctl.requested();
            let mut emitted = 0u64;
            loop {
                // a completed source with nothing queued ends the flow
                let mut starved = false;
                let mut all_ready = true;
                for inner in &self.inners {
                    let done = inner.done.load(Ordering::Acquire);
                    let empty = inner.queue.is_empty();
                    if empty {
                        all_ready = false;
                        if done {
                            starved = true;
                        }
                    }
                }
                if starved {
                    self.finish();
                    return;
                }
                if !all_ready || emitted >= requested {
                    break;
                }
                let mut row = Vec::with_capacity(self.inners.len());
                for inner in &self.inners {
                    match inner.queue.poll() {
                        Some(item) => row.push(item),
                        None => unreachable!("all queues were observed non-empty"),
                    }
                }
                self.downstream.on_next((self.combine)(row));
                emitted += 1;
                for inner in &self.inners {
                    inner.replenish();
                }
                if self.ctl.is_cancelled() {
                    self.drop_queues();
                    return;
                }
                if self.has_error.load(Ordering::Acquire) {
                    self.abort();
                    return;
                }
            }
            self.ctl.produced(emitted);
            missed = self.ctl.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn drop_queues(&self) {
        for inner in &self.inners {
            inner.queue.clear();
        }
    }

    fn cancel_inners(&self) {
        for inner in &self.inners {
            inner.upstream.cancel();
        }
    }

    fn finish(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.cancel_inners();
            self.drop_queues();
            self.downstream.on_complete();
        }
    }

    fn abort(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.cancel_inners();
            self.drop_queues();
            let error = self
                .error
                .lock()
                .unwrap()
                .take()
                .unwrap_or(FlowError::MissingBackpressure);
            self.downstream.on_error(error);
        }
    }

    fn inner_failed(&self, error: FlowError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        self.has_error.store(true, Ordering::Release);
        self.drain();
    }
}

impl<T, R, F> Subscription for ZipCoordinator<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(Vec<T>) -> R + Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.ctl.request(n);
        self.drain();
    }

    fn cancel(&self) {
        self.ctl.cancel();
        self.cancel_inners();
        self.drain();
    }
}

struct ZipInner<T, R, F> {
    parent: Weak<ZipCoordinator<T, R, F>>,
    queue: RingQueue<T>,
    done: AtomicBool,
    upstream: SubscriptionSlot<T>,
    consumed: AtomicU64,
    prefetch: u64,
}

impl<T, R, F> ZipInner<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(Vec<T>) -> R + Send + Sync + 'static,
{
    fn replenish(&self) {
        let limit = self.prefetch - (self.prefetch >> 2);
        let consumed = self.consumed.load(Ordering::Relaxed) + 1;
        if consumed >= limit {
            self.consumed.store(0, Ordering::Relaxed);
            self.upstream.request(consumed);
        } else {
            self.consumed.store(consumed, Ordering::Relaxed);
        }
    }
}

impl<T, R, F> Subscriber<T> for ZipInner<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(Vec<T>) -> R + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if self.upstream.set(upstream) {
            self.upstream.request(self.prefetch);
        }
    }

    fn on_next(&self, item: T) {
        let Some(parent) = self.parent.upgrade() else {
            return;
        };
        if self.queue.offer(item).is_err() {
            self.upstream.cancel();
            parent.inner_failed(FlowError::MissingBackpressure);
            return;
        }
        parent.drain();
    }

    fn on_error(&self, error: FlowError) {
        self.done.store(true, Ordering::Release);
        if let Some(parent) = self.parent.upgrade() {
            parent.inner_failed(error);
        }
    }

    fn on_complete(&self) {
        self.done.store(true, Ordering::Release);
        if let Some(parent) = self.parent.upgrade() {
            parent.drain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::Take;
    use crate::testing::{TestPublisher, TestSubscriber};

    #[test]
    fn shortest_source_wins() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(1, 5)
            .zip_with(Flow::range(10, 3), |a, b| a + b)
            .subscribe(ts.clone());
        ts.assert_values(&[11, 13, 15]);
        ts.assert_complete();
    }

    #[test]
    fn zip_matches_take_of_the_longer() {
        let expected = TestSubscriber::new(u64::MAX);
        Flow::range(0, 4).zip_with(Flow::range(0, 9), |a, _| a).take(4)
            .subscribe(expected.clone());
        expected.assert_values(&[0, 1, 2, 3]);
        expected.assert_complete();
    }

    #[test]
    fn n_ary_zip_combines_rows() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::zip(
            vec![Flow::range(0, 3), Flow::range(10, 3), Flow::range(20, 3)],
            |row: Vec<i64>| row.into_iter().sum::<i64>(),
        )
        .subscribe(ts.clone());
        ts.assert_values(&[30, 33, 36]);
        ts.assert_complete();
    }

    #[test]
    fn rows_wait_for_every_source() {
        let left: TestPublisher<i32> = TestPublisher::new();
        let right: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        left.flow()
            .zip_with(right.flow(), |a, b| (a, b))
            .subscribe(ts.clone());
        left.emit(1);
        left.emit(2);
        ts.assert_values(&[]);
        right.emit(10);
        ts.assert_values(&[(1, 10)]);
        right.emit(20);
        ts.assert_values(&[(1, 10), (2, 20)]);
    }

    #[test]
    fn empty_source_list_completes() {
        let ts: Arc<TestSubscriber<i64>> = TestSubscriber::new(0);
        Flow::zip(Vec::<Flow<i64>>::new(), |_row: Vec<i64>| 0i64).subscribe(ts.clone());
        ts.assert_complete();
    }

    #[test]
    fn error_in_any_source_fails_the_zip() {
        let ts: Arc<TestSubscriber<i64>> = TestSubscriber::new(u64::MAX);
        Flow::zip(
            vec![Flow::range(0, 3), Flow::error(FlowError::callback("zip in"))],
            |row: Vec<i64>| row[0],
        )
        .subscribe(ts.clone());
        ts.assert_error(&FlowError::callback("zip in"));
    }
}
