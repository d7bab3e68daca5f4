use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::backpressure::{DrainControl, SubscriptionSlot};
use crate::channels::LinkedQueue;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::hooks;
use crate::types::Element;

/// Combine the latest values of several flows
pub trait CombineLatest<T>: super::sealed::Sealed {
    /// Emit a combination of this flow's and `other`'s latest values
    /// whenever either emits, once both have emitted at least once.
    fn combine_latest_with<U, R>(
        self,
        other: Flow<U>,
        combine: impl Fn(T, U) -> R + Send + Sync + 'static,
    ) -> Flow<R>
    where
        T: Clone,
        U: Element + Clone,
        R: Element;
}

impl<T: Element> CombineLatest<T> for Flow<T> {
    fn combine_latest_with<U, R>(
        self,
        other: Flow<U>,
        combine: impl Fn(T, U) -> R + Send + Sync + 'static,
    ) -> Flow<R>
    where
        T: Clone,
        U: Element + Clone,
        R: Element,
    {
        let left = crate::operators::Map::map(self, Either::Left);
        let right = crate::operators::Map::map(other, Either::Right);
        Flow::combine_latest(vec![left, right], move |mut row: Vec<Either<T, U>>| {
            let second = row.pop();
            let first = row.pop();
            match (first, second) {
                (Some(Either::Left(a)), Some(Either::Right(b))) => combine(a, b),
                _ => unreachable!("latest values are positional"),
            }
        })
    }
}

enum Either<A, B> {
    Left(A),
    Right(B),
}

impl<A: Clone, B: Clone> Clone for Either<A, B> {
    fn clone(&self) -> Self {
        match self {
            Either::Left(a) => Either::Left(a.clone()),
            Either::Right(b) => Either::Right(b.clone()),
        }
    }
}

impl<T: Element + Clone> Flow<T> {
    /// Hold the latest value of every source; on any emission, once all
    /// sources have emitted, combine the latest row into one output.
    /// Each source is prefetched with the process-wide buffer size and
    /// replenished by one whenever its value is superseded. Completes
    /// when a source completes without ever emitting, or when all
    /// sources have completed.
    pub fn combine_latest<R: Element>(
        sources: Vec<Flow<T>>,
        combine: impl Fn(Vec<T>) -> R + Send + Sync + 'static,
    ) -> Flow<R> {
        Flow::new(CombineLatestPublisher {
            sources,
            combine: Arc::new(combine),
        })
    }
}

struct CombineLatestPublisher<T, F> {
    sources: Vec<Flow<T>>,
    combine: Arc<F>,
}

impl<T, R, F> Publisher<R> for CombineLatestPublisher<T, F>
where
    T: Element + Clone,
    R: Element,
    F: Fn(Vec<T>) -> R + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<R>>) {
        if self.sources.is_empty() {
            subscriber.on_subscribe(Upstream::plain(Arc::new(crate::flow::NoopSubscription)));
            subscriber.on_complete();
            return;
        }
        let coordinator = Arc::new_cyclic(|this: &Weak<CombineCoordinator<T, R, F>>| {
            let inners = (0..self.sources.len())
                .map(|index| {
                    Arc::new(CombineInner {
                        parent: this.clone(),
                        index,
                        done: AtomicBool::new(false),
                        upstream: SubscriptionSlot::new(),
                    })
                })
                .collect();
            CombineCoordinator {
                downstream: subscriber.clone(),
                combine: Arc::clone(&self.combine),
                inners,
                latest: Mutex::new(vec![None; self.sources.len()]),
                populated: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
                rows: LinkedQueue::new(),
                ctl: DrainControl::new(),
                error: Mutex::new(None),
                has_error: AtomicBool::new(false),
                done: AtomicBool::new(false),
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

struct CombineCoordinator<T, R, F> {
    downstream: Arc<dyn Subscriber<R>>,
    combine: Arc<F>,
    inners: Vec<Arc<CombineInner<T, R, F>>>,
    latest: Mutex<Vec<Option<T>>>,
    /// sources that have emitted at least once
    populated: AtomicUsize,
    /// sources that have completed
    finished: AtomicUsize,
    /// combined rows awaiting downstream demand
    rows: LinkedQueue<Vec<T>>,
    ctl: DrainControl,
    error: Mutex<Option<FlowError>>,
    has_error: AtomicBool,
    /// no further rows can be produced
    done: AtomicBool,
    terminated: AtomicBool,
}

impl<T, R, F> CombineCoordinator<T, R, F>
where
    T: Element + Clone,
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
                self.rows.clear();
                return;
            }
            if self.has_error.load(Ordering::Acquire) {
                self.abort();
                return;
            }
            let requested = self.ctl.requested();
            let mut emitted = 0u64;
            while emitted < requested {
                if self.ctl.is_cancelled() {
                    self.rows.clear();
                    return;
                }
                if self.has_error.load(Ordering::Acquire) {
                    self.abort();
                    return;
                }
                let done = self.done.load(Ordering::Acquire);
                match self.rows.poll() {
                    Some(row) => {
                        self.downstream.on_next((self.combine)(row));
                        emitted += 1;
                    }
                    None => {
                        if done {
                            self.finish();
                            return;
                        }
                        break;
                    }
                }
            }
            if emitted == requested
                && self.done.load(Ordering::Acquire)
                && self.rows.is_empty()
                && !self.ctl.is_cancelled()
            {
                self.finish();
                return;
            }
            self.ctl.produced(emitted);
            missed = self.ctl.leave(missed);
            if missed == 0 {
                return;
            }
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
            self.downstream.on_complete();
        }
    }

    fn abort(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.cancel_inners();
            self.rows.clear();
            let error = self
                .error
                .lock()
                .unwrap()
                .take()
                .unwrap_or(FlowError::MissingBackpressure);
            self.downstream.on_error(error);
        }
    }

    fn value_arrived(&self, index: usize, item: T) {
        let row = {
            let mut latest = self.latest.lock().unwrap();
            let superseded = latest[index].replace(item).is_some();
            if !superseded {
                self.populated.fetch_add(1, Ordering::AcqRel);
            } else {
                // the superseded slot frees one unit of that source's
                // prefetch window
                self.inners[index].upstream.request(1);
            }
            if self.populated.load(Ordering::Acquire) == self.inners.len() {
                Some(
                    latest
                        .iter()
                        .map(|slot| slot.clone().expect("all slots populated"))
                        .collect::<Vec<T>>(),
                )
            } else {
                None
            }
        };
        match row {
            Some(row) => {
                self.rows.push(row);
                self.drain();
            }
            None => {
                // not combinable yet; that item still used its window
                self.inners[index].upstream.request(1);
            }
        }
    }

    fn source_finished(&self, index: usize) {
        let emitted = self.latest.lock().unwrap()[index].is_some();
        let total = self.inners.len();
        if !emitted {
            // a source that never emitted makes combining impossible
            self.done.store(true, Ordering::Release);
        } else if self.finished.fetch_add(1, Ordering::AcqRel) + 1 == total {
            self.done.store(true, Ordering::Release);
        }
        self.drain();
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

impl<T, R, F> Subscription for CombineCoordinator<T, R, F>
where
    T: Element + Clone,
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

struct CombineInner<T, R, F> {
    parent: Weak<CombineCoordinator<T, R, F>>,
    index: usize,
    done: AtomicBool,
    upstream: SubscriptionSlot<T>,
}

impl<T, R, F> Subscriber<T> for CombineInner<T, R, F>
where
    T: Element + Clone,
    R: Element,
    F: Fn(Vec<T>) -> R + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if self.upstream.set(upstream) {
            self.upstream.request(hooks::buffer_size() as u64);
        }
    }

    fn on_next(&self, item: T) {
        if let Some(parent) = self.parent.upgrade() {
            parent.value_arrived(self.index, item);
        }
    }

    fn on_error(&self, error: FlowError) {
        self.done.store(true, Ordering::Release);
        if let Some(parent) = self.parent.upgrade() {
            parent.inner_failed(error);
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            if let Some(parent) = self.parent.upgrade() {
                parent.source_finished(self.index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestPublisher, TestSubscriber};

    #[test]
    fn emits_once_every_source_has_a_value() {
        let left: TestPublisher<i32> = TestPublisher::new();
        let right: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        left.flow()
            .combine_latest_with(right.flow(), |a, b| (a, b))
            .subscribe(ts.clone());
        left.emit(1);
        ts.assert_values(&[]);
        right.emit(10);
        ts.assert_values(&[(1, 10)]);
        left.emit(2);
        ts.assert_values(&[(1, 10), (2, 10)]);
        right.emit(20);
        ts.assert_values(&[(1, 10), (2, 10), (2, 20)]);
    }

    #[test]
    fn a_source_that_never_emits_completes_the_flow() {
        let left: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        left.flow()
            .combine_latest_with(Flow::<i32>::empty(), |a, b| a + b)
            .subscribe(ts.clone());
        ts.assert_values(&[]);
        ts.assert_complete();
    }

    #[test]
    fn completes_after_all_sources_finish() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::combine_latest(vec![Flow::range(0, 2), Flow::range(10, 2)], |row: Vec<i64>| {
            row.iter().sum::<i64>()
        })
        .subscribe(ts.clone());
        ts.assert_complete();
        assert!(ts.value_count() >= 1);
    }

    #[test]
    fn source_error_fails_the_flow() {
        let left: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        left.flow()
            .combine_latest_with(Flow::error(FlowError::callback("cl")), |a, b: i32| a + b)
            .subscribe(ts.clone());
        ts.assert_error(&FlowError::callback("cl"));
    }
}
