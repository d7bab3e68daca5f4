use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::backpressure::{DrainControl, SubscriptionSlot};
use crate::channels::{LinkedQueue, RingQueue};
use crate::error::FlowError;
use crate::flow::{
    Flow, FusionMode, Publisher, QueueSubscription, Subscriber, Subscription, Upstream,
};
use crate::hooks;
use crate::types::Element;

const INNER_NONE: u8 = 0;
const INNER_SYNC: u8 = 1;

/// Map items to flows and merge their items
pub trait FlatMap<T>: super::sealed::Sealed {
    /// Subscribe to the flow every item maps to and relay their items as
    /// they arrive, in any order consistent with a fair round-robin over
    /// the live inner flows. Runs with unbounded concurrency and the
    /// process-wide buffer size per inner flow.
    ///
    /// # Example
    /// ```rust
    /// use riptide::flow::Flow;
    /// use riptide::operators::*;
    /// use riptide::testing::TestSubscriber;
    ///
    /// let ts = TestSubscriber::new(u64::MAX);
    /// Flow::range(0, 3)
    ///     .flat_map(|x| Flow::range(x * 10, 2))
    ///     .subscribe(ts.clone());
    /// assert_eq!(ts.value_count(), 6);
    /// ```
    fn flat_map<R: Element>(
        self,
        mapper: impl Fn(T) -> Flow<R> + Send + Sync + 'static,
    ) -> Flow<R>;

    /// [FlatMap::flat_map] with explicit limits: at most
    /// `max_concurrency` inner flows live at once, each prefetched with
    /// `buffer_size`. With `delay_errors`, inner errors are collected
    /// and delivered together once everything else finished.
    fn flat_map_with<R: Element>(
        self,
        mapper: impl Fn(T) -> Flow<R> + Send + Sync + 'static,
        max_concurrency: usize,
        buffer_size: usize,
        delay_errors: bool,
    ) -> Flow<R>;

    /// Map every item to an iterable and emit its items inline, in
    /// order.
    fn flat_map_iter<R: Element, I>(
        self,
        mapper: impl Fn(T) -> I + Send + Sync + 'static,
    ) -> Flow<R>
    where
        I: IntoIterator<Item = R> + Clone + Send + Sync + 'static,
        I::IntoIter: Send;
}

impl<T: Element> FlatMap<T> for Flow<T> {
    fn flat_map<R: Element>(
        self,
        mapper: impl Fn(T) -> Flow<R> + Send + Sync + 'static,
    ) -> Flow<R> {
        let buffer_size = hooks::buffer_size();
        self.flat_map_with(mapper, usize::MAX, buffer_size, false)
    }

    fn flat_map_with<R: Element>(
        self,
        mapper: impl Fn(T) -> Flow<R> + Send + Sync + 'static,
        max_concurrency: usize,
        buffer_size: usize,
        delay_errors: bool,
    ) -> Flow<R> {
        assert!(max_concurrency > 0, "max_concurrency must be > 0");
        assert!(buffer_size > 0, "buffer_size must be > 0");
        Flow::new(FlatMapPublisher {
            upstream: self,
            mapper: Arc::new(mapper),
            max_concurrency,
            buffer_size,
            delay_errors,
            _marker: std::marker::PhantomData,
        })
    }

    fn flat_map_iter<R: Element, I>(
        self,
        mapper: impl Fn(T) -> I + Send + Sync + 'static,
    ) -> Flow<R>
    where
        I: IntoIterator<Item = R> + Clone + Send + Sync + 'static,
        I::IntoIter: Send,
    {
        crate::operators::ConcatMap::concat_map(self, move |item| Flow::from_iter(mapper(item)))
    }
}

impl<T: Element> Flow<T> {
    /// Merge the items of all `sources`; equivalent to flat-mapping the
    /// identity function over them.
    pub fn merge(sources: impl IntoIterator<Item = Flow<T>>) -> Flow<T> {
        let sources: Vec<Flow<T>> = sources.into_iter().collect();
        Flow::from_iter(sources).flat_map(|flow| flow)
    }
}

struct FlatMapPublisher<T, R, F> {
    upstream: Flow<T>,
    mapper: Arc<F>,
    max_concurrency: usize,
    buffer_size: usize,
    delay_errors: bool,
    _marker: std::marker::PhantomData<fn() -> R>,
}

impl<T, R, F> Publisher<R> for FlatMapPublisher<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(T) -> Flow<R> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<R>>) {
        let coordinator = Arc::new_cyclic(|this: &Weak<FlatMapCoordinator<T, R, F>>| {
            FlatMapCoordinator {
                this: this.clone(),
                downstream: subscriber.clone(),
                mapper: Arc::clone(&self.mapper),
                max_concurrency: self.max_concurrency,
                buffer_size: self.buffer_size,
                delay_errors: self.delay_errors,
                ctl: DrainControl::new(),
                errors: Mutex::new(Vec::new()),
                has_error: AtomicBool::new(false),
                outer_done: AtomicBool::new(false),
                inners: Mutex::new(Vec::new()),
                scalars: LinkedQueue::new(),
                upstream: SubscriptionSlot::new(),
                terminated: AtomicBool::new(false),
            }
        });
        subscriber.on_subscribe(Upstream::plain(coordinator.clone()));
        self.upstream.subscribe(coordinator);
    }
}

/// What an inner subscription needs from its coordinator.
trait InnerParent<R>: Send + Sync {
    fn inner_ready(&self);
    fn inner_error(&self, error: FlowError);
}

struct FlatMapCoordinator<T, R, F> {
    this: Weak<FlatMapCoordinator<T, R, F>>,
    downstream: Arc<dyn Subscriber<R>>,
    mapper: Arc<F>,
    max_concurrency: usize,
    buffer_size: usize,
    delay_errors: bool,
    ctl: DrainControl,
    errors: Mutex<Vec<FlowError>>,
    has_error: AtomicBool,
    outer_done: AtomicBool,
    /// live inner subscriptions; the mutex guards registry maintenance
    /// only, never the emission path
    inners: Mutex<Vec<Arc<InnerSubscriber<R>>>>,
    /// items of synchronous single-value inner flows skip the inner
    /// subscription entirely
    scalars: LinkedQueue<R>,
    upstream: SubscriptionSlot<T>,
    terminated: AtomicBool,
}

impl<T, R, F> FlatMapCoordinator<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(T) -> Flow<R> + Send + Sync + 'static,
{
    fn drain(&self) {
        if !self.ctl.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if self.cleanup_if_cancelled() {
                return;
            }
            if !self.delay_errors && self.has_error.load(Ordering::Acquire) {
                self.abort_with_error();
                return;
            }
            let requested = self.ctl.requested();
            let mut emitted = 0u64;

            while emitted < requested {
                match self.scalars.poll() {
                    Some(item) => {
                        self.downstream.on_next(item);
                        emitted += 1;
                        // a scalar settles one outer item
                        self.upstream.request(1);
                    }
                    None => break,
                }
                if self.cleanup_if_cancelled() {
                    return;
                }
            }

            let snapshot: Vec<Arc<InnerSubscriber<R>>> = self.inners.lock().unwrap().clone();
            for inner in &snapshot {
                if self.cleanup_if_cancelled() {
                    return;
                }
                if !self.delay_errors && self.has_error.load(Ordering::Acquire) {
                    self.abort_with_error();
                    return;
                }
                loop {
                    if emitted >= requested {
                        break;
                    }
                    let done = inner.done.load(Ordering::Acquire);
                    match inner.poll() {
                        Some(item) => {
                            self.downstream.on_next(item);
                            emitted += 1;
                            inner.replenish();
                        }
                        None => {
                            if done {
                                self.retire(inner);
                            }
                            break;
                        }
                    }
                }
                // an inner that finished outside the demand window still
                // needs retiring so the outer window moves on
                if inner.done.load(Ordering::Acquire) && inner.is_empty() {
                    self.retire(inner);
                }
            }

            self.ctl.produced(emitted);

            if self.outer_done.load(Ordering::Acquire)
                && self.inners.lock().unwrap().is_empty()
                && self.scalars.is_empty()
            {
                self.finish();
                return;
            }

            missed = self.ctl.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    /// Drop a finished inner from the registry; one outer slot opens up.
    fn retire(&self, inner: &Arc<InnerSubscriber<R>>) {
        let mut inners = self.inners.lock().unwrap();
        let before = inners.len();
        inners.retain(|candidate| !Arc::ptr_eq(candidate, inner));
        if inners.len() < before {
            drop(inners);
            self.upstream.request(1);
        }
    }

    fn cleanup_if_cancelled(&self) -> bool {
        if !self.ctl.is_cancelled() {
            return false;
        }
        self.scalars.clear();
        let inners: Vec<_> = self.inners.lock().unwrap().drain(..).collect();
        for inner in inners {
            inner.cancel_inner();
        }
        true
    }

    fn abort_with_error(&self) {
        self.upstream.cancel();
        let inners: Vec<_> = self.inners.lock().unwrap().drain(..).collect();
        for inner in inners {
            inner.cancel_inner();
        }
        self.scalars.clear();
        let error = {
            let mut errors = self.errors.lock().unwrap();
            FlowError::composite(errors.drain(..).collect())
        };
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_error(error);
        }
    }

    fn finish(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let errors: Vec<FlowError> = self.errors.lock().unwrap().drain(..).collect();
        if errors.is_empty() {
            self.downstream.on_complete();
        } else {
            self.downstream.on_error(FlowError::composite(errors));
        }
    }
}

impl<T, R, F> Subscriber<T> for FlatMapCoordinator<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(T) -> Flow<R> + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if self.upstream.set(upstream) {
            let initial = if self.max_concurrency == usize::MAX {
                u64::MAX
            } else {
                self.max_concurrency as u64
            };
            self.upstream.request(initial);
        }
    }

    fn on_next(&self, item: T) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        let inner_flow = (self.mapper)(item);
        if let Some(value) = inner_flow.scalar_value() {
            self.scalars.push(value);
            self.drain();
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let inner = Arc::new(InnerSubscriber {
            parent: this,
            queue: RingQueue::new(self.buffer_size),
            fused: Mutex::new(None),
            mode: AtomicU8::new(INNER_NONE),
            done: AtomicBool::new(false),
            upstream: SubscriptionSlot::new(),
            consumed: AtomicU64::new(0),
            prefetch: self.buffer_size as u64,
        });
        self.inners.lock().unwrap().push(inner.clone());
        if self.ctl.is_cancelled() {
            // the drain owns queue teardown
            self.drain();
            return;
        }
        inner_flow.subscribe(inner);
    }

    fn on_error(&self, error: FlowError) {
        self.errors.lock().unwrap().push(error);
        self.has_error.store(true, Ordering::Release);
        self.outer_done.store(true, Ordering::Release);
        self.drain();
    }

    fn on_complete(&self) {
        self.outer_done.store(true, Ordering::Release);
        self.drain();
    }
}

impl<T, R, F> Subscription for FlatMapCoordinator<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(T) -> Flow<R> + Send + Sync + 'static,
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
        self.upstream.cancel();
        self.drain();
    }
}

impl<T, R, F> InnerParent<R> for FlatMapCoordinator<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(T) -> Flow<R> + Send + Sync + 'static,
{
    fn inner_ready(&self) {
        self.drain();
    }

    fn inner_error(&self, error: FlowError) {
        self.errors.lock().unwrap().push(error);
        self.has_error.store(true, Ordering::Release);
        self.drain();
    }
}

struct InnerSubscriber<R> {
    parent: Arc<dyn InnerParent<R>>,
    queue: RingQueue<R>,
    fused: Mutex<Option<Arc<dyn QueueSubscription<R>>>>,
    mode: AtomicU8,
    done: AtomicBool,
    upstream: SubscriptionSlot<R>,
    /// items taken since the last replenishment; drain-owned
    consumed: AtomicU64,
    prefetch: u64,
}

impl<R: Element> InnerSubscriber<R> {
    fn poll(&self) -> Option<R> {
        if self.mode.load(Ordering::Acquire) == INNER_SYNC {
            let item = self.fused.lock().unwrap().as_ref().and_then(|q| q.poll());
            if item.is_none() {
                self.done.store(true, Ordering::Release);
            }
            item
        } else {
            self.queue.poll()
        }
    }

    fn is_empty(&self) -> bool {
        if self.mode.load(Ordering::Acquire) == INNER_SYNC {
            self.fused
                .lock()
                .unwrap()
                .as_ref()
                .map(|q| q.is_queue_empty())
                .unwrap_or(true)
        } else {
            self.queue.is_empty()
        }
    }

    fn replenish(&self) {
        if self.mode.load(Ordering::Acquire) == INNER_SYNC {
            return;
        }
        let limit = self.prefetch - (self.prefetch >> 2);
        let consumed = self.consumed.load(Ordering::Relaxed) + 1;
        if consumed >= limit {
            self.consumed.store(0, Ordering::Relaxed);
            self.upstream.request(consumed);
        } else {
            self.consumed.store(consumed, Ordering::Relaxed);
        }
    }

    fn cancel_inner(&self) {
        self.upstream.cancel();
        self.queue.clear();
        if let Some(queue) = self.fused.lock().unwrap().as_ref() {
            queue.clear();
        }
    }
}

impl<R: Element> Subscriber<R> for InnerSubscriber<R> {
    fn on_subscribe(&self, upstream: Upstream<R>) {
        if upstream.try_fuse(FusionMode::Sync) == FusionMode::Sync {
            if let Some(queue) = upstream.as_queue() {
                *self.fused.lock().unwrap() = Some(Arc::clone(queue));
            }
            self.mode.store(INNER_SYNC, Ordering::Release);
            self.upstream.set(upstream);
            self.parent.inner_ready();
            return;
        }
        if self.upstream.set(upstream) {
            self.upstream.request(self.prefetch);
        }
    }

    fn on_next(&self, item: R) {
        if self.queue.offer(item).is_err() {
            self.upstream.cancel();
            self.parent.inner_error(FlowError::MissingBackpressure);
            return;
        }
        self.parent.inner_ready();
    }

    fn on_error(&self, error: FlowError) {
        self.done.store(true, Ordering::Release);
        self.parent.inner_error(error);
    }

    fn on_complete(&self) {
        self.done.store(true, Ordering::Release);
        self.parent.inner_ready();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::operators::{Reduce, SubscribeOn};
    use crate::scheduler::SingleScheduler;
    use crate::testing::TestSubscriber;

    #[test]
    fn merges_all_inner_items() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 3)
            .flat_map(|x| Flow::range(x * 10, 2))
            .subscribe(ts.clone());
        let seen: HashSet<i64> = ts.values().into_iter().collect();
        let expected: HashSet<i64> = [0, 1, 10, 11, 20, 21].into_iter().collect();
        assert_eq!(seen, expected);
        ts.assert_complete();
    }

    #[test]
    fn merge_of_scalars_is_a_permutation() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::merge([Flow::just(1), Flow::just(2), Flow::just(3)]).subscribe(ts.clone());
        let mut seen = ts.values();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3]);
        ts.assert_complete();
    }

    #[test]
    fn merge_count_is_the_sum_of_counts() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::merge([Flow::range(0, 4), Flow::range(0, 7), Flow::range(0, 2)])
            .count()
            .subscribe(ts.clone());
        ts.assert_values(&[13]);
    }

    #[test]
    fn respects_downstream_demand() {
        let ts = TestSubscriber::new(3);
        Flow::range(0, 10)
            .flat_map(|x| Flow::range(x, 3))
            .subscribe(ts.clone());
        assert_eq!(ts.value_count(), 3);
        ts.request(4);
        assert_eq!(ts.value_count(), 7);
    }

    #[test]
    fn inner_error_preempts_pending_items() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 3)
            .flat_map(|x| {
                if x == 1 {
                    Flow::error(FlowError::callback("inner failed"))
                } else {
                    Flow::range(x, 2)
                }
            })
            .subscribe(ts.clone());
        ts.assert_error(&FlowError::callback("inner failed"));
    }

    #[test]
    fn delayed_errors_arrive_after_all_items() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 3)
            .flat_map_with(
                |x| {
                    if x == 1 {
                        Flow::error(FlowError::callback("late"))
                    } else {
                        Flow::range(x, 2)
                    }
                },
                usize::MAX,
                16,
                true,
            )
            .subscribe(ts.clone());
        assert_eq!(ts.value_count(), 4);
        ts.assert_error(&FlowError::callback("late"));
    }

    #[test]
    fn bounded_concurrency_limits_outer_demand() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 100)
            .flat_map_with(|x| Flow::range(x, 1), 2, 8, false)
            .subscribe(ts.clone());
        // with the window moving one-by-one everything still arrives
        ts.assert_complete();
        assert_eq!(ts.value_count(), 100);
    }

    #[test]
    fn flat_map_iter_inlines_iterables() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 3)
            .flat_map_iter(|x| vec![x, x * 10])
            .subscribe(ts.clone());
        ts.assert_values(&[0, 0, 1, 10, 2, 20]);
        ts.assert_complete();
    }

    #[test]
    fn merges_across_threads() {
        let scheduler: Arc<dyn crate::scheduler::Scheduler> = Arc::new(SingleScheduler::new());
        let ts = TestSubscriber::new(u64::MAX);
        let on_worker = Flow::range(0, 50).subscribe_on(scheduler, false);
        Flow::merge([on_worker, Flow::range(100, 50)]).subscribe(ts.clone());
        assert!(ts.await_terminal(Duration::from_secs(5)));
        assert_eq!(ts.value_count(), 100);
    }
}
