use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::backpressure::{RelaySubscription, SubscriptionSlot};
use crate::channels::RingQueue;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::hooks;
use crate::types::Element;

/// Map items to flows and run them one after another
pub trait ConcatMap<T>: super::sealed::Sealed {
    /// Subscribe to the flow each item maps to only after the previous
    /// one completed, relaying items in strict order. The outer flow is
    /// prefetched with the process-wide buffer size.
    fn concat_map<R: Element>(
        self,
        mapper: impl Fn(T) -> Flow<R> + Send + Sync + 'static,
    ) -> Flow<R>;

    /// [ConcatMap::concat_map] with an explicit outer prefetch and,
    /// with `delay_errors`, errors held back until everything else ran.
    fn concat_map_with<R: Element>(
        self,
        mapper: impl Fn(T) -> Flow<R> + Send + Sync + 'static,
        prefetch: usize,
        delay_errors: bool,
    ) -> Flow<R>;
}

impl<T: Element> ConcatMap<T> for Flow<T> {
    fn concat_map<R: Element>(
        self,
        mapper: impl Fn(T) -> Flow<R> + Send + Sync + 'static,
    ) -> Flow<R> {
        let prefetch = hooks::buffer_size();
        self.concat_map_with(mapper, prefetch, false)
    }

    fn concat_map_with<R: Element>(
        self,
        mapper: impl Fn(T) -> Flow<R> + Send + Sync + 'static,
        prefetch: usize,
        delay_errors: bool,
    ) -> Flow<R> {
        assert!(prefetch > 0, "prefetch must be > 0");
        Flow::new(ConcatMapPublisher {
            upstream: self,
            mapper: Arc::new(mapper),
            prefetch,
            delay_errors,
            _marker: std::marker::PhantomData,
        })
    }
}

impl<T: Element> Flow<T> {
    /// Run `sources` back to back: each one is subscribed only after the
    /// previous completed.
    pub fn concat(sources: impl IntoIterator<Item = Flow<T>>) -> Flow<T> {
        let sources: Vec<Flow<T>> = sources.into_iter().collect();
        Flow::from_iter(sources).concat_map(|flow| flow)
    }
}

struct ConcatMapPublisher<T, R, F> {
    upstream: Flow<T>,
    mapper: Arc<F>,
    prefetch: usize,
    delay_errors: bool,
    _marker: std::marker::PhantomData<fn() -> R>,
}

impl<T, R, F> Publisher<R> for ConcatMapPublisher<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(T) -> Flow<R> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<R>>) {
        let coordinator = Arc::new_cyclic(|this: &Weak<ConcatMapCoordinator<T, R, F>>| {
            ConcatMapCoordinator {
                this: this.clone(),
                downstream: subscriber.clone(),
                mapper: Arc::clone(&self.mapper),
                prefetch: self.prefetch as u64,
                delay_errors: self.delay_errors,
                relay: Arc::new(RelaySubscription::new()),
                queue: RingQueue::new(self.prefetch),
                wip: AtomicUsize::new(0),
                active: AtomicBool::new(false),
                outer_done: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                errors: Mutex::new(Vec::new()),
                upstream: SubscriptionSlot::new(),
                consumed: AtomicU64::new(0),
                terminated: AtomicBool::new(false),
            }
        });
        subscriber.on_subscribe(Upstream::plain(Arc::new(ConcatMapSubscription {
            coordinator: coordinator.clone(),
        })));
        self.upstream.subscribe(coordinator);
    }
}

struct ConcatMapCoordinator<T, R, F> {
    this: Weak<ConcatMapCoordinator<T, R, F>>,
    downstream: Arc<dyn Subscriber<R>>,
    mapper: Arc<F>,
    prefetch: u64,
    delay_errors: bool,
    relay: Arc<RelaySubscription<R>>,
    queue: RingQueue<T>,
    /// serializes the subscribe-next decision
    wip: AtomicUsize,
    /// an inner subscription is live
    active: AtomicBool,
    outer_done: AtomicBool,
    cancelled: AtomicBool,
    errors: Mutex<Vec<FlowError>>,
    upstream: SubscriptionSlot<T>,
    /// outer items settled since the last replenishment
    consumed: AtomicU64,
    terminated: AtomicBool,
}

impl<T, R, F> ConcatMapCoordinator<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(T) -> Flow<R> + Send + Sync + 'static,
{
    /// Start the next inner flow if none is running. Terminal decisions
    /// are made here, after the outer queue ran dry.
    fn next_inner(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.queue.clear();
            } else if !self.active.load(Ordering::Acquire) {
                let done = self.outer_done.load(Ordering::Acquire);
                match self.queue.poll() {
                    Some(item) => {
                        let inner_flow = (self.mapper)(item);
                        self.active.store(true, Ordering::Release);
                        if let Some(this) = self.this.upgrade() {
                            inner_flow.subscribe(Arc::new(ConcatInner { coordinator: this }));
                        }
                    }
                    None => {
                        if done {
                            self.finish();
                        }
                    }
                }
            }
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                return;
            }
        }
    }

    /// One outer item is fully consumed; replenish in 75% batches.
    fn outer_item_settled(&self) {
        let limit = self.prefetch - (self.prefetch >> 2);
        let consumed = self.consumed.load(Ordering::Relaxed) + 1;
        if consumed >= limit {
            self.consumed.store(0, Ordering::Relaxed);
            self.upstream.request(consumed);
        } else {
            self.consumed.store(consumed, Ordering::Relaxed);
        }
    }

    fn inner_finished(&self) {
        self.active.store(false, Ordering::Release);
        self.outer_item_settled();
        self.next_inner();
    }

    fn inner_failed(&self, error: FlowError) {
        if self.delay_errors {
            self.errors.lock().unwrap().push(error);
            self.inner_finished();
        } else {
            self.abort(error);
        }
    }

    fn abort(&self, error: FlowError) {
        self.cancelled.store(true, Ordering::Release);
        self.upstream.cancel();
        self.relay.cancel();
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_error(error);
        }
        // queue teardown belongs to the trampoline, the sole consumer
        self.next_inner();
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

    fn cancel_all(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.upstream.cancel();
        self.relay.cancel();
        self.next_inner();
    }
}

impl<T, R, F> Subscriber<T> for ConcatMapCoordinator<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(T) -> Flow<R> + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if self.upstream.set(upstream) {
            self.upstream.request(self.prefetch);
        }
    }

    fn on_next(&self, item: T) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        if self.queue.offer(item).is_err() {
            self.upstream.cancel();
            self.abort(FlowError::MissingBackpressure);
            return;
        }
        self.next_inner();
    }

    fn on_error(&self, error: FlowError) {
        if self.delay_errors {
            self.errors.lock().unwrap().push(error);
            self.outer_done.store(true, Ordering::Release);
            self.next_inner();
        } else {
            self.abort(error);
        }
    }

    fn on_complete(&self) {
        self.outer_done.store(true, Ordering::Release);
        self.next_inner();
    }
}

struct ConcatInner<T, R, F> {
    coordinator: Arc<ConcatMapCoordinator<T, R, F>>,
}

impl<T, R, F> Subscriber<R> for ConcatInner<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(T) -> Flow<R> + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<R>) {
        self.coordinator.relay.set_upstream(upstream);
    }

    fn on_next(&self, item: R) {
        self.coordinator.relay.produced(1);
        self.coordinator.downstream.on_next(item);
    }

    fn on_error(&self, error: FlowError) {
        self.coordinator.inner_failed(error);
    }

    fn on_complete(&self) {
        self.coordinator.inner_finished();
    }
}

struct ConcatMapSubscription<T, R, F> {
    coordinator: Arc<ConcatMapCoordinator<T, R, F>>,
}

impl<T, R, F> Subscription for ConcatMapSubscription<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(T) -> Flow<R> + Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        self.coordinator.relay.request(n);
    }

    fn cancel(&self) {
        self.coordinator.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSubscriber;

    #[test]
    fn preserves_order_across_inners() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 3)
            .concat_map(|x| Flow::range(x * 10, 2))
            .subscribe(ts.clone());
        ts.assert_values(&[0, 1, 10, 11, 20, 21]);
        ts.assert_complete();
    }

    #[test]
    fn concat_with_empty_is_identity() {
        let plain = TestSubscriber::new(u64::MAX);
        Flow::range(1, 3).subscribe(plain.clone());

        let left = TestSubscriber::new(u64::MAX);
        Flow::concat([Flow::range(1, 3), Flow::empty()]).subscribe(left.clone());

        let right = TestSubscriber::new(u64::MAX);
        Flow::concat([Flow::empty(), Flow::range(1, 3)]).subscribe(right.clone());

        assert_eq!(left.values(), plain.values());
        assert_eq!(right.values(), plain.values());
        left.assert_complete();
        right.assert_complete();
    }

    #[test]
    fn demand_spans_inner_boundaries() {
        let ts = TestSubscriber::new(3);
        Flow::range(0, 3)
            .concat_map(|x| Flow::range(x * 10, 2))
            .subscribe(ts.clone());
        ts.assert_values(&[0, 1, 10]);
        ts.request(2);
        ts.assert_values(&[0, 1, 10, 11, 20]);
    }

    #[test]
    fn error_cuts_the_sequence_short() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::concat([
            Flow::range(0, 2),
            Flow::error(FlowError::callback("broken")),
            Flow::range(10, 2),
        ])
        .subscribe(ts.clone());
        ts.assert_values(&[0, 1]);
        ts.assert_error(&FlowError::callback("broken"));
    }

    #[test]
    fn delayed_error_lets_later_inners_run() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::from_iter([0i64, 1, 2])
            .concat_map_with(
                |x| {
                    if x == 1 {
                        Flow::error(FlowError::callback("late"))
                    } else {
                        Flow::range(x * 10, 2)
                    }
                },
                8,
                true,
            )
            .subscribe(ts.clone());
        ts.assert_values(&[0, 1, 20, 21]);
        ts.assert_error(&FlowError::callback("late"));
    }
}
