use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::backpressure::{DrainControl, SubscriptionSlot};
use crate::channels::RingQueue;
use crate::error::FlowError;
use crate::flow::{
    Flow, FusionMode, Publisher, QueueSubscription, Subscriber, Subscription, Upstream,
};
use crate::types::Element;

const EAGER_NONE: u8 = 0;
const EAGER_SYNC: u8 = 1;

/// Concatenation with parallel pre-production
pub trait ConcatMapEager<T>: super::sealed::Sealed {
    /// Subscribe to up to `max_concurrency` mapped flows immediately,
    /// each buffering into its own queue, but relay them strictly in
    /// arrival order: the head flow is drained to completion before the
    /// next queue is touched.
    fn concat_map_eager<R: Element>(
        self,
        mapper: impl Fn(T) -> Flow<R> + Send + Sync + 'static,
        max_concurrency: usize,
        buffer_size: usize,
    ) -> Flow<R>;
}

impl<T: Element> ConcatMapEager<T> for Flow<T> {
    fn concat_map_eager<R: Element>(
        self,
        mapper: impl Fn(T) -> Flow<R> + Send + Sync + 'static,
        max_concurrency: usize,
        buffer_size: usize,
    ) -> Flow<R> {
        assert!(max_concurrency > 0, "max_concurrency must be > 0");
        assert!(buffer_size > 0, "buffer_size must be > 0");
        Flow::new(ConcatEagerPublisher {
            upstream: self,
            mapper: Arc::new(mapper),
            max_concurrency,
            buffer_size,
            _marker: std::marker::PhantomData,
        })
    }
}

struct ConcatEagerPublisher<T, R, F> {
    upstream: Flow<T>,
    mapper: Arc<F>,
    max_concurrency: usize,
    buffer_size: usize,
    _marker: std::marker::PhantomData<fn() -> R>,
}

impl<T, R, F> Publisher<R> for ConcatEagerPublisher<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(T) -> Flow<R> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<R>>) {
        let coordinator = Arc::new_cyclic(|this: &Weak<ConcatEagerCoordinator<T, R, F>>| {
            ConcatEagerCoordinator {
                this: this.clone(),
                downstream: subscriber.clone(),
                mapper: Arc::clone(&self.mapper),
                max_concurrency: self.max_concurrency,
                buffer_size: self.buffer_size,
                ctl: DrainControl::new(),
                pending: Mutex::new(VecDeque::new()),
                outer_done: AtomicBool::new(false),
                error: Mutex::new(None),
                has_error: AtomicBool::new(false),
                upstream: SubscriptionSlot::new(),
                terminated: AtomicBool::new(false),
            }
        });
        subscriber.on_subscribe(Upstream::plain(coordinator.clone()));
        self.upstream.subscribe(coordinator);
    }
}

struct ConcatEagerCoordinator<T, R, F> {
    this: Weak<ConcatEagerCoordinator<T, R, F>>,
    downstream: Arc<dyn Subscriber<R>>,
    mapper: Arc<F>,
    max_concurrency: usize,
    buffer_size: usize,
    ctl: DrainControl,
    /// inner subscriptions in arrival order; the head is the only one
    /// being relayed
    pending: Mutex<VecDeque<Arc<EagerInner<R>>>>,
    outer_done: AtomicBool,
    error: Mutex<Option<FlowError>>,
    has_error: AtomicBool,
    upstream: SubscriptionSlot<T>,
    terminated: AtomicBool,
}

impl<T, R, F> ConcatEagerCoordinator<T, R, F>
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
            if self.ctl.is_cancelled() {
                self.cleanup();
                return;
            }
            if self.has_error.load(Ordering::Acquire) {
                self.abort();
                return;
            }
            let requested = self.ctl.requested();
            let mut emitted = 0u64;
            loop {
                let head = self.pending.lock().unwrap().front().cloned();
                let Some(head) = head else {
                    if self.outer_done.load(Ordering::Acquire) {
                        self.finish();
                        return;
                    }
                    break;
                };
                let mut head_finished = false;
                while emitted < requested {
                    if self.ctl.is_cancelled() {
                        self.cleanup();
                        return;
                    }
                    if self.has_error.load(Ordering::Acquire) {
                        self.abort();
                        return;
                    }
                    let done = head.done.load(Ordering::Acquire);
                    match head.poll() {
                        Some(item) => {
                            self.downstream.on_next(item);
                            emitted += 1;
                            head.replenish();
                        }
                        None => {
                            if done {
                                head_finished = true;
                            }
                            break;
                        }
                    }
                }
                if !head_finished && head.done.load(Ordering::Acquire) && head.is_empty() {
                    head_finished = true;
                }
                if head_finished {
                    self.pending.lock().unwrap().pop_front();
                    self.upstream.request(1);
                    continue;
                }
                break;
            }
            self.ctl.produced(emitted);
            missed = self.ctl.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn cleanup(&self) {
        let inners: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
        for inner in inners {
            inner.cancel_inner();
        }
    }

    fn abort(&self) {
        self.upstream.cancel();
        self.cleanup();
        let error = self
            .error
            .lock()
            .unwrap()
            .take()
            .unwrap_or(FlowError::MissingBackpressure);
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_error(error);
        }
    }

    fn finish(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.downstream.on_complete();
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

impl<T, R, F> Subscriber<T> for ConcatEagerCoordinator<T, R, F>
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
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let inner = Arc::new(EagerInner {
            parent: this,
            queue: RingQueue::new(self.buffer_size),
            fused: Mutex::new(None),
            mode: AtomicU8::new(EAGER_NONE),
            done: AtomicBool::new(false),
            upstream: SubscriptionSlot::new(),
            consumed: AtomicU64::new(0),
            prefetch: self.buffer_size as u64,
        });
        self.pending.lock().unwrap().push_back(inner.clone());
        if self.ctl.is_cancelled() {
            // the drain owns queue teardown
            self.drain();
            return;
        }
        // pre-production starts now; relay order stays arrival order
        inner_flow.subscribe(inner);
    }

    fn on_error(&self, error: FlowError) {
        self.outer_done.store(true, Ordering::Release);
        self.inner_failed(error);
    }

    fn on_complete(&self) {
        self.outer_done.store(true, Ordering::Release);
        self.drain();
    }
}

impl<T, R, F> Subscription for ConcatEagerCoordinator<T, R, F>
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

trait EagerParent<R>: Send + Sync {
    fn inner_ready(&self);
    fn inner_failed(&self, error: FlowError);
}

impl<T, R, F> EagerParent<R> for ConcatEagerCoordinator<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(T) -> Flow<R> + Send + Sync + 'static,
{
    fn inner_ready(&self) {
        self.drain();
    }

    fn inner_failed(&self, error: FlowError) {
        ConcatEagerCoordinator::inner_failed(self, error);
    }
}

struct EagerInner<R> {
    parent: Arc<dyn EagerParent<R>>,
    queue: RingQueue<R>,
    fused: Mutex<Option<Arc<dyn QueueSubscription<R>>>>,
    mode: AtomicU8,
    done: AtomicBool,
    upstream: SubscriptionSlot<R>,
    consumed: AtomicU64,
    prefetch: u64,
}

impl<R: Element> EagerInner<R> {
    fn poll(&self) -> Option<R> {
        if self.mode.load(Ordering::Acquire) == EAGER_SYNC {
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
        if self.mode.load(Ordering::Acquire) == EAGER_SYNC {
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
        if self.mode.load(Ordering::Acquire) == EAGER_SYNC {
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

impl<R: Element> Subscriber<R> for EagerInner<R> {
    fn on_subscribe(&self, upstream: Upstream<R>) {
        if upstream.try_fuse(FusionMode::Sync) == FusionMode::Sync {
            if let Some(queue) = upstream.as_queue() {
                *self.fused.lock().unwrap() = Some(Arc::clone(queue));
            }
            self.mode.store(EAGER_SYNC, Ordering::Release);
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
            self.parent.inner_failed(FlowError::MissingBackpressure);
            return;
        }
        self.parent.inner_ready();
    }

    fn on_error(&self, error: FlowError) {
        self.done.store(true, Ordering::Release);
        self.parent.inner_failed(error);
    }

    fn on_complete(&self) {
        self.done.store(true, Ordering::Release);
        self.parent.inner_ready();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::operators::SubscribeOn;
    use crate::scheduler::SingleScheduler;
    use crate::testing::TestSubscriber;

    #[test]
    fn relays_in_arrival_order() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 3)
            .concat_map_eager(|x| Flow::range(x * 10, 2), 4, 8)
            .subscribe(ts.clone());
        ts.assert_values(&[0, 1, 10, 11, 20, 21]);
        ts.assert_complete();
    }

    #[test]
    fn order_survives_asynchronous_inners() {
        let scheduler: Arc<dyn crate::scheduler::Scheduler> = Arc::new(SingleScheduler::new());
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 4)
            .concat_map_eager(
                move |x| Flow::range(x * 10, 3).subscribe_on(scheduler.clone(), false),
                4,
                8,
            )
            .subscribe(ts.clone());
        assert!(ts.await_terminal(Duration::from_secs(5)));
        ts.assert_values(&[0, 1, 2, 10, 11, 12, 20, 21, 22, 30, 31, 32]);
    }

    #[test]
    fn inner_error_ends_everything() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 3)
            .concat_map_eager(
                |x| {
                    if x == 1 {
                        Flow::error(FlowError::callback("eager fail"))
                    } else {
                        Flow::range(x, 1)
                    }
                },
                4,
                8,
            )
            .subscribe(ts.clone());
        ts.assert_error(&FlowError::callback("eager fail"));
    }
}
