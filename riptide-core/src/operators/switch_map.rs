use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::backpressure::{DrainControl, SubscriptionSlot};
use crate::channels::RingQueue;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::hooks;
use crate::types::Element;

/// Map items to flows, keeping only the most recent one
pub trait SwitchMap<T>: super::sealed::Sealed {
    /// Subscribe to the flow each item maps to, cancelling the
    /// previously active one. Items a stale inner delivers after the
    /// switch are discarded; the inner flows' completion does not end
    /// the output unless the outer flow has completed too.
    fn switch_map<R: Element>(
        self,
        mapper: impl Fn(T) -> Flow<R> + Send + Sync + 'static,
    ) -> Flow<R>;
}

impl<T: Element> SwitchMap<T> for Flow<T> {
    fn switch_map<R: Element>(
        self,
        mapper: impl Fn(T) -> Flow<R> + Send + Sync + 'static,
    ) -> Flow<R> {
        Flow::new(SwitchMapPublisher {
            upstream: self,
            mapper: Arc::new(mapper),
            _marker: std::marker::PhantomData,
        })
    }
}

struct SwitchMapPublisher<T, R, F> {
    upstream: Flow<T>,
    mapper: Arc<F>,
    _marker: std::marker::PhantomData<fn() -> R>,
}

impl<T, R, F> Publisher<R> for SwitchMapPublisher<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(T) -> Flow<R> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<R>>) {
        let coordinator = Arc::new_cyclic(|this: &Weak<SwitchMapCoordinator<T, R, F>>| {
            SwitchMapCoordinator {
                this: this.clone(),
                downstream: subscriber.clone(),
                mapper: Arc::clone(&self.mapper),
                buffer_size: hooks::buffer_size(),
                ctl: DrainControl::new(),
                index: AtomicU64::new(0),
                current: Mutex::new(None),
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

struct SwitchMapCoordinator<T, R, F> {
    this: Weak<SwitchMapCoordinator<T, R, F>>,
    downstream: Arc<dyn Subscriber<R>>,
    mapper: Arc<F>,
    buffer_size: usize,
    ctl: DrainControl,
    /// generation counter; only the inner carrying the latest index may
    /// reach downstream
    index: AtomicU64,
    current: Mutex<Option<Arc<SwitchInner<R>>>>,
    outer_done: AtomicBool,
    error: Mutex<Option<FlowError>>,
    has_error: AtomicBool,
    upstream: SubscriptionSlot<T>,
    terminated: AtomicBool,
}

impl<T, R, F> SwitchMapCoordinator<T, R, F>
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
                self.drop_current();
                return;
            }
            if self.has_error.load(Ordering::Acquire) {
                self.abort();
                return;
            }
            let requested = self.ctl.requested();
            let mut emitted = 0u64;
            let live = self.index.load(Ordering::Acquire);
            let current = self.current.lock().unwrap().clone();
            if let Some(inner) = current {
                if inner.index == live {
                    while emitted < requested {
                        if self.ctl.is_cancelled() {
                            self.drop_current();
                            return;
                        }
                        if self.has_error.load(Ordering::Acquire) {
                            self.abort();
                            return;
                        }
                        if self.index.load(Ordering::Acquire) != live {
                            // a newer inner took over mid-drain
                            break;
                        }
                        let done = inner.done.load(Ordering::Acquire);
                        match inner.queue.poll() {
                            Some(item) => {
                                self.downstream.on_next(item);
                                emitted += 1;
                                inner.replenish();
                            }
                            None => {
                                if done {
                                    self.retire_current(&inner);
                                }
                                break;
                            }
                        }
                    }
                    if inner.done.load(Ordering::Acquire) && inner.queue.is_empty() {
                        self.retire_current(&inner);
                    }
                } else {
                    // stale inner lingering after a switch
                    inner.cancel_inner();
                }
            }
            self.ctl.produced(emitted);
            if self.outer_done.load(Ordering::Acquire)
                && self.current.lock().unwrap().is_none()
            {
                if !self.terminated.swap(true, Ordering::AcqRel) {
                    self.downstream.on_complete();
                }
                return;
            }
            missed = self.ctl.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn retire_current(&self, inner: &Arc<SwitchInner<R>>) {
        let mut current = self.current.lock().unwrap();
        if let Some(live) = current.as_ref() {
            if Arc::ptr_eq(live, inner) {
                current.take();
            }
        }
    }

    fn drop_current(&self) {
        if let Some(inner) = self.current.lock().unwrap().take() {
            inner.cancel_inner();
        }
    }

    fn abort(&self) {
        self.upstream.cancel();
        self.drop_current();
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

    fn inner_failed(&self, index: u64, error: FlowError) {
        if self.index.load(Ordering::Acquire) != index {
            // stale inners may not corrupt the live stream
            crate::hooks::late_error(&error);
            return;
        }
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        self.has_error.store(true, Ordering::Release);
        self.drain();
    }
}

impl<T, R, F> Subscriber<T> for SwitchMapCoordinator<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(T) -> Flow<R> + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if self.upstream.set(upstream) {
            // outer items only steer the switch; consume them freely
            self.upstream.request(u64::MAX);
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
        let index = self.index.fetch_add(1, Ordering::AcqRel) + 1;
        let inner = Arc::new(SwitchInner {
            parent: this,
            index,
            queue: RingQueue::new(self.buffer_size),
            done: AtomicBool::new(false),
            upstream: SubscriptionSlot::new(),
            consumed: AtomicU64::new(0),
            prefetch: self.buffer_size as u64,
        });
        let previous = self.current.lock().unwrap().replace(inner.clone());
        if let Some(previous) = previous {
            previous.cancel_inner();
        }
        if self.ctl.is_cancelled() {
            self.drop_current();
            return;
        }
        inner_flow.subscribe(inner);
        self.drain();
    }

    fn on_error(&self, error: FlowError) {
        self.outer_done.store(true, Ordering::Release);
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        self.has_error.store(true, Ordering::Release);
        self.drain();
    }

    fn on_complete(&self) {
        self.outer_done.store(true, Ordering::Release);
        self.drain();
    }
}

impl<T, R, F> Subscription for SwitchMapCoordinator<T, R, F>
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

trait SwitchParent<R>: Send + Sync {
    fn inner_ready(&self);
    fn inner_failed(&self, index: u64, error: FlowError);
    fn live_index(&self) -> u64;
}

impl<T, R, F> SwitchParent<R> for SwitchMapCoordinator<T, R, F>
where
    T: Element,
    R: Element,
    F: Fn(T) -> Flow<R> + Send + Sync + 'static,
{
    fn inner_ready(&self) {
        self.drain();
    }

    fn inner_failed(&self, index: u64, error: FlowError) {
        SwitchMapCoordinator::inner_failed(self, index, error);
    }

    fn live_index(&self) -> u64 {
        self.index.load(Ordering::Acquire)
    }
}

struct SwitchInner<R> {
    parent: Arc<dyn SwitchParent<R>>,
    index: u64,
    queue: RingQueue<R>,
    done: AtomicBool,
    upstream: SubscriptionSlot<R>,
    consumed: AtomicU64,
    prefetch: u64,
}

impl<R: Element> SwitchInner<R> {
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

    /// Detach from upstream. Queued items are reclaimed when the inner
    /// is dropped; clearing here would race the drain's polling.
    fn cancel_inner(&self) {
        self.done.store(true, Ordering::Release);
        self.upstream.cancel();
    }
}

impl<R: Element> Subscriber<R> for SwitchInner<R> {
    fn on_subscribe(&self, upstream: Upstream<R>) {
        if self.upstream.set(upstream) {
            self.upstream.request(self.prefetch);
        }
    }

    fn on_next(&self, item: R) {
        if self.parent.live_index() != self.index {
            // switched away; this item must never surface
            return;
        }
        if self.queue.offer(item).is_err() {
            self.upstream.cancel();
            self.parent
                .inner_failed(self.index, FlowError::MissingBackpressure);
            return;
        }
        self.parent.inner_ready();
    }

    fn on_error(&self, error: FlowError) {
        self.done.store(true, Ordering::Release);
        self.parent.inner_failed(self.index, error);
    }

    fn on_complete(&self) {
        self.done.store(true, Ordering::Release);
        self.parent.inner_ready();
    }
}
