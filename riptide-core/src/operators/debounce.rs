use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::backpressure::{requests, SignalGate, SubscriptionSlot};
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::scheduler::{Cancellation, Scheduler, Worker};
use crate::types::Element;

/// Emit an item only once the flow went quiet
pub trait Debounce<T>: super::sealed::Sealed {
    /// Emit an item only after `window` passed without a newer one; each
    /// arrival restarts the countdown. A pending item is flushed by the
    /// upstream completion. The upstream is consumed unboundedly;
    /// emitting without downstream demand fails the flow.
    fn debounce(self, window: Duration, scheduler: Arc<dyn Scheduler>) -> Flow<T>;
}

impl<T: Element> Debounce<T> for Flow<T> {
    fn debounce(self, window: Duration, scheduler: Arc<dyn Scheduler>) -> Flow<T> {
        Flow::new(DebouncePublisher {
            upstream: self,
            window,
            scheduler,
        })
    }
}

struct DebouncePublisher<T> {
    upstream: Flow<T>,
    window: Duration,
    scheduler: Arc<dyn Scheduler>,
}

impl<T: Element> Publisher<T> for DebouncePublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let adapter = Arc::new_cyclic(|this: &Weak<DebounceSubscriber<T>>| DebounceSubscriber {
            this: this.clone(),
            downstream: subscriber.clone(),
            worker: self.scheduler.worker(),
            window: self.window,
            pending: Mutex::new(None),
            countdown: Mutex::new(None),
            generation: AtomicU64::new(0),
            requested: AtomicU64::new(0),
            gate: SignalGate::new(),
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

struct DebounceSubscriber<T> {
    this: Weak<DebounceSubscriber<T>>,
    downstream: Arc<dyn Subscriber<T>>,
    worker: Arc<dyn Worker>,
    window: Duration,
    pending: Mutex<Option<T>>,
    countdown: Mutex<Option<Cancellation>>,
    /// bumped per arrival so an elapsed countdown can tell whether it is
    /// still watching the newest item
    generation: AtomicU64,
    requested: AtomicU64,
    /// serializes the countdown emitter against upstream terminals
    gate: SignalGate,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T: Element> DebounceSubscriber<T> {
    fn emit_pending(&self) {
        let Some(item) = self.pending.lock().unwrap().take() else {
            return;
        };
        if requests::consume_one(&self.requested) {
            self.gate.next(self.downstream.as_ref(), item);
        } else {
            self.done.store(true, Ordering::Release);
            self.upstream.cancel();
            self.worker.dispose();
            self.gate
                .error(self.downstream.as_ref(), FlowError::MissingBackpressure);
        }
    }

    fn quiet_elapsed(&self, generation: u64) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if self.generation.load(Ordering::Acquire) == generation {
            self.emit_pending();
        }
    }
}

impl<T: Element> Subscriber<T> for DebounceSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if self.upstream.set(upstream) {
            self.upstream.request(u64::MAX);
        }
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *self.pending.lock().unwrap() = Some(item);
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let handle = self.worker.schedule_delayed(
            Box::new(move || this.quiet_elapsed(generation)),
            self.window,
        );
        let stale = self.countdown.lock().unwrap().replace(handle);
        if let Some(stale) = stale {
            stale.cancel();
        }
    }

    fn on_error(&self, error: FlowError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.pending.lock().unwrap().take();
            self.worker.dispose();
            self.gate.error(self.downstream.as_ref(), error);
        }
    }

    fn on_complete(&self) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(countdown) = self.countdown.lock().unwrap().take() {
            countdown.cancel();
        }
        // completion flushes whatever was still waiting out its window
        self.emit_pending();
        if !self.done.swap(true, Ordering::AcqRel) {
            self.worker.dispose();
            self.gate.complete(self.downstream.as_ref());
        }
    }
}

impl<T: Element> Subscription for DebounceSubscriber<T> {
    fn request(&self, n: u64) {
        requests::add(&self.requested, n);
    }

    fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        self.upstream.cancel();
        self.worker.dispose();
    }
}
