use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::backpressure::{DrainControl, SubscriptionSlot, Terminal, TerminalLatch};
use crate::channels::RingQueue;
use crate::error::FlowError;
use crate::flow::{
    Flow, FusionMode, Publisher, QueueSubscription, Subscriber, Subscription, Upstream,
};
use crate::hooks;
use crate::scheduler::{Scheduler, Worker};
use crate::types::Element;

const MODE_NONE: u8 = 0;
const MODE_SYNC: u8 = 1;

/// Move item delivery onto a scheduler
pub trait ObserveOn<T>: super::sealed::Sealed {
    /// Re-emit every signal on a worker of `scheduler`. Items cross the
    /// boundary through a bounded ring prefetched with the process-wide
    /// buffer size and replenished in 75% batches; ordering is preserved
    /// by the worker's FIFO guarantee.
    fn observe_on(self, scheduler: Arc<dyn Scheduler>) -> Flow<T>;

    /// [ObserveOn::observe_on] with an explicit prefetch amount.
    fn observe_on_with(self, scheduler: Arc<dyn Scheduler>, prefetch: usize) -> Flow<T>;
}

impl<T: Element> ObserveOn<T> for Flow<T> {
    fn observe_on(self, scheduler: Arc<dyn Scheduler>) -> Flow<T> {
        let prefetch = hooks::buffer_size();
        self.observe_on_with(scheduler, prefetch)
    }

    fn observe_on_with(self, scheduler: Arc<dyn Scheduler>, prefetch: usize) -> Flow<T> {
        assert!(prefetch > 0, "prefetch must be > 0");
        Flow::new(ObserveOnPublisher {
            upstream: self,
            scheduler,
            prefetch,
        })
    }
}

struct ObserveOnPublisher<T> {
    upstream: Flow<T>,
    scheduler: Arc<dyn Scheduler>,
    prefetch: usize,
}

impl<T: Element> Publisher<T> for ObserveOnPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let adapter = Arc::new_cyclic(|this: &Weak<ObserveOnSubscriber<T>>| {
            ObserveOnSubscriber {
                this: this.clone(),
                downstream: subscriber.clone(),
                worker: self.scheduler.worker(),
                prefetch: self.prefetch,
                limit: self.prefetch - (self.prefetch >> 2),
                queue: RingQueue::new(self.prefetch),
                fused: Mutex::new(None),
                mode: AtomicU8::new(MODE_NONE),
                ctl: DrainControl::new(),
                latch: TerminalLatch::new(),
                upstream: SubscriptionSlot::new(),
                consumed: AtomicU64::new(0),
                terminated: AtomicBool::new(false),
            }
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

struct ObserveOnSubscriber<T> {
    this: Weak<ObserveOnSubscriber<T>>,
    downstream: Arc<dyn Subscriber<T>>,
    worker: Arc<dyn Worker>,
    prefetch: usize,
    /// replenishment threshold, 75% of the prefetch window
    limit: usize,
    queue: RingQueue<T>,
    fused: Mutex<Option<Arc<dyn QueueSubscription<T>>>>,
    mode: AtomicU8,
    ctl: DrainControl,
    latch: TerminalLatch,
    upstream: SubscriptionSlot<T>,
    /// items taken from upstream since the last replenishment; only the
    /// drain winner touches this
    consumed: AtomicU64,
    terminated: AtomicBool,
}

impl<T: Element> ObserveOnSubscriber<T> {
    /// Hop onto the worker if no drain is active or pending.
    fn trigger(&self) {
        if self.ctl.enter() {
            if let Some(this) = self.this.upgrade() {
                self.worker.schedule(Box::new(move || this.run_drain()));
            }
        }
    }

    fn run_drain(self: Arc<Self>) {
        let mut missed = 1;
        loop {
            // the mode may flip to SYNC between passes when the fusion
            // handshake loses the race against an early request
            let sync_mode = self.mode.load(Ordering::Acquire) == MODE_SYNC;
            let requested = self.ctl.requested();
            let mut emitted = 0u64;
            while emitted < requested {
                if self.ctl.is_cancelled() {
                    self.queue.clear();
                    return;
                }
                let done = self.latch.is_set();
                match self.poll_source() {
                    Some(item) => {
                        self.downstream.on_next(item);
                        emitted += 1;
                        if !sync_mode {
                            self.replenish(1);
                        }
                    }
                    None => {
                        if sync_mode {
                            // a drained SYNC source is a finished source
                            self.terminate(Terminal::Complete);
                            return;
                        }
                        if done {
                            if let Some(terminal) = self.latch.get() {
                                self.terminate(terminal.clone());
                            }
                            return;
                        }
                        break;
                    }
                }
            }
            if emitted == requested && !self.ctl.is_cancelled() {
                if sync_mode {
                    if self.source_empty() {
                        self.terminate(Terminal::Complete);
                        return;
                    }
                } else if self.latch.is_set() && self.source_empty() {
                    if let Some(terminal) = self.latch.get() {
                        self.terminate(terminal.clone());
                    }
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

    fn poll_source(&self) -> Option<T> {
        if self.mode.load(Ordering::Acquire) == MODE_SYNC {
            self.fused.lock().unwrap().as_ref().and_then(|q| q.poll())
        } else {
            self.queue.poll()
        }
    }

    fn source_empty(&self) -> bool {
        if self.mode.load(Ordering::Acquire) == MODE_SYNC {
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

    /// Batch upstream replenishment once 75% of the window is consumed.
    fn replenish(&self, n: u64) {
        let consumed = self.consumed.load(Ordering::Relaxed) + n;
        if consumed >= self.limit as u64 {
            self.consumed.store(0, Ordering::Relaxed);
            self.upstream.request(consumed);
        } else {
            self.consumed.store(consumed, Ordering::Relaxed);
        }
    }

    fn terminate(&self, terminal: Terminal) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        match terminal {
            Terminal::Complete => self.downstream.on_complete(),
            Terminal::Errored(error) => {
                self.queue.clear();
                self.downstream.on_error(error);
            }
        }
        self.worker.dispose();
    }
}

impl<T: Element> Subscriber<T> for ObserveOnSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if upstream.try_fuse(FusionMode::Sync) == FusionMode::Sync {
            if let Some(queue) = upstream.as_queue() {
                *self.fused.lock().unwrap() = Some(Arc::clone(queue));
            }
            self.mode.store(MODE_SYNC, Ordering::Release);
            self.upstream.set(upstream);
            // a SYNC source is polled; it never sees requests. Demand
            // may already be waiting, so kick the drain.
            self.trigger();
            return;
        }
        if self.upstream.set(upstream) {
            self.upstream.request(self.prefetch as u64);
        }
    }

    fn on_next(&self, item: T) {
        if self.latch.is_set() || self.ctl.is_cancelled() {
            return;
        }
        if self.queue.offer(item).is_err() {
            // the prefetch contract was broken upstream
            self.upstream.cancel();
            self.latch.error(FlowError::MissingBackpressure);
        }
        self.trigger();
    }

    fn on_error(&self, error: FlowError) {
        if self.latch.error(error) {
            self.trigger();
        }
    }

    fn on_complete(&self) {
        if self.latch.complete() {
            self.trigger();
        }
    }
}

impl<T: Element> Subscription for ObserveOnSubscriber<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.ctl.request(n);
        self.trigger();
    }

    fn cancel(&self) {
        if self.ctl.is_cancelled() {
            return;
        }
        self.ctl.cancel();
        self.upstream.cancel();
        if let Some(queue) = self.fused.lock().unwrap().as_ref() {
            queue.clear();
        }
        self.worker.dispose();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::operators::Map;
    use crate::scheduler::SingleScheduler;
    use crate::testing::{TestPublisher, TestSubscriber};

    fn single() -> Arc<dyn Scheduler> {
        Arc::new(SingleScheduler::new())
    }

    #[test]
    fn delivers_everything_in_order() {
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 1000).observe_on(single()).subscribe(ts.clone());
        assert!(ts.await_terminal(Duration::from_secs(5)));
        let expected: Vec<i64> = (0..1000).collect();
        ts.assert_values(&expected);
        ts.assert_complete();
    }

    #[test]
    fn delivery_happens_on_the_worker_thread() {
        let caller = thread::current().id();
        let ts = TestSubscriber::new(u64::MAX);
        Flow::range(0, 10)
            .observe_on(single())
            .map(move |x| {
                assert_ne!(thread::current().id(), caller);
                x
            })
            .subscribe(ts.clone());
        assert!(ts.await_terminal(Duration::from_secs(5)));
        assert_eq!(ts.value_count(), 10);
    }

    #[test]
    fn respects_downstream_demand() {
        let ts = TestSubscriber::new(3);
        Flow::range(0, 100).observe_on(single()).subscribe(ts.clone());
        assert!(ts.await_count(3, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ts.value_count(), 3);
        ts.request(2);
        assert!(ts.await_count(5, Duration::from_secs(5)));
        assert_eq!(ts.value_count(), 5);
    }

    #[test]
    fn prefetches_and_replenishes_in_batches() {
        let publisher = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher
            .flow()
            .observe_on_with(single(), 8)
            .subscribe(ts.clone());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(publisher.requested(), 8);
        for i in 0..6 {
            publisher.emit(i);
        }
        assert!(ts.await_count(6, Duration::from_secs(5)));
        // 6 consumed ≥ 75% of 8: one batch replenishment of exactly 6
        thread::sleep(Duration::from_millis(50));
        assert_eq!(publisher.requested(), 14);
    }

    #[test]
    fn upstream_error_ends_the_flow() {
        let publisher = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        publisher.flow().observe_on(single()).subscribe(ts.clone());
        publisher.emit(1);
        publisher.error(FlowError::MissingBackpressure);
        assert!(ts.await_terminal(Duration::from_secs(5)));
    }
}
