use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::backpressure::{requests, DrainControl, SubscriptionSlot, Terminal, TerminalLatch};
use crate::channels::LinkedQueue;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

/// Overflow policies for upstreams that cannot slow down
pub trait OnBackpressure<T>: super::sealed::Sealed {
    /// Fail with [FlowError::MissingBackpressure] the moment an item
    /// arrives without downstream demand.
    fn on_backpressure_error(self) -> Flow<T>;

    /// Silently drop items arriving without downstream demand.
    fn on_backpressure_drop(self) -> Flow<T>;

    /// Like [OnBackpressure::on_backpressure_drop], invoking `dropped`
    /// for every discarded item.
    fn on_backpressure_drop_with(
        self,
        dropped: impl Fn(T) + Send + Sync + 'static,
    ) -> Flow<T>;

    /// Keep only the most recent undelivered item.
    fn on_backpressure_latest(self) -> Flow<T>;

    /// Buffer every undelivered item in an unbounded queue — the only
    /// policy that can exhaust memory.
    fn on_backpressure_buffer(self) -> Flow<T>;
}

impl<T: Element> OnBackpressure<T> for Flow<T> {
    fn on_backpressure_error(self) -> Flow<T> {
        Flow::new(DirectPolicyPublisher {
            upstream: self,
            dropped: None,
            error_on_overflow: true,
        })
    }

    fn on_backpressure_drop(self) -> Flow<T> {
        Flow::new(DirectPolicyPublisher {
            upstream: self,
            dropped: None,
            error_on_overflow: false,
        })
    }

    fn on_backpressure_drop_with(
        self,
        dropped: impl Fn(T) + Send + Sync + 'static,
    ) -> Flow<T> {
        Flow::new(DirectPolicyPublisher {
            upstream: self,
            dropped: Some(Arc::new(dropped)),
            error_on_overflow: false,
        })
    }

    fn on_backpressure_latest(self) -> Flow<T> {
        Flow::new(QueuedPolicyPublisher {
            upstream: self,
            buffer_all: false,
        })
    }

    fn on_backpressure_buffer(self) -> Flow<T> {
        Flow::new(QueuedPolicyPublisher {
            upstream: self,
            buffer_all: true,
        })
    }
}

struct DirectPolicyPublisher<T> {
    upstream: Flow<T>,
    dropped: Option<Arc<dyn Fn(T) + Send + Sync>>,
    error_on_overflow: bool,
}

impl<T: Element> Publisher<T> for DirectPolicyPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let adapter = Arc::new(DirectPolicySubscriber {
            downstream: subscriber.clone(),
            dropped: self.dropped.clone(),
            error_on_overflow: self.error_on_overflow,
            requested: AtomicU64::new(0),
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

struct DirectPolicySubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    dropped: Option<Arc<dyn Fn(T) + Send + Sync>>,
    error_on_overflow: bool,
    requested: AtomicU64,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T: Element> Subscriber<T> for DirectPolicySubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if self.upstream.set(upstream) {
            self.upstream.request(u64::MAX);
        }
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if requests::consume_one(&self.requested) {
            self.downstream.on_next(item);
        } else if self.error_on_overflow {
            self.done.store(true, Ordering::Release);
            self.upstream.cancel();
            self.downstream.on_error(FlowError::MissingBackpressure);
        } else if let Some(dropped) = &self.dropped {
            dropped(item);
        }
    }

    fn on_error(&self, error: FlowError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.downstream.on_error(error);
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.downstream.on_complete();
        }
    }
}

impl<T: Element> Subscription for DirectPolicySubscriber<T> {
    fn request(&self, n: u64) {
        requests::add(&self.requested, n);
    }

    fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        self.upstream.cancel();
    }
}

struct QueuedPolicyPublisher<T> {
    upstream: Flow<T>,
    buffer_all: bool,
}

impl<T: Element> Publisher<T> for QueuedPolicyPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let store = if self.buffer_all {
            PolicyStore::All(LinkedQueue::new())
        } else {
            PolicyStore::Latest(Mutex::new(None))
        };
        let adapter = Arc::new(QueuedPolicySubscriber {
            downstream: subscriber.clone(),
            store,
            ctl: DrainControl::new(),
            latch: TerminalLatch::new(),
            terminated: AtomicBool::new(false),
            upstream: SubscriptionSlot::new(),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

enum PolicyStore<T> {
    All(LinkedQueue<T>),
    Latest(Mutex<Option<T>>),
}

struct QueuedPolicySubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    store: PolicyStore<T>,
    ctl: DrainControl,
    latch: TerminalLatch,
    terminated: AtomicBool,
    upstream: SubscriptionSlot<T>,
}

impl<T: Element> QueuedPolicySubscriber<T> {
    fn store_item(&self, item: T) {
        match &self.store {
            PolicyStore::All(queue) => queue.push(item),
            PolicyStore::Latest(slot) => {
                *slot.lock().unwrap() = Some(item);
            }
        }
    }

    fn poll_store(&self) -> Option<T> {
        match &self.store {
            PolicyStore::All(queue) => queue.poll(),
            PolicyStore::Latest(slot) => slot.lock().unwrap().take(),
        }
    }

    fn store_empty(&self) -> bool {
        match &self.store {
            PolicyStore::All(queue) => queue.is_empty(),
            PolicyStore::Latest(slot) => slot.lock().unwrap().is_none(),
        }
    }

    fn terminate(&self, terminal: Terminal) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        match terminal {
            Terminal::Complete => self.downstream.on_complete(),
            Terminal::Errored(error) => self.downstream.on_error(error),
        }
    }

    fn drain(&self) {
        if !self.ctl.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            let requested = self.ctl.requested();
            let mut emitted = 0u64;
            while emitted < requested {
                if self.ctl.is_cancelled() {
                    while self.poll_store().is_some() {}
                    return;
                }
                let done = self.latch.is_set();
                match self.poll_store() {
                    Some(item) => {
                        self.downstream.on_next(item);
                        emitted += 1;
                    }
                    None => {
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
            if emitted == requested
                && !self.ctl.is_cancelled()
                && self.latch.is_set()
                && self.store_empty()
            {
                if let Some(terminal) = self.latch.get() {
                    self.terminate(terminal.clone());
                }
                return;
            }
            self.ctl.produced(emitted);
            missed = self.ctl.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }
}

impl<T: Element> Subscriber<T> for QueuedPolicySubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if self.upstream.set(upstream) {
            self.upstream.request(u64::MAX);
        }
    }

    fn on_next(&self, item: T) {
        if self.latch.is_set() || self.ctl.is_cancelled() {
            return;
        }
        self.store_item(item);
        self.drain();
    }

    fn on_error(&self, error: FlowError) {
        if self.latch.error(error) {
            self.drain();
        }
    }

    fn on_complete(&self) {
        if self.latch.complete() {
            self.drain();
        }
    }
}

impl<T: Element> Subscription for QueuedPolicySubscriber<T> {
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
