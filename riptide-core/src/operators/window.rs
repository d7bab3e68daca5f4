use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::backpressure::{requests, DrainControl, Terminal, TerminalLatch};
use crate::backpressure::SubscriptionSlot;
use crate::channels::LinkedQueue;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

/// Section a flow into consecutive sub-flows
pub trait Window<T>: super::sealed::Sealed {
    /// Emit a new inner flow every `count` items; each inner flow
    /// replays exactly its section. Requesting `n` windows requests
    /// `n * count` items upstream. A window opening without downstream
    /// demand fails the flow.
    fn window(self, count: usize) -> Flow<Flow<T>>;
}

impl<T: Element> Window<T> for Flow<T> {
    fn window(self, count: usize) -> Flow<Flow<T>> {
        assert!(count > 0, "window size must be > 0");
        Flow::new(WindowPublisher {
            upstream: self,
            count,
        })
    }
}

struct WindowPublisher<T> {
    upstream: Flow<T>,
    count: usize,
}

impl<T: Element> Publisher<Flow<T>> for WindowPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Flow<T>>>) {
        let adapter = Arc::new(WindowSubscriber {
            downstream: subscriber.clone(),
            count: self.count as u64,
            filled: AtomicU64::new(0),
            open: Mutex::new(None),
            requested: AtomicU64::new(0),
            upstream: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Upstream::plain(adapter.clone()));
        self.upstream.subscribe(adapter);
    }
}

struct WindowSubscriber<T> {
    downstream: Arc<dyn Subscriber<Flow<T>>>,
    count: u64,
    /// items in the currently open window
    filled: AtomicU64,
    open: Mutex<Option<Arc<WindowState<T>>>>,
    requested: AtomicU64,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
}

impl<T: Element> Subscriber<T> for WindowSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.upstream.set(upstream);
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let window = {
            let mut open = self.open.lock().unwrap();
            let current = open.clone();
            match current {
                Some(window) => window,
                None => {
                    if !requests::consume_one(&self.requested) {
                        drop(open);
                        self.done.store(true, Ordering::Release);
                        self.upstream.cancel();
                        self.downstream.on_error(FlowError::MissingBackpressure);
                        return;
                    }
                    let window = Arc::new(WindowState::new());
                    *open = Some(window.clone());
                    drop(open);
                    self.downstream.on_next(Flow::new(WindowFlowPublisher {
                        state: window.clone(),
                    }));
                    window
                }
            }
        };
        window.push(item);
        let filled = self.filled.fetch_add(1, Ordering::AcqRel) + 1;
        if filled == self.count {
            self.filled.store(0, Ordering::Release);
            self.open.lock().unwrap().take();
            window.finish(Terminal::Complete);
        }
    }

    fn on_error(&self, error: FlowError) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(window) = self.open.lock().unwrap().take() {
            window.finish(Terminal::Errored(error.clone()));
        }
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(window) = self.open.lock().unwrap().take() {
            window.finish(Terminal::Complete);
        }
        self.downstream.on_complete();
    }
}

impl<T: Element> Subscription for WindowSubscriber<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        requests::add(&self.requested, n);
        self.upstream.request(n.saturating_mul(self.count));
    }

    fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        self.upstream.cancel();
    }
}

/// One section: an unbounded staging queue drained by the window's own
/// subscriber.
struct WindowState<T> {
    queue: LinkedQueue<T>,
    ctl: DrainControl,
    latch: TerminalLatch,
    consumer: Mutex<Option<Arc<dyn Subscriber<T>>>>,
    claimed: AtomicBool,
    terminated: AtomicBool,
}

impl<T: Element> WindowState<T> {
    fn new() -> Self {
        WindowState {
            queue: LinkedQueue::new(),
            ctl: DrainControl::new(),
            latch: TerminalLatch::new(),
            consumer: Mutex::new(None),
            claimed: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    fn push(&self, item: T) {
        if !self.ctl.is_cancelled() {
            self.queue.push(item);
            self.drain();
        }
    }

    fn finish(&self, terminal: Terminal) {
        let set = match terminal {
            Terminal::Complete => self.latch.complete(),
            Terminal::Errored(error) => self.latch.error(error),
        };
        if set {
            self.drain();
        }
    }

    fn drain(&self) {
        if !self.ctl.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            let consumer = self.consumer.lock().unwrap().clone();
            if let Some(consumer) = consumer {
                if self.ctl.is_cancelled() {
                    self.queue.clear();
                    return;
                }
                let requested = self.ctl.requested();
                let mut emitted = 0u64;
                while emitted < requested {
                    let done = self.latch.is_set();
                    match self.queue.poll() {
                        Some(item) => {
                            consumer.on_next(item);
                            emitted += 1;
                        }
                        None => {
                            if done {
                                self.terminate(&consumer);
                                return;
                            }
                            break;
                        }
                    }
                }
                if emitted == requested && self.latch.is_set() && self.queue.is_empty() {
                    self.terminate(&consumer);
                    return;
                }
                self.ctl.produced(emitted);
            }
            missed = self.ctl.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn terminate(&self, consumer: &Arc<dyn Subscriber<T>>) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.latch.get() {
            Some(Terminal::Complete) | None => consumer.on_complete(),
            Some(Terminal::Errored(error)) => consumer.on_error(error.clone()),
        }
    }
}

struct WindowFlowPublisher<T> {
    state: Arc<WindowState<T>>,
}

impl<T: Element> Publisher<T> for WindowFlowPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        if self.state.claimed.swap(true, Ordering::AcqRel) {
            subscriber.on_subscribe(Upstream::plain(Arc::new(crate::flow::NoopSubscription)));
            subscriber.on_error(FlowError::Protocol(
                crate::error::ProtocolViolation::DoubleSubscribe,
            ));
            return;
        }
        *self.state.consumer.lock().unwrap() = Some(subscriber.clone());
        subscriber.on_subscribe(Upstream::plain(Arc::new(WindowSubscription {
            state: self.state.clone(),
        })));
        self.state.drain();
    }
}

struct WindowSubscription<T> {
    state: Arc<WindowState<T>>,
}

impl<T: Element> Subscription for WindowSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.state.ctl.request(n);
        self.state.drain();
    }

    fn cancel(&self) {
        self.state.ctl.cancel();
        self.state.drain();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::operators::Reduce;
    use crate::testing::TestSubscriber;

    #[test]
    fn sections_are_consecutive_and_exact() {
        let collected = Arc::new(StdMutex::new(Vec::new()));
        let record = Arc::clone(&collected);
        Flow::range(0, 6).window(2).subscribe_fn(move |window| {
            let record = Arc::clone(&record);
            window.to_vec().subscribe_fn(move |section| {
                record.lock().unwrap().push(section);
            });
        });
        assert_eq!(
            collected.lock().unwrap().clone(),
            vec![vec![0, 1], vec![2, 3], vec![4, 5]]
        );
    }

    #[test]
    fn the_tail_section_may_be_short() {
        let collected = Arc::new(StdMutex::new(Vec::new()));
        let record = Arc::clone(&collected);
        Flow::range(0, 5).window(2).subscribe_fn(move |window| {
            let record = Arc::clone(&record);
            window.to_vec().subscribe_fn(move |section| {
                record.lock().unwrap().push(section);
            });
        });
        assert_eq!(
            collected.lock().unwrap().clone(),
            vec![vec![0, 1], vec![2, 3], vec![4]]
        );
    }

    #[test]
    fn window_demand_scales_upstream_demand() {
        let ts: Arc<TestSubscriber<Flow<i64>>> = TestSubscriber::new(2);
        let publisher = crate::testing::TestPublisher::new();
        publisher.flow().window(3).subscribe(ts.clone());
        assert_eq!(publisher.requested(), 6);
    }
}
