//! The cold push adapter: bridges an imperative emitter callback into a
//! backpressured flow under one of the overflow policies.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::backpressure::{DrainControl, Terminal, TerminalLatch};
use crate::channels::LinkedQueue;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::types::{Element, Overflow};

impl<T: Element> Flow<T> {
    /// Run `emitter` for each subscriber with a handle that pushes items
    /// without seeing backpressure; `overflow` decides what happens when
    /// the push rate outruns downstream demand.
    ///
    /// The emitter is invoked on the subscribing thread; move it to a
    /// thread or worker of your own for asynchronous production.
    pub fn create(
        emitter: impl Fn(FlowEmitter<T>) + Send + Sync + 'static,
        overflow: Overflow,
    ) -> Flow<T> {
        Flow::new(CreatePublisher { emitter, overflow })
    }
}

struct CreatePublisher<F> {
    emitter: F,
    overflow: Overflow,
}

impl<T, F> Publisher<T> for CreatePublisher<F>
where
    T: Element,
    F: Fn(FlowEmitter<T>) + Send + Sync,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let buffer = match self.overflow {
            Overflow::Buffer => BufferKind::All(LinkedQueue::new()),
            Overflow::Latest => BufferKind::Latest(Mutex::new(None)),
            Overflow::Drop => BufferKind::Direct { error_on_overflow: false },
            Overflow::Error => BufferKind::Direct { error_on_overflow: true },
        };
        let core = Arc::new(EmitterCore {
            downstream: subscriber.clone(),
            ctl: DrainControl::new(),
            latch: TerminalLatch::new(),
            terminated: AtomicBool::new(false),
            buffer,
        });
        subscriber.on_subscribe(Upstream::plain(core.clone()));
        (self.emitter)(FlowEmitter { core });
    }
}

enum BufferKind<T> {
    All(LinkedQueue<T>),
    Latest(Mutex<Option<T>>),
    Direct { error_on_overflow: bool },
}

struct EmitterCore<T> {
    downstream: Arc<dyn Subscriber<T>>,
    ctl: DrainControl,
    latch: TerminalLatch,
    /// whether the terminal has been handed downstream
    terminated: AtomicBool,
    buffer: BufferKind<T>,
}

impl<T: Element> EmitterCore<T> {
    fn push(&self, item: T) {
        if self.ctl.is_cancelled() || self.latch.is_set() {
            return;
        }
        match &self.buffer {
            BufferKind::All(queue) => {
                queue.push(item);
                self.drain();
            }
            BufferKind::Latest(slot) => {
                *slot.lock().unwrap() = Some(item);
                self.drain();
            }
            BufferKind::Direct { error_on_overflow } => {
                if self.ctl.requested() > 0 {
                    self.downstream.on_next(item);
                    self.ctl.produced(1);
                } else if *error_on_overflow {
                    self.terminate(Terminal::Errored(FlowError::MissingBackpressure));
                    self.ctl.cancel();
                }
            }
        }
    }

    fn finish(&self, terminal: Terminal) {
        match terminal {
            Terminal::Complete => {
                if !self.latch.complete() {
                    return;
                }
            }
            Terminal::Errored(error) => {
                if !self.latch.error(error) {
                    return;
                }
            }
        }
        match &self.buffer {
            BufferKind::Direct { .. } => {
                if let Some(terminal) = self.latch.get() {
                    self.terminate(terminal.clone());
                }
            }
            _ => self.drain(),
        }
    }

    /// Deliver the terminal at most once.
    fn terminate(&self, terminal: Terminal) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        match terminal {
            Terminal::Complete => self.downstream.on_complete(),
            Terminal::Errored(error) => self.downstream.on_error(error),
        }
    }

    fn poll_buffer(&self) -> Option<T> {
        match &self.buffer {
            BufferKind::All(queue) => queue.poll(),
            BufferKind::Latest(slot) => slot.lock().unwrap().take(),
            BufferKind::Direct { .. } => None,
        }
    }

    fn buffer_empty(&self) -> bool {
        match &self.buffer {
            BufferKind::All(queue) => queue.is_empty(),
            BufferKind::Latest(slot) => slot.lock().unwrap().is_none(),
            BufferKind::Direct { .. } => true,
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
                    self.clear();
                    break;
                }
                let done = self.latch.is_set();
                match self.poll_buffer() {
                    Some(item) => {
                        self.downstream.on_next(item);
                        emitted += 1;
                    }
                    None => {
                        if done {
                            if let Some(terminal) = self.latch.get() {
                                self.terminate(terminal.clone());
                            }
                        }
                        break;
                    }
                }
            }
            if emitted == requested
                && !self.ctl.is_cancelled()
                && self.latch.is_set()
                && self.buffer_empty()
            {
                if let Some(terminal) = self.latch.get() {
                    self.terminate(terminal.clone());
                }
            }
            self.ctl.produced(emitted);
            missed = self.ctl.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn clear(&self) {
        while self.poll_buffer().is_some() {}
    }
}

impl<T: Element> Subscription for EmitterCore<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.ctl.request(n);
        self.drain();
    }

    fn cancel(&self) {
        self.ctl.cancel();
        self.drain();
    }
}

/// Handle the emitter callback pushes through; see [Flow::create].
pub struct FlowEmitter<T> {
    core: Arc<EmitterCore<T>>,
}

impl<T: Element> FlowEmitter<T> {
    /// Push an item; the overflow policy decides its fate when there is
    /// no outstanding demand.
    pub fn next(&self, item: T) {
        self.core.push(item);
    }

    pub fn complete(&self) {
        self.core.finish(Terminal::Complete);
    }

    pub fn error(&self, error: FlowError) {
        self.core.finish(Terminal::Errored(error));
    }

    /// True once the downstream cancelled; pushing is pointless then.
    pub fn is_cancelled(&self) -> bool {
        self.core.ctl.is_cancelled()
    }

    /// Currently outstanding downstream demand.
    pub fn requested(&self) -> u64 {
        self.core.ctl.requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSubscriber;

    #[test]
    fn buffer_policy_holds_items_for_late_demand() {
        let flow = Flow::create(
            |emitter| {
                for i in 0..100 {
                    emitter.next(i);
                }
                emitter.complete();
            },
            Overflow::Buffer,
        );
        let ts = TestSubscriber::new(0);
        flow.subscribe(ts.clone());
        ts.assert_values(&[]);
        ts.request(u64::MAX);
        assert_eq!(ts.value_count(), 100);
        ts.assert_complete();
    }

    #[test]
    fn latest_policy_keeps_only_the_newest() {
        let flow = Flow::create(
            |emitter| {
                for i in 0..10 {
                    emitter.next(i);
                }
                emitter.complete();
            },
            Overflow::Latest,
        );
        let ts = TestSubscriber::new(0);
        flow.subscribe(ts.clone());
        ts.request(10);
        ts.assert_values(&[9]);
        ts.assert_complete();
    }

    #[test]
    fn drop_policy_discards_unrequested_items() {
        let flow = Flow::create(
            |emitter| {
                for i in 0..1000 {
                    emitter.next(i);
                }
                emitter.complete();
            },
            Overflow::Drop,
        );
        let ts = TestSubscriber::new(0);
        flow.subscribe(ts.clone());
        assert_eq!(ts.value_count(), 0);
        ts.assert_complete();
    }

    #[test]
    fn error_policy_signals_missing_backpressure() {
        let flow = Flow::create(
            |emitter| {
                emitter.next(1);
            },
            Overflow::Error,
        );
        let ts = TestSubscriber::new(0);
        flow.subscribe(ts.clone());
        ts.assert_error(&FlowError::MissingBackpressure);
    }

    #[test]
    fn emitter_sees_cancellation() {
        let flow = Flow::create(
            |emitter: FlowEmitter<i32>| {
                assert!(!emitter.is_cancelled());
            },
            Overflow::Buffer,
        );
        let ts = TestSubscriber::new(0);
        flow.subscribe(ts.clone());
    }
}
