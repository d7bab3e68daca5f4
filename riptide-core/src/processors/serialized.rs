use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backpressure::{Terminal, TerminalLatch};
use crate::channels::LinkedQueue;
use crate::error::FlowError;
use crate::flow::{Subscriber, Upstream};
use crate::types::Element;

/// Funnels signal calls racing in from several threads into the strictly
/// serialized sequence the subscriber contract demands. Items are staged
/// in an unbounded queue; whoever wins the drain delivers them.
pub struct SerializedSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    queue: LinkedQueue<T>,
    wip: AtomicUsize,
    latch: TerminalLatch,
    terminated: AtomicBool,
}

impl<T: Element> SerializedSubscriber<T> {
    pub fn new(downstream: Arc<dyn Subscriber<T>>) -> Self {
        SerializedSubscriber {
            downstream,
            queue: LinkedQueue::new(),
            wip: AtomicUsize::new(0),
            latch: TerminalLatch::new(),
            terminated: AtomicBool::new(false),
        }
    }

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            loop {
                let done = self.latch.is_set();
                match self.queue.poll() {
                    Some(item) => self.downstream.on_next(item),
                    None => {
                        if done && !self.terminated.swap(true, Ordering::AcqRel) {
                            match self.latch.get() {
                                Some(Terminal::Complete) | None => self.downstream.on_complete(),
                                Some(Terminal::Errored(error)) => {
                                    self.downstream.on_error(error.clone());
                                }
                            }
                        }
                        break;
                    }
                }
            }
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                return;
            }
        }
    }
}

impl<T: Element> Subscriber<T> for SerializedSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.downstream.on_subscribe(upstream);
    }

    fn on_next(&self, item: T) {
        if self.latch.is_set() {
            return;
        }
        self.queue.push(item);
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
