use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::processors::DirectProcessor;
use crate::types::Element;

impl<T: Element + Clone> Flow<T> {
    /// Multicast this flow through a connectable handle: subscribers
    /// attach to the shared stage, and the upstream runs only once
    /// [PublishFlow::connect] (or the refcount/auto-connect wrappers)
    /// says so.
    pub fn publish(self) -> PublishFlow<T> {
        PublishFlow {
            upstream: self,
            processor: DirectProcessor::new(),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// A flow made hot: one upstream subscription fans out to every attached
/// subscriber. See [Flow::publish].
pub struct PublishFlow<T> {
    upstream: Flow<T>,
    processor: DirectProcessor<T>,
    connected: Arc<AtomicBool>,
}

impl<T> Clone for PublishFlow<T> {
    fn clone(&self) -> Self {
        PublishFlow {
            upstream: self.upstream.clone(),
            processor: self.processor.clone(),
            connected: Arc::clone(&self.connected),
        }
    }
}

impl<T: Element + Clone> PublishFlow<T> {
    /// The subscriber-facing view; attaching does not start the
    /// upstream.
    pub fn flow(&self) -> Flow<T> {
        self.processor.flow()
    }

    /// Subscribe the shared stage to the upstream. Only the first call
    /// connects; the returned guard detaches the upstream when asked.
    pub fn connect(&self) -> ConnectionGuard<T> {
        if !self.connected.swap(true, Ordering::AcqRel) {
            self.upstream.subscribe(Arc::new(self.processor.clone()));
        }
        ConnectionGuard {
            processor: self.processor.clone(),
        }
    }

    /// Connect the upstream when the `needed`-th subscriber attaches,
    /// once.
    pub fn auto_connect(self, needed: usize) -> Flow<T> {
        Flow::new(AutoConnectPublisher {
            publish: self,
            needed,
            seen: AtomicUsize::new(0),
        })
    }

    /// Keep the upstream running exactly while subscribers exist:
    /// connect on the first attach, detach on the last release. Each
    /// idle-to-busy transition starts a fresh multicast cycle.
    pub fn ref_count(self) -> Flow<T> {
        Flow::new(RefCountPublisher {
            upstream: self.upstream,
            state: Arc::new(Mutex::new(RefCountState {
                current: None,
                subscribers: 0,
            })),
        })
    }
}

/// Detaches the shared stage from its upstream when asked to.
pub struct ConnectionGuard<T> {
    processor: DirectProcessor<T>,
}

impl<T: Element + Clone> ConnectionGuard<T> {
    pub fn disconnect(&self) {
        self.processor.detach();
    }
}

struct AutoConnectPublisher<T> {
    publish: PublishFlow<T>,
    needed: usize,
    seen: AtomicUsize,
}

impl<T: Element + Clone> Publisher<T> for AutoConnectPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.publish.flow().subscribe(subscriber);
        if self.seen.fetch_add(1, Ordering::AcqRel) + 1 == self.needed {
            self.publish.connect();
        }
    }
}

struct RefCountState<T> {
    current: Option<DirectProcessor<T>>,
    subscribers: usize,
}

struct RefCountPublisher<T> {
    upstream: Flow<T>,
    state: Arc<Mutex<RefCountState<T>>>,
}

impl<T: Element + Clone> Publisher<T> for RefCountPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let (processor, connect) = {
            let mut state = self.state.lock().unwrap();
            if state.current.is_none() {
                state.current = Some(DirectProcessor::new());
                state.subscribers = 0;
            }
            state.subscribers += 1;
            let processor = state
                .current
                .clone()
                .unwrap_or_else(DirectProcessor::new);
            (processor, state.subscribers == 1)
        };
        let gate = Arc::new(ReleaseGate {
            state: Arc::clone(&self.state),
            cycle: processor.clone(),
            released: AtomicBool::new(false),
        });
        processor.flow().subscribe(Arc::new(RefCountSubscriber {
            downstream: subscriber,
            gate,
        }));
        if connect {
            self.upstream.subscribe(Arc::new(processor));
        }
    }
}

/// One subscriber's hold on the shared cycle; releasing the last hold
/// detaches the upstream.
struct ReleaseGate<T> {
    state: Arc<Mutex<RefCountState<T>>>,
    cycle: DirectProcessor<T>,
    released: AtomicBool,
}

impl<T: Element + Clone> ReleaseGate<T> {
    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let same_cycle = state
            .current
            .as_ref()
            .map(|current| current.same(&self.cycle))
            .unwrap_or(false);
        if !same_cycle {
            return;
        }
        state.subscribers -= 1;
        if state.subscribers == 0 {
            if let Some(current) = state.current.take() {
                drop(state);
                current.detach();
            }
        }
    }
}

struct RefCountSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    gate: Arc<ReleaseGate<T>>,
}

impl<T: Element + Clone> Subscriber<T> for RefCountSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.downstream
            .on_subscribe(Upstream::plain(Arc::new(GatedSubscription {
                inner: upstream,
                gate: Arc::clone(&self.gate),
            })));
    }

    fn on_next(&self, item: T) {
        self.downstream.on_next(item);
    }

    fn on_error(&self, error: FlowError) {
        self.gate.release();
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        self.gate.release();
        self.downstream.on_complete();
    }
}

struct GatedSubscription<T> {
    inner: Upstream<T>,
    gate: Arc<ReleaseGate<T>>,
}

impl<T: Element + Clone> Subscription for GatedSubscription<T> {
    fn request(&self, n: u64) {
        self.inner.request(n);
    }

    fn cancel(&self) {
        self.gate.release();
        self.inner.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestPublisher, TestSubscriber};

    #[test]
    fn nothing_runs_before_connect() {
        let source: TestPublisher<i32> = TestPublisher::new();
        let published = source.flow().publish();
        let ts = TestSubscriber::new(u64::MAX);
        published.flow().subscribe(ts.clone());
        assert!(!source.has_subscriber());
        published.connect();
        assert!(source.has_subscriber());
        source.emit(1);
        ts.assert_values(&[1]);
    }

    #[test]
    fn connect_happens_once() {
        let source: TestPublisher<i32> = TestPublisher::new();
        let published = source.flow().publish();
        published.connect();
        published.connect();
        source.emit(1);
        // the second connect must not have resubscribed the source
        assert_eq!(source.requested(), u64::MAX);
    }

    #[test]
    fn auto_connect_waits_for_the_kth_subscriber() {
        let source: TestPublisher<i32> = TestPublisher::new();
        let auto = source.flow().publish().auto_connect(2);
        let first = TestSubscriber::new(u64::MAX);
        auto.subscribe(first.clone());
        assert!(!source.has_subscriber());
        let second = TestSubscriber::new(u64::MAX);
        auto.subscribe(second.clone());
        assert!(source.has_subscriber());
        source.emit(5);
        first.assert_values(&[5]);
        second.assert_values(&[5]);
    }

    #[test]
    fn ref_count_connects_on_first_and_detaches_on_last() {
        let source: TestPublisher<i32> = TestPublisher::new();
        let shared = source.flow().publish().ref_count();
        let first = TestSubscriber::new(u64::MAX);
        shared.subscribe(first.clone());
        assert!(source.has_subscriber());
        let second = TestSubscriber::new(u64::MAX);
        shared.subscribe(second.clone());
        source.emit(1);
        first.cancel();
        source.emit(2);
        second.cancel();
        assert!(source.is_cancelled());
        first.assert_values(&[1]);
        second.assert_values(&[1, 2]);
    }
}
