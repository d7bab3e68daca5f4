use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;

use crate::backpressure::{requests, DrainControl, SubscriptionSlot, Terminal, TerminalLatch};
use crate::channels::LinkedQueue;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Subscription, Upstream};
use crate::hooks;
use crate::types::Element;

/// Split a flow into per-key flows
pub trait GroupBy<T>: super::sealed::Sealed {
    /// Route every item into the [GroupedFlow] of its key, creating
    /// groups on first sight in arrival order. Each new group consumes
    /// one unit of downstream demand; a new key arriving without demand
    /// fails the flow. The upstream stalls once unconsumed groups have
    /// eaten the prefetch window.
    fn group_by<K>(self, key_of: impl Fn(&T) -> K + Send + Sync + 'static) -> Flow<GroupedFlow<K, T>>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static;
}

impl<T: Element> GroupBy<T> for Flow<T> {
    fn group_by<K>(
        self,
        key_of: impl Fn(&T) -> K + Send + Sync + 'static,
    ) -> Flow<GroupedFlow<K, T>>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
    {
        Flow::new(GroupByPublisher {
            upstream: self,
            key_of: Arc::new(key_of),
        })
    }
}

/// A per-key section of a grouped flow. The group is itself a flow and
/// accepts exactly one subscriber.
pub struct GroupedFlow<K, T> {
    key: K,
    flow: Flow<T>,
}

impl<K: Clone, T> Clone for GroupedFlow<K, T> {
    fn clone(&self) -> Self {
        GroupedFlow {
            key: self.key.clone(),
            flow: self.flow.clone(),
        }
    }
}

impl<K, T: Element> GroupedFlow<K, T> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn flow(&self) -> Flow<T> {
        self.flow.clone()
    }
}

struct GroupByPublisher<T, K> {
    upstream: Flow<T>,
    key_of: Arc<dyn Fn(&T) -> K + Send + Sync>,
}

impl<T, K> Publisher<GroupedFlow<K, T>> for GroupByPublisher<T, K>
where
    T: Element,
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<GroupedFlow<K, T>>>) {
        let coordinator = Arc::new_cyclic(|this: &Weak<GroupByCoordinator<T, K>>| {
            GroupByCoordinator {
                this: this.clone(),
                downstream: subscriber.clone(),
                key_of: Arc::clone(&self.key_of),
                groups: Mutex::new(IndexMap::new()),
                requested: AtomicU64::new(0),
                prefetch: hooks::buffer_size() as u64,
                // the outer subscriber counts as one liveness holder
                live: AtomicUsize::new(1),
                upstream: SubscriptionSlot::new(),
                done: AtomicBool::new(false),
                outer_cancelled: AtomicBool::new(false),
            }
        });
        subscriber.on_subscribe(Upstream::plain(coordinator.clone()));
        self.upstream.subscribe(coordinator);
    }
}

trait GroupParent: Send + Sync {
    /// one item left a group towards its consumer
    fn item_settled(&self);
    /// a group terminated or lost its consumer
    fn group_retired(&self);
}

struct GroupByCoordinator<T, K> {
    this: Weak<GroupByCoordinator<T, K>>,
    downstream: Arc<dyn Subscriber<GroupedFlow<K, T>>>,
    key_of: Arc<dyn Fn(&T) -> K + Send + Sync>,
    groups: Mutex<IndexMap<K, Arc<GroupState<T>>>>,
    requested: AtomicU64,
    prefetch: u64,
    /// outer subscriber + live groups; the upstream is cancelled when
    /// the last holder goes away
    live: AtomicUsize,
    upstream: SubscriptionSlot<T>,
    done: AtomicBool,
    /// the outer subscriber left; no new groups, but open groups keep
    /// receiving
    outer_cancelled: AtomicBool,
}

impl<T, K> GroupByCoordinator<T, K>
where
    T: Element,
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn retire(&self) {
        if self.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.upstream.cancel();
        }
    }
}

impl<T, K> Subscriber<T> for GroupByCoordinator<T, K>
where
    T: Element,
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if self.upstream.set(upstream) {
            self.upstream.request(self.prefetch);
        }
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let key = (self.key_of)(&item);
        if self.outer_cancelled.load(Ordering::Acquire)
            && !self.groups.lock().unwrap().contains_key(&key)
        {
            // nobody is left to receive a new group
            self.upstream.request(1);
            return;
        }
        let (group, fresh) = {
            let mut groups = self.groups.lock().unwrap();
            let existing = groups.get(&key).cloned();
            match existing {
                Some(group) => (group, false),
                None => {
                    let Some(this) = self.this.upgrade() else {
                        return;
                    };
                    let group = Arc::new(GroupState {
                        parent: this,
                        queue: LinkedQueue::new(),
                        ctl: DrainControl::new(),
                        latch: TerminalLatch::new(),
                        consumer: Mutex::new(None),
                        claimed: AtomicBool::new(false),
                        terminated: AtomicBool::new(false),
                    });
                    groups.insert(key.clone(), group.clone());
                    (group, true)
                }
            }
        };
        if fresh {
            if !requests::consume_one(&self.requested) {
                self.done.store(true, Ordering::Release);
                self.upstream.cancel();
                self.downstream.on_error(FlowError::MissingBackpressure);
                return;
            }
            self.live.fetch_add(1, Ordering::AcqRel);
            let grouped = GroupedFlow {
                key,
                flow: Flow::new(GroupPublisher {
                    state: group.clone(),
                }),
            };
            self.downstream.on_next(grouped);
        }
        group.deliver(item);
    }

    fn on_error(&self, error: FlowError) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let groups: Vec<Arc<GroupState<T>>> =
            self.groups.lock().unwrap().drain(..).map(|(_, g)| g).collect();
        for group in groups {
            group.finish(Terminal::Errored(error.clone()));
        }
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let groups: Vec<Arc<GroupState<T>>> =
            self.groups.lock().unwrap().drain(..).map(|(_, g)| g).collect();
        for group in groups {
            group.finish(Terminal::Complete);
        }
        self.downstream.on_complete();
    }
}

impl<T, K> Subscription for GroupByCoordinator<T, K>
where
    T: Element,
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        requests::add(&self.requested, n);
    }

    fn cancel(&self) {
        if !self.outer_cancelled.swap(true, Ordering::AcqRel) {
            // open groups keep running; the upstream dies with the last
            self.retire();
        }
    }
}

impl<T, K> GroupParent for GroupByCoordinator<T, K>
where
    T: Element,
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn item_settled(&self) {
        self.upstream.request(1);
    }

    fn group_retired(&self) {
        self.retire();
    }
}

struct GroupState<T> {
    parent: Arc<dyn GroupParent>,
    queue: LinkedQueue<T>,
    ctl: DrainControl,
    latch: TerminalLatch,
    consumer: Mutex<Option<Arc<dyn Subscriber<T>>>>,
    claimed: AtomicBool,
    terminated: AtomicBool,
}

impl<T: Element> GroupState<T> {
    fn deliver(&self, item: T) {
        if self.ctl.is_cancelled() {
            // abandoned group: keep the pipeline moving
            self.parent.item_settled();
            return;
        }
        self.queue.push(item);
        self.drain();
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
                            self.parent.item_settled();
                        }
                        None => {
                            if done {
                                self.terminate(&consumer);
                                return;
                            }
                            break;
                        }
                    }
                    if self.ctl.is_cancelled() {
                        self.queue.clear();
                        return;
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
        self.parent.group_retired();
    }
}

struct GroupPublisher<T> {
    state: Arc<GroupState<T>>,
}

impl<T: Element> Publisher<T> for GroupPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        if self.state.claimed.swap(true, Ordering::AcqRel) {
            subscriber.on_subscribe(Upstream::plain(Arc::new(crate::flow::NoopSubscription)));
            subscriber.on_error(FlowError::Protocol(
                crate::error::ProtocolViolation::DoubleSubscribe,
            ));
            return;
        }
        *self.state.consumer.lock().unwrap() = Some(subscriber.clone());
        subscriber.on_subscribe(Upstream::plain(Arc::new(GroupSubscription {
            state: self.state.clone(),
        })));
        self.state.drain();
    }
}

struct GroupSubscription<T> {
    state: Arc<GroupState<T>>,
}

impl<T: Element> Subscription for GroupSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.state.ctl.request(n);
        self.state.drain();
    }

    fn cancel(&self) {
        if !self.state.ctl.is_cancelled() {
            self.state.ctl.cancel();
            self.state.drain();
            if !self.state.terminated.swap(true, Ordering::AcqRel) {
                self.state.parent.group_retired();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use crate::operators::Reduce;
    use crate::testing::TestSubscriber;

    #[test]
    fn routes_items_by_key() {
        let sums = Arc::new(StdMutex::new(Vec::new()));
        let record = Arc::clone(&sums);
        let outer: Arc<TestSubscriber<u64>> = TestSubscriber::new(u64::MAX);
        let done = outer.clone();
        Flow::range(1, 6)
            .group_by(|x| x % 2)
            .subscribe_each(
                move |group: GroupedFlow<i64, i64>| {
                    let key = *group.key();
                    let record = Arc::clone(&record);
                    group.flow().reduce(|a, b| a + b).subscribe_fn(move |sum| {
                        record.lock().unwrap().push((key, sum));
                    });
                },
                |_| {},
                move || done.on_next(1),
            );
        assert!(outer.await_count(1, Duration::from_secs(1)));
        let mut seen = sums.lock().unwrap().clone();
        seen.sort_unstable();
        // odds: 1 + 3 + 5 = 9, evens: 2 + 4 + 6 = 12
        assert_eq!(seen, vec![(0, 12), (1, 9)]);
    }

    #[test]
    fn groups_appear_in_arrival_order() {
        let keys = Arc::new(StdMutex::new(Vec::new()));
        let record = Arc::clone(&keys);
        Flow::from_iter([3i64, 1, 3, 2, 1]).group_by(|x| *x).subscribe_fn(
            move |group: GroupedFlow<i64, i64>| {
                record.lock().unwrap().push(*group.key());
                // consume the group so the pipeline keeps moving
                group.flow().subscribe_fn(|_| {});
            },
        );
        assert_eq!(keys.lock().unwrap().clone(), vec![3, 1, 2]);
    }

    #[test]
    fn a_new_key_without_demand_fails() {
        let collector: Arc<TestSubscriber<GroupedFlow<i64, i64>>> = TestSubscriber::new(0);
        Flow::range(0, 10).group_by(|x| *x).subscribe(collector.clone());
        collector.assert_errored();
    }
}
