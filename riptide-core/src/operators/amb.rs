use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::backpressure::SubscriptionSlot;
use crate::error::FlowError;
use crate::flow::{Flow, NoopSubscription, Publisher, Subscriber, Subscription, Upstream};
use crate::types::Element;

impl<T: Element> Flow<T> {
    /// Subscribe to all `sources`; the first to deliver any signal wins
    /// and the losers are cancelled. From then on the winner is relayed
    /// untouched.
    pub fn amb(sources: Vec<Flow<T>>) -> Flow<T> {
        Flow::new(AmbPublisher { sources })
    }
}

struct AmbPublisher<T> {
    sources: Vec<Flow<T>>,
}

impl<T: Element> Publisher<T> for AmbPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        if self.sources.is_empty() {
            subscriber.on_subscribe(Upstream::plain(Arc::new(NoopSubscription)));
            subscriber.on_complete();
            return;
        }
        let coordinator = Arc::new_cyclic(|this: &Weak<AmbCoordinator<T>>| AmbCoordinator {
            downstream: subscriber.clone(),
            contenders: (0..self.sources.len())
                .map(|index| {
                    Arc::new(AmbContender {
                        parent: this.clone(),
                        index: index + 1,
                        upstream: SubscriptionSlot::new(),
                    })
                })
                .collect(),
            winner: AtomicUsize::new(0),
        });
        subscriber.on_subscribe(Upstream::plain(coordinator.clone()));
        for (source, contender) in self.sources.iter().zip(coordinator.contenders.iter()) {
            if coordinator.winner.load(Ordering::Acquire) != 0 {
                // an eager source already decided the race
                break;
            }
            source.subscribe(contender.clone());
        }
    }
}

struct AmbCoordinator<T> {
    downstream: Arc<dyn Subscriber<T>>,
    contenders: Vec<Arc<AmbContender<T>>>,
    /// 1-based index of the winning source; 0 while the race is open
    winner: AtomicUsize,
}

impl<T: Element> AmbCoordinator<T> {
    /// True if `index` is or just became the winner.
    fn win(&self, index: usize) -> bool {
        let current = self.winner.load(Ordering::Acquire);
        if current == index {
            return true;
        }
        if current != 0 {
            return false;
        }
        if self
            .winner
            .compare_exchange(0, index, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            for contender in &self.contenders {
                if contender.index != index {
                    contender.upstream.cancel();
                }
            }
            true
        } else {
            self.winner.load(Ordering::Acquire) == index
        }
    }
}

impl<T: Element> Subscription for AmbCoordinator<T> {
    fn request(&self, n: u64) {
        let winner = self.winner.load(Ordering::Acquire);
        if winner != 0 {
            self.contenders[winner - 1].upstream.request(n);
        } else {
            // nobody has signalled yet; every contender gets the demand
            for contender in &self.contenders {
                contender.upstream.request(n);
            }
        }
    }

    fn cancel(&self) {
        for contender in &self.contenders {
            contender.upstream.cancel();
        }
    }
}

struct AmbContender<T> {
    parent: Weak<AmbCoordinator<T>>,
    index: usize,
    upstream: SubscriptionSlot<T>,
}

impl<T: Element> Subscriber<T> for AmbContender<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.upstream.set(upstream);
    }

    fn on_next(&self, item: T) {
        if let Some(parent) = self.parent.upgrade() {
            if parent.win(self.index) {
                parent.downstream.on_next(item);
            }
        }
    }

    fn on_error(&self, error: FlowError) {
        if let Some(parent) = self.parent.upgrade() {
            if parent.win(self.index) {
                parent.downstream.on_error(error);
            }
        }
    }

    fn on_complete(&self) {
        if let Some(parent) = self.parent.upgrade() {
            if parent.win(self.index) {
                parent.downstream.on_complete();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestPublisher, TestSubscriber};

    #[test]
    fn first_emitter_wins_and_losers_are_cancelled() {
        let fast: TestPublisher<i32> = TestPublisher::new();
        let slow: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        Flow::amb(vec![fast.flow(), slow.flow()]).subscribe(ts.clone());
        fast.emit(1);
        assert!(slow.is_cancelled());
        slow.emit(99);
        fast.emit(2);
        fast.complete();
        ts.assert_values(&[1, 2]);
        ts.assert_complete();
    }

    #[test]
    fn a_completion_also_wins_the_race() {
        let empty: TestPublisher<i32> = TestPublisher::new();
        let other: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(u64::MAX);
        Flow::amb(vec![empty.flow(), other.flow()]).subscribe(ts.clone());
        empty.complete();
        assert!(other.is_cancelled());
        ts.assert_complete();
    }

    #[test]
    fn demand_reaches_every_contender_until_the_race_ends() {
        let a: TestPublisher<i32> = TestPublisher::new();
        let b: TestPublisher<i32> = TestPublisher::new();
        let ts = TestSubscriber::new(7);
        Flow::amb(vec![a.flow(), b.flow()]).subscribe(ts.clone());
        assert_eq!(a.requested(), 7);
        assert_eq!(b.requested(), 7);
    }

    #[test]
    fn amb_of_nothing_is_empty() {
        let ts: Arc<TestSubscriber<i32>> = TestSubscriber::new(0);
        Flow::amb(Vec::new()).subscribe(ts.clone());
        ts.assert_complete();
    }
}
