use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backpressure::RelaySubscription;
use crate::error::FlowError;
use crate::flow::{Flow, Publisher, Subscriber, Upstream};
use crate::types::Element;

/// Recover from a terminal error
pub trait OnError<T>: super::sealed::Sealed {
    /// Replace an error with the flow `resume` builds from it; the
    /// recovery flow supersedes the errored subscription and inherits
    /// the outstanding demand. An error of the recovery flow itself is
    /// delivered as-is.
    fn on_error_resume_next(
        self,
        resume: impl Fn(&FlowError) -> Flow<T> + Send + Sync + 'static,
    ) -> Flow<T>;

    /// Replace an error with one final item built from it.
    fn on_error_return(
        self,
        fallback: impl Fn(&FlowError) -> T + Send + Sync + 'static,
    ) -> Flow<T>
    where
        T: Clone + Sync;

    /// Swallow an error into an ordinary completion.
    fn on_error_complete(self) -> Flow<T>;
}

impl<T: Element> OnError<T> for Flow<T> {
    fn on_error_resume_next(
        self,
        resume: impl Fn(&FlowError) -> Flow<T> + Send + Sync + 'static,
    ) -> Flow<T> {
        Flow::new(ResumeNextPublisher {
            upstream: self,
            resume: Arc::new(resume),
        })
    }

    fn on_error_return(
        self,
        fallback: impl Fn(&FlowError) -> T + Send + Sync + 'static,
    ) -> Flow<T>
    where
        T: Clone + Sync,
    {
        self.on_error_resume_next(move |error| Flow::just(fallback(error)))
    }

    fn on_error_complete(self) -> Flow<T> {
        self.on_error_resume_next(|_| Flow::empty())
    }
}

struct ResumeNextPublisher<T> {
    upstream: Flow<T>,
    resume: Arc<dyn Fn(&FlowError) -> Flow<T> + Send + Sync>,
}

impl<T: Element> Publisher<T> for ResumeNextPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let relay = Arc::new(RelaySubscription::new());
        subscriber.on_subscribe(Upstream::plain(relay.clone()));
        self.upstream.subscribe(Arc::new(ResumeNextSubscriber {
            downstream: subscriber,
            resume: Arc::clone(&self.resume),
            relay,
            recovering: AtomicBool::new(false),
        }));
    }
}

struct ResumeNextSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    resume: Arc<dyn Fn(&FlowError) -> Flow<T> + Send + Sync>,
    relay: Arc<RelaySubscription<T>>,
    /// a recovery flow is already running; its error is final
    recovering: AtomicBool,
}

impl<T: Element> Subscriber<T> for ResumeNextSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.relay.set_upstream(upstream);
    }

    fn on_next(&self, item: T) {
        self.relay.produced(1);
        self.downstream.on_next(item);
    }

    fn on_error(&self, error: FlowError) {
        if self.recovering.swap(true, Ordering::AcqRel) {
            self.downstream.on_error(error);
            return;
        }
        if self.relay.is_cancelled() {
            crate::hooks::late_error(&error);
            return;
        }
        let recovery = (self.resume)(&error);
        recovery.subscribe(Arc::new(RecoverySubscriber {
            downstream: self.downstream.clone(),
            relay: self.relay.clone(),
        }));
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct RecoverySubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    relay: Arc<RelaySubscription<T>>,
}

impl<T: Element> Subscriber<T> for RecoverySubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.relay.set_upstream(upstream);
    }

    fn on_next(&self, item: T) {
        self.relay.produced(1);
        self.downstream.on_next(item);
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSubscriber;

    fn broken_flow() -> Flow<i64> {
        Flow::concat([Flow::range(0, 2), Flow::error(FlowError::callback("boom"))])
    }

    #[test]
    fn resume_next_splices_in_the_recovery_flow() {
        let ts = TestSubscriber::new(u64::MAX);
        broken_flow()
            .on_error_resume_next(|_| Flow::range(10, 2))
            .subscribe(ts.clone());
        ts.assert_values(&[0, 1, 10, 11]);
        ts.assert_complete();
    }

    #[test]
    fn on_error_return_appends_one_item() {
        let ts = TestSubscriber::new(u64::MAX);
        broken_flow()
            .on_error_return(|_| 99)
            .subscribe(ts.clone());
        ts.assert_values(&[0, 1, 99]);
        ts.assert_complete();
    }

    #[test]
    fn on_error_complete_swallows_the_error() {
        let ts = TestSubscriber::new(u64::MAX);
        broken_flow().on_error_complete().subscribe(ts.clone());
        ts.assert_values(&[0, 1]);
        ts.assert_complete();
    }

    #[test]
    fn recovery_errors_are_final() {
        let ts = TestSubscriber::new(u64::MAX);
        broken_flow()
            .on_error_resume_next(|_| Flow::error(FlowError::callback("second")))
            .subscribe(ts.clone());
        ts.assert_error(&FlowError::callback("second"));
    }

    #[test]
    fn demand_carries_into_the_recovery_flow() {
        let ts = TestSubscriber::new(3);
        broken_flow()
            .on_error_resume_next(|_| Flow::range(10, 5))
            .subscribe(ts.clone());
        ts.assert_values(&[0, 1, 10]);
        ts.assert_no_terminal();
    }
}
