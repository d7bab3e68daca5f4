use std::fmt::Debug;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::backpressure::{SubscriptionSlot, Terminal};
use crate::error::FlowError;
use crate::flow::{Subscriber, Upstream};

struct Recording<T> {
    values: Vec<T>,
    terminal: Option<Terminal>,
    subscriptions: usize,
}

/// Records every signal it receives and lets tests wait for and assert
/// on them. Demand is explicit: the subscriber requests `initial` at
/// subscription time and whatever `request` is called with afterwards.
pub struct TestSubscriber<T> {
    state: Mutex<Recording<T>>,
    signal: Condvar,
    upstream: SubscriptionSlot<T>,
    initial: u64,
}

impl<T: Send> TestSubscriber<T> {
    /// A subscriber that requests `initial` on subscription. Use
    /// `u64::MAX` for unbounded consumption and `0` to start stalled.
    pub fn new(initial: u64) -> Arc<Self> {
        Arc::new(TestSubscriber {
            state: Mutex::new(Recording {
                values: Vec::new(),
                terminal: None,
                subscriptions: 0,
            }),
            signal: Condvar::new(),
            upstream: SubscriptionSlot::new(),
            initial,
        })
    }

    pub fn request(&self, n: u64) {
        self.upstream.request(n);
    }

    pub fn cancel(&self) {
        self.upstream.cancel();
    }

    pub fn value_count(&self) -> usize {
        self.state.lock().unwrap().values.len()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().unwrap().terminal.is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().unwrap().subscriptions
    }

    /// Block until at least `n` values arrived. False on timeout.
    pub fn await_count(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while state.values.len() < n {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (relock, _) = self.signal.wait_timeout(state, deadline - now).unwrap();
            state = relock;
        }
        true
    }

    /// Block until a terminal signal arrived. False on timeout.
    pub fn await_terminal(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while state.terminal.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (relock, _) = self.signal.wait_timeout(state, deadline - now).unwrap();
            state = relock;
        }
        true
    }

    pub fn assert_complete(&self) {
        let state = self.state.lock().unwrap();
        assert_eq!(
            state.terminal,
            Some(Terminal::Complete),
            "expected completion, got {:?}",
            state.terminal
        );
    }

    pub fn assert_error(&self, expected: &FlowError) {
        let state = self.state.lock().unwrap();
        assert_eq!(
            state.terminal,
            Some(Terminal::Errored(expected.clone())),
            "expected error {expected:?}, got {:?}",
            state.terminal
        );
    }

    pub fn assert_errored(&self) {
        let state = self.state.lock().unwrap();
        assert!(
            matches!(state.terminal, Some(Terminal::Errored(_))),
            "expected an error, got {:?}",
            state.terminal
        );
    }

    pub fn assert_no_terminal(&self) {
        let state = self.state.lock().unwrap();
        assert_eq!(state.terminal, None, "expected no terminal yet");
    }
}

impl<T: Clone + Send> TestSubscriber<T> {
    pub fn values(&self) -> Vec<T> {
        self.state.lock().unwrap().values.clone()
    }
}

impl<T: Clone + PartialEq + Debug + Send> TestSubscriber<T> {
    pub fn assert_values(&self, expected: &[T]) {
        let state = self.state.lock().unwrap();
        assert_eq!(state.values.as_slice(), expected);
    }
}

impl<T: Send> Subscriber<T> for TestSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        {
            let mut state = self.state.lock().unwrap();
            state.subscriptions += 1;
        }
        if self.upstream.set(upstream) && self.initial > 0 {
            self.upstream.request(self.initial);
        }
    }

    fn on_next(&self, item: T) {
        let mut state = self.state.lock().unwrap();
        state.values.push(item);
        drop(state);
        self.signal.notify_all();
    }

    fn on_error(&self, error: FlowError) {
        let mut state = self.state.lock().unwrap();
        if state.terminal.is_none() {
            state.terminal = Some(Terminal::Errored(error));
        }
        drop(state);
        self.signal.notify_all();
    }

    fn on_complete(&self) {
        let mut state = self.state.lock().unwrap();
        if state.terminal.is_none() {
            state.terminal = Some(Terminal::Complete);
        }
        drop(state);
        self.signal.notify_all();
    }
}
