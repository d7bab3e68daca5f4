//! Helpers for testing flows: a recording subscriber with await/assert
//! helpers, a virtual-time scheduler, a hand-driven publisher and a
//! subscription probe.
mod probe;
mod publisher;
mod scheduler;
mod subscriber;

pub use probe::{probe_subscription, SubscriptionProbe};
pub use publisher::TestPublisher;
pub use scheduler::TestScheduler;
pub use subscriber::TestSubscriber;
