//! Internal flow-control primitives shared by every asynchronous operator:
//! request accounting, the once-only upstream slot, the replaceable relay
//! subscription, the terminal latch and the queue-drain gate.
mod drain;
mod gate;
mod relay;
pub(crate) mod requests;
mod scalar;
mod slot;
mod terminal;

pub(crate) use drain::DrainControl;
pub(crate) use gate::SignalGate;
pub(crate) use relay::RelaySubscription;
pub(crate) use scalar::ScalarSubscription;
pub(crate) use slot::SubscriptionSlot;
pub(crate) use terminal::{Terminal, TerminalLatch};
