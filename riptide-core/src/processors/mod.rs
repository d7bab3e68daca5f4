//! Hot stages: processors are subscriber and publisher at once, plus the
//! connectable publish/refcount wrappers around cold flows.
mod direct;
mod publish;
mod serialized;

pub use direct::DirectProcessor;
pub use publish::PublishFlow;
pub use serialized::SerializedSubscriber;
