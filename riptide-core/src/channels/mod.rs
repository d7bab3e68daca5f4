//! Queues used at asynchronous boundaries. These are the edges between
//! pipeline stages that run on different threads: a fixed-capacity ring
//! for prefetch-bounded hand-off and an unbounded linked queue for the
//! buffer-everything policies.
mod linked;
mod ring;

pub use linked::LinkedQueue;
pub use ring::RingQueue;

/// Pads a value to its own cache line to keep producer and consumer
/// indices from false-sharing.
#[derive(Debug, Default)]
#[repr(align(64))]
pub struct CachePadded<T>(T);

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self {
        CachePadded(value)
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> std::ops::DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}
