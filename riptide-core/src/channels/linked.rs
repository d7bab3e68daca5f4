//! Unbounded node-per-item queue for the buffer-everything policies and
//! the serialize wrapper.
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use super::CachePadded;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    item: Option<T>,
}

impl<T> Node<T> {
    fn boxed(item: Option<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            item,
        }))
    }
}

/// Unbounded linked queue: any number of producers, exactly one consumer
/// thread at a time. Producers claim the tail with an atomic swap; the
/// consumer owns the head. This is the only queue in the crate that can
/// grow without bound, which is exactly what the buffer-all backpressure
/// policy asks for.
pub struct LinkedQueue<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
}

// SAFETY: item hand-off is ordered by the release store that links a node
// and the acquire load the consumer reads it with.
unsafe impl<T: Send> Send for LinkedQueue<T> {}
unsafe impl<T: Send> Sync for LinkedQueue<T> {}

impl<T> LinkedQueue<T> {
    pub fn new() -> Self {
        let stub = Node::boxed(None);
        LinkedQueue {
            head: CachePadded::new(AtomicPtr::new(stub)),
            tail: CachePadded::new(AtomicPtr::new(stub)),
        }
    }

    /// Enqueue an item. Never fails and never blocks.
    pub fn push(&self, item: T) {
        let node = Node::boxed(Some(item));
        let prev = self.tail.swap(node, Ordering::AcqRel);
        // SAFETY: prev is a valid node only this producer may link; the
        // consumer does not free it until `next` is non-null.
        unsafe {
            (*prev).next.store(node, Ordering::Release);
        }
    }

    /// Dequeue the next item, if any. Must only be called by the
    /// consumer side.
    pub fn poll(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        // SAFETY: head is always a valid stub node owned by the consumer.
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }
        // SAFETY: next was fully initialized before being linked; the old
        // head node is retired here and freed exactly once.
        let item = unsafe {
            let item = (*next).item.take();
            self.head.store(next, Ordering::Relaxed);
            drop(Box::from_raw(head));
            item
        };
        item
    }

    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        // SAFETY: see poll.
        unsafe { (*head).next.load(Ordering::Acquire).is_null() }
    }

    /// Drop everything queued. Consumer side only.
    pub fn clear(&self) {
        while self.poll().is_some() {}
    }
}

impl<T> Default for LinkedQueue<T> {
    fn default() -> Self {
        LinkedQueue::new()
    }
}

impl<T> Drop for LinkedQueue<T> {
    fn drop(&mut self) {
        while self.poll().is_some() {}
        let stub = *self.head.get_mut();
        // SAFETY: after draining, only the stub node remains.
        unsafe {
            drop(Box::from_raw(stub));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn fifo_within_one_producer() {
        let queue = LinkedQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.poll(), Some(1));
        assert_eq!(queue.poll(), Some(2));
        assert_eq!(queue.poll(), Some(3));
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn empty_after_drain() {
        let queue = LinkedQueue::new();
        assert!(queue.is_empty());
        queue.push(9);
        assert!(!queue.is_empty());
        queue.poll();
        assert!(queue.is_empty());
    }

    #[test]
    fn drops_unconsumed_items() {
        let item = Arc::new(());
        let queue = LinkedQueue::new();
        queue.push(Arc::clone(&item));
        queue.push(Arc::clone(&item));
        drop(queue);
        assert_eq!(Arc::strong_count(&item), 1);
    }

    #[test]
    fn concurrent_producers_lose_no_items() {
        let queue = Arc::new(LinkedQueue::new());
        let mut handles = Vec::new();
        for p in 0..4u64 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..1_000u64 {
                    queue.push(p * 1_000 + i);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let mut seen = Vec::new();
        while let Some(v) = queue.poll() {
            seen.push(v);
        }
        seen.sort_unstable();
        let expected: Vec<u64> = (0..4_000).collect();
        assert_eq!(seen, expected);
    }
}
