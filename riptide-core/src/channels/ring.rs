//! Fixed-capacity single-producer single-consumer ring.
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::CachePadded;

/// A lock-free bounded queue for exactly one producer thread and one
/// consumer thread at a time.
///
/// Capacity is rounded up to a power of two so wrapped indices reduce to
/// a mask. Producer and consumer each own one cache-padded index; `offer`
/// publishes with a release store the consumer pairs with an acquire
/// load, and never blocks. The `mark_done` flag is published after the
/// last `offer`, so a consumer seeing `poll() == None` after `is_done()`
/// knows the stream has ended rather than stalled.
pub struct RingQueue<T> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    done: AtomicBool,
}

// SAFETY: slots are only touched by the single producer (writes at tail)
// and the single consumer (reads at head), which the index pair orders.
unsafe impl<T: Send> Send for RingQueue<T> {}
unsafe impl<T: Send> Sync for RingQueue<T> {}

impl<T> RingQueue<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        let capacity = capacity.next_power_of_two();
        let buffer: Vec<UnsafeCell<MaybeUninit<T>>> = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        RingQueue {
            buffer: buffer.into_boxed_slice(),
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            done: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Enqueue an item, or hand it back when the ring is full.
    /// Must only be called by the producer side.
    pub fn offer(&self, item: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) == self.capacity() {
            return Err(item);
        }
        // SAFETY: the slot at tail is unreachable by the consumer until
        // the release store below, and the fullness check above keeps the
        // producer from lapping unconsumed slots.
        unsafe {
            (*self.buffer[tail & self.mask].get()).write(item);
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Dequeue the next item, if any. Must only be called by the
    /// consumer side.
    pub fn poll(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        // SAFETY: the acquire load of tail orders this read after the
        // producer's write of the slot; head is only advanced here.
        let item = unsafe { (*self.buffer[head & self.mask].get()).assume_init_read() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Snapshot of the number of queued items.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything queued. Consumer side only.
    pub fn clear(&self) {
        while self.poll().is_some() {}
    }

    /// Publish "no more offers will follow". Producer side only, after
    /// the final `offer`.
    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

impl<T> Drop for RingQueue<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let mut at = head;
        while at != tail {
            // SAFETY: exclusive access in drop; every index in
            // head..tail holds an initialized item.
            unsafe {
                (*self.buffer[at & self.mask].get()).assume_init_drop();
            }
            at = at.wrapping_add(1);
        }
    }
}
