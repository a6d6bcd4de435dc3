use crate::Ring;
use std::sync::atomic::{AtomicU64, Ordering};

/// Drop-oldest overflow wrapper around [`Ring`].
///
/// Where the raw ring refuses a push at capacity, this buffer evicts the
/// head to make room and hands the evicted items back to the caller so it
/// can account for them (drop callbacks, counters). None of its operations
/// fail or block.
pub struct OverflowBuffer<T> {
    ring: Ring<T>,
    /// Monotonic count of evicted items.
    dropped: AtomicU64,
}

// Eviction counters are purely statistical: no code path depends on them
// being up to date, so Relaxed loads/stores are sufficient.
impl<T> OverflowBuffer<T> {
    /// Creates a buffer with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Ring::new(capacity),
            dropped: AtomicU64::new(0),
        }
    }

    /// Pushes `item`, evicting from the head if the buffer is full.
    ///
    /// Returns the evicted items, oldest first. The vector is empty in the
    /// common case and holds more than one item only when concurrent
    /// pushers race the same free slot.
    pub fn push(&self, item: T) -> Vec<T> {
        let mut evicted = Vec::new();
        let mut item = item;
        loop {
            match self.ring.try_push(item) {
                Ok(()) => return evicted,
                Err(rejected) => {
                    item = rejected;
                    if let Some(old) = self.ring.try_pop() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        evicted.push(old);
                    }
                    // Full but nothing to pop means a pusher holds the last
                    // slot mid-write; the retry will land right behind it.
                }
            }
        }
    }

    /// Pushes `item` without evicting; fails when the buffer is full.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        self.ring.try_push(item)
    }

    /// Dequeues until empty, preserving FIFO order.
    pub fn drain(&self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.ring.len());
        while let Some(item) = self.ring.try_pop() {
            items.push(item);
        }
        items
    }

    /// Current number of buffered items.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Declared capacity.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Returns true if the buffer is at capacity.
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    /// Monotonic count of items evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Discards everything currently buffered. Does not touch the
    /// dropped counter.
    pub fn clear(&self) {
        self.ring.clear();
    }
}
