use crate::Backoff;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// This MPMC ring buffer uses per-slot sequence stamps to coordinate any
// number of concurrent pushers and poppers:
//
// ## Sequence Numbers (ABA Prevention)
//
// `tail` (next write position) and `head` (next read position) are unbounded
// u64 sequence numbers, never wrapped indices. The slot index is computed as
// `position & mask` only when touching the slab. At 10 million messages per
// second, wrap-around takes ~58,000 years.
//
// ## Slot Protocol
//
// Each slot carries its own atomic `stamp`. For the slot at index `i`:
// - stamp == pos            → slot is free for the push claiming position pos
// - stamp == pos + 1        → slot holds the value for position pos
// - stamp == pos + slots    → slot has been consumed, free for the next lap
//
// **Push:** claim position `pos` via CAS on `tail` (only when the stamp says
// the slot is free), write the value, then `stamp.store(pos + 1, Release)`.
// The Release store is what publishes the value; a winning CAS alone does not
// make the slot visible to poppers.
//
// **Pop:** claim position `pos` via CAS on `head` (only when the stamp says
// the value is present; the Acquire load of the stamp synchronizes with the
// pusher's Release store), move the value out, then
// `stamp.store(pos + slots, Release)` to free the slot for the next lap.
//
// ## Capacity Accounting
//
// `len` is a credit counter: pushers take a credit up front and give it back
// if the buffer is at capacity. The counter is what enforces the declared
// capacity; the stamps are the authoritative full/empty test for the slab
// itself (which is sized one power of two above the capacity). A pusher that
// holds a credit always finds a slot, so the claim loop cannot livelock
// against a full slab.
//
// =============================================================================

struct Slot<T> {
    stamp: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded lock-free MPMC ring buffer.
///
/// `try_push` and `try_pop` never block and never spuriously fail: a push
/// fails only when the buffer holds `capacity` items, a pop returns `None`
/// only when no published item is available.
pub struct Ring<T> {
    // === PUSH HOT === (128-byte aligned)
    /// Next write position (claimed by pushers via CAS).
    tail: CachePadded<AtomicU64>,

    // === POP HOT === (128-byte aligned)
    /// Next read position (claimed by poppers via CAS).
    head: CachePadded<AtomicU64>,

    /// Credit counter enforcing the declared capacity.
    len: CachePadded<AtomicUsize>,

    /// Declared capacity; what `try_push` enforces.
    capacity: usize,
    /// Index mask; `slots.len() - 1`.
    mask: u64,
    /// The slot slab, sized to the next power of two above `capacity`.
    slots: Box<[Slot<T>]>,
}

// Safety: the slot protocol above hands each value from exactly one pusher
// to exactly one popper with Release/Acquire ordering on the slot stamp.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Creates a ring with the given capacity.
    ///
    /// The backing slab is sized to the next power of two ≥ `capacity + 1`;
    /// `capacity` is what `try_push` enforces.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");

        let slab_size = (capacity + 1).next_power_of_two();
        let slots: Box<[Slot<T>]> = (0..slab_size as u64)
            .map(|i| Slot {
                stamp: AtomicU64::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Self {
            tail: CachePadded::new(AtomicU64::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
            len: CachePadded::new(AtomicUsize::new(0)),
            capacity,
            mask: (slab_size - 1) as u64,
            slots,
        }
    }

    /// Returns the declared capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the current number of items.
    ///
    /// Advisory under concurrency: the head/tail pair and slot stamps are
    /// authoritative, this counter may briefly run ahead of published items.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed).min(self.capacity)
    }

    /// Returns true if the ring holds no items.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the ring is at capacity.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Attempts to push `item` at the tail.
    ///
    /// Fails and returns the item back when the ring already holds
    /// `capacity` items. Succeeds without locks; concurrent pushers do not
    /// corrupt slots.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        // Take a capacity credit up front; give it back on full. This makes
        // the declared capacity exact even when the slab is larger.
        if self.len.fetch_add(1, Ordering::Relaxed) >= self.capacity {
            self.len.fetch_sub(1, Ordering::Relaxed);
            return Err(item);
        }

        let mut backoff = Backoff::new();
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(pos & self.mask) as usize];
            let stamp = slot.stamp.load(Ordering::Acquire);

            if stamp == pos {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS above made this pusher the unique
                        // owner of position `pos`; no popper reads the slot
                        // until the Release store below publishes it.
                        unsafe {
                            (*slot.value.get()).write(item);
                        }
                        slot.stamp.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(observed) => {
                        pos = observed;
                        backoff.spin();
                    }
                }
            } else if stamp.wrapping_sub(pos) as i64 > 0 {
                // Another pusher already claimed this position; refresh.
                pos = self.tail.load(Ordering::Relaxed);
                backoff.spin();
            } else {
                // stamp < pos: a popper claimed the previous-lap value but
                // has not freed the slot yet. We hold a credit, so the slot
                // will come free; wait it out.
                backoff.snooze();
            }
        }
    }

    /// Removes and returns the head item, or `None` when empty.
    pub fn try_pop(&self) -> Option<T> {
        let mut backoff = Backoff::new();
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(pos & self.mask) as usize];
            let stamp = slot.stamp.load(Ordering::Acquire);
            let published = pos.wrapping_add(1);

            if stamp == published {
                match self.head.compare_exchange_weak(
                    pos,
                    published,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the stamp said the value for `pos` is
                        // published (Acquire pairs with the pusher's Release)
                        // and the CAS made this popper its unique consumer.
                        let item = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.stamp.store(
                            pos.wrapping_add(self.slots.len() as u64),
                            Ordering::Release,
                        );
                        self.len.fetch_sub(1, Ordering::Relaxed);
                        return Some(item);
                    }
                    Err(observed) => {
                        pos = observed;
                        backoff.spin();
                    }
                }
            } else if (stamp.wrapping_sub(published) as i64) < 0 {
                // Not yet published for this lap. Either the ring is empty or
                // a pusher claimed the position and has not finished writing;
                // in both cases there is nothing visible at the head.
                return None;
            } else {
                // Another popper advanced past us; refresh.
                pos = self.head.load(Ordering::Relaxed);
                backoff.spin();
            }
        }
    }

    /// Removes every item currently in the ring.
    pub fn clear(&self) {
        while self.try_pop().is_some() {}
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // Pop-drop whatever is still resident so T's destructor runs.
        while self.try_pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_push_pop_fifo() {
        let ring = Ring::new(8);
        for i in 0..5u64 {
            ring.try_push(i).unwrap();
        }
        for i in 0..5u64 {
            assert_eq!(ring.try_pop(), Some(i));
        }
        assert_eq!(ring.try_pop(), None);
    }

    #[test]
    fn test_capacity_enforced() {
        let ring = Ring::new(2);
        ring.try_push(1u32).unwrap();
        ring.try_push(2u32).unwrap();
        assert_eq!(ring.try_push(3u32), Err(3));
        assert_eq!(ring.len(), 2);
        assert!(ring.is_full());

        assert_eq!(ring.try_pop(), Some(1));
        ring.try_push(3u32).unwrap();
        assert_eq!(ring.try_pop(), Some(2));
        assert_eq!(ring.try_pop(), Some(3));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_wraparound() {
        let ring = Ring::new(3);
        for lap in 0..100u64 {
            ring.try_push(lap).unwrap();
            assert_eq!(ring.try_pop(), Some(lap));
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_clear() {
        let ring = Ring::new(4);
        for i in 0..4u8 {
            ring.try_push(i).unwrap();
        }
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.try_pop(), None);
        ring.try_push(9).unwrap();
        assert_eq!(ring.try_pop(), Some(9));
    }

    #[test]
    fn test_drop_releases_remaining() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        DROPS.store(0, Ordering::SeqCst);
        {
            let ring = Ring::new(8);
            for _ in 0..5 {
                assert!(ring.try_push(Tracked).is_ok());
            }
            drop(ring.try_pop());
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_concurrent_mpmc() {
        const PUSHERS: usize = 4;
        const POPPERS: usize = 4;
        const PER_PUSHER: usize = 10_000;

        let ring = Arc::new(Ring::new(256));
        let popped = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for p in 0..PUSHERS {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PUSHER {
                    let value = (p * PER_PUSHER + i) as u64;
                    loop {
                        if ring.try_push(value).is_ok() {
                            break;
                        }
                        thread::yield_now();
                    }
                }
            }));
        }
        for _ in 0..POPPERS {
            let ring = Arc::clone(&ring);
            let popped = Arc::clone(&popped);
            handles.push(thread::spawn(move || loop {
                if ring.try_pop().is_some() {
                    if popped.fetch_add(1, Ordering::SeqCst) + 1 == PUSHERS * PER_PUSHER {
                        return;
                    }
                } else if popped.load(Ordering::SeqCst) >= PUSHERS * PER_PUSHER {
                    return;
                } else {
                    thread::yield_now();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(popped.load(Ordering::SeqCst), PUSHERS * PER_PUSHER);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_single_consumer_sees_per_producer_order() {
        const PUSHERS: usize = 2;
        const PER_PUSHER: u64 = 5_000;

        let ring = Arc::new(Ring::new(64));
        let mut handles = Vec::new();
        for p in 0..PUSHERS as u64 {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PUSHER {
                    let value = (p << 32) | i;
                    while ring.try_push(value).is_err() {
                        thread::yield_now();
                    }
                }
            }));
        }

        let mut last_seen = vec![None; PUSHERS];
        let mut total = 0;
        while total < PUSHERS as u64 * PER_PUSHER {
            if let Some(value) = ring.try_pop() {
                let producer = (value >> 32) as usize;
                let seq = value & 0xffff_ffff;
                if let Some(prev) = last_seen[producer] {
                    assert!(seq > prev, "producer {} went backwards", producer);
                }
                last_seen[producer] = Some(seq);
                total += 1;
            } else {
                thread::yield_now();
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
