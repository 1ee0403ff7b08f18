//! Lock-free staging channel between producers and the write loop.
//!
//! [`StagingRing`] is a bounded many-producer/single-consumer ring with an
//! overwrite-in-lieu-of-blocking contract: [`publish`] never waits on a
//! lock and never fails, and when producers outrun the consumer the oldest
//! undelivered record is discarded to make room. The single consumer
//! drains in FIFO order with [`try_pop`] and learns how many records were
//! lost to overwrite.
//!
//! ## Design
//!
//! - Fixed, preallocated slot array (`UnsafeCell<MaybeUninit<T>>` per
//!   slot) — no allocator traffic on publish or pop, ever
//! - Power-of-2 capacity with bitmask indexing for fast modulo
//! - Cache-padded head/tail indices prevent false sharing
//! - Per-slot sequence stamps hand each slot exclusively to one producer
//!   or one reader at a time; stamp stores are Release, loads Acquire, so
//!   a record's bytes are visible before its slot reads as published
//!
//! A slot's stamp equals its position when free for writing and position
//! plus one when it holds a published record; consuming bumps it a full
//! lap ahead. On a full ring, `publish` dequeues and drops the record at
//! the head (the oldest), counts it, and retries — the discard side uses
//! the same stamp protocol as the consumer, so concurrent discards from
//! several lapping producers stay safe.
//!
//! [`publish`]: StagingRing::publish
//! [`try_pop`]: StagingRing::try_pop

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

/// Minimum number of slots.
pub const MIN_SLOTS: usize = 64;

/// Maximum number of slots (bounds memory for absurd configurations).
pub const MAX_SLOTS: usize = 1 << 20;

/// A wrapper that pads a value to a cache line to prevent false sharing
/// between the producer-side and consumer-side indices.
#[repr(C, align(64))]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    /// Creates a new cache-padded value.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

/// One ring slot: a stamp and an in-place, possibly-uninitialized value.
struct Slot<T> {
    /// Position-derived stamp; see the module docs for the protocol.
    seq: AtomicU64,
    /// The record payload; valid exactly while `seq == position + 1`.
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A payload returned by [`StagingRing::try_pop`].
#[derive(Debug, PartialEq, Eq)]
pub struct Popped<T> {
    /// The payload, in publish order per producer.
    pub value: T,
    /// Records discarded to make room since the previous pop.
    pub lost: u64,
}

/// Bounded lock-free MPSC staging ring that overwrites the oldest payload
/// when full.
///
/// # Safety contract
///
/// Any number of threads may call [`publish`](Self::publish) concurrently;
/// exactly one thread may call [`try_pop`](Self::try_pop).
pub struct StagingRing<T> {
    /// Preallocated storage; slots are reused in place, never reallocated.
    slots: Box<[Slot<T>]>,

    /// Next position to publish. Producers race on it with CAS.
    tail: CachePadded<AtomicU64>,

    /// Next position to consume. Advanced by the consumer, and by
    /// producers discarding the oldest record on overflow.
    head: CachePadded<AtomicU64>,

    /// Records discarded on overflow since the consumer last popped.
    lost: AtomicU64,

    /// Capacity mask (capacity - 1).
    mask: u64,
}

// SAFETY: payloads move producer -> ring -> consumer and the slot stamps
// serialize all access to each value cell, so `T: Send` is all that is
// required.
unsafe impl<T: Send> Send for StagingRing<T> {}
// SAFETY: same reasoning; the single-consumer requirement is part of the
// usage contract, not of memory safety for `&self` methods.
unsafe impl<T: Send> Sync for StagingRing<T> {}

impl<T> StagingRing<T> {
    /// Creates a ring with at least `capacity` slots.
    ///
    /// The slot count is clamped to `[MIN_SLOTS, MAX_SLOTS]` and rounded up
    /// to the next power of two.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity
            .clamp(MIN_SLOTS, MAX_SLOTS)
            .next_power_of_two();
        let slots: Vec<Slot<T>> = (0..capacity)
            .map(|i| Slot {
                seq: AtomicU64::new(i as u64),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Self {
            slots: slots.into_boxed_slice(),
            tail: CachePadded::new(AtomicU64::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
            lost: AtomicU64::new(0),
            mask: capacity as u64 - 1,
        }
    }

    /// Number of slots.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of published records not yet delivered or discarded.
    ///
    /// A racy snapshot; use only for observability.
    #[inline]
    #[must_use]
    pub fn len(&self) -> u64 {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.saturating_sub(head)
    }

    /// Returns true if every published record has been delivered.
    ///
    /// A racy snapshot; use only for observability.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publishes a payload. Never blocks, never fails.
    ///
    /// If the ring is full the oldest undelivered payload is discarded to
    /// make room. Ownership of `value` transfers to the ring.
    pub fn publish(&self, value: T) {
        let mut value = value;
        loop {
            match self.try_push(value) {
                Ok(()) => return,
                Err(rejected) => {
                    value = rejected;
                    // Full: evict the oldest record and count it lost.
                    if self.dequeue().is_some() {
                        self.lost.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    /// Returns the next payload in FIFO order, or `None` if the ring is
    /// empty.
    ///
    /// Must only be called from the single consumer thread. The returned
    /// [`Popped::lost`] reports records discarded on overflow since the
    /// previous successful pop.
    pub fn try_pop(&self) -> Option<Popped<T>> {
        let value = self.dequeue()?;
        let lost = self.lost.swap(0, Ordering::Relaxed);
        Some(Popped { value, lost })
    }

    /// Attempts to claim the tail slot and write `value` into it.
    ///
    /// Returns the value back when the ring is full.
    fn try_push(&self, value: T) -> Result<(), T> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            #[allow(clippy::cast_possible_truncation)] // masked into slot range
            let slot = &self.slots[(pos & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);

            if seq == pos {
                // Free slot; race other producers for it. The stamp store
                // below publishes the value, so the index CAS stays relaxed.
                match self.tail.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS on `tail` hands this slot
                        // exclusively to us until the stamp is bumped;
                        // readers wait for seq == pos + 1.
                        unsafe { (*slot.value.get()).write(value) };
                        slot.seq.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if seq < pos {
                // The slot still holds the record from one lap back.
                return Err(value);
            } else {
                // Another producer claimed this position; catch up.
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Removes the record at the head.
    ///
    /// Used by the consumer and, on overflow, by producers evicting the
    /// oldest record; the head CAS keeps concurrent callers safe.
    fn dequeue(&self) -> Option<T> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            #[allow(clippy::cast_possible_truncation)] // masked into slot range
            let slot = &self.slots[(pos & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);

            if seq == pos + 1 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS on `head` hands this slot
                        // exclusively to us; the producer published the
                        // value before storing seq == pos + 1.
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        // Free the slot for the producer a lap ahead.
                        slot.seq.store(pos + self.mask + 1, Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if seq <= pos {
                // Empty, or the producer that claimed this position has
                // not finished writing yet.
                return None;
            } else {
                // Someone else consumed this position; catch up.
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T> Drop for StagingRing<T> {
    fn drop(&mut self) {
        // Drop has exclusive access; drain the remaining records so their
        // payloads are freed.
        while self.dequeue().is_some() {}
    }
}

impl<T> std::fmt::Debug for StagingRing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingRing")
            .field("capacity", &self.capacity())
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .field("head", &self.head.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_capacity_clamp() {
        let ring: StagingRing<u64> = StagingRing::new(1);
        assert_eq!(ring.capacity(), MIN_SLOTS);

        let ring: StagingRing<u64> = StagingRing::new(100);
        assert_eq!(ring.capacity(), 128);

        let ring: StagingRing<u64> = StagingRing::new(usize::MAX / 2);
        assert!(ring.capacity() <= MAX_SLOTS.next_power_of_two());
    }

    #[test]
    fn test_fifo_order() {
        let ring = StagingRing::new(64);
        for i in 0u64..32 {
            ring.publish(i);
        }
        for i in 0u64..32 {
            let popped = ring.try_pop().unwrap();
            assert_eq!(popped.value, i);
            assert_eq!(popped.lost, 0);
        }
        assert!(ring.try_pop().is_none());
    }

    #[test]
    fn test_payload_bytes_preserved() {
        let ring = StagingRing::new(64);
        let payloads: Vec<Vec<u8>> = (0u8..16).map(|i| vec![i; i as usize + 1]).collect();
        for p in &payloads {
            ring.publish(p.clone());
        }
        for p in &payloads {
            assert_eq!(&ring.try_pop().unwrap().value, p);
        }
    }

    #[test]
    fn test_overwrite_discards_oldest() {
        let ring = StagingRing::new(MIN_SLOTS);
        let cap = ring.capacity() as u64;

        // Six records past capacity: each overflow evicts the oldest.
        for i in 0..cap + 6 {
            ring.publish(i);
        }

        // The first pop reports the six discards and resumes right after
        // the evicted prefix.
        let first = ring.try_pop().unwrap();
        assert_eq!(first.value, 6);
        assert_eq!(first.lost, 6);

        let mut delivered = vec![first.value];
        while let Some(popped) = ring.try_pop() {
            assert_eq!(popped.lost, 0);
            delivered.push(popped.value);
        }
        assert_eq!(delivered, (6..cap + 6).collect::<Vec<_>>());
    }

    #[test]
    fn test_full_ring_holds_capacity_records() {
        let ring = StagingRing::new(MIN_SLOTS);
        for i in 0..ring.capacity() as u64 {
            ring.publish(i);
        }
        assert_eq!(ring.len(), ring.capacity() as u64);

        // Nothing was discarded yet.
        assert_eq!(ring.try_pop().unwrap().lost, 0);
    }

    #[test]
    fn test_empty_after_drain() {
        let ring = StagingRing::new(64);
        ring.publish(1u64);
        assert!(ring.try_pop().is_some());
        assert!(ring.try_pop().is_none());
        assert!(ring.try_pop().is_none());
    }

    #[test]
    fn test_concurrent_producers_preserve_per_producer_order() {
        const PER_PRODUCER: u64 = 10_000;
        let ring = Arc::new(StagingRing::<(u8, u64)>::new(1 << 15));

        let producers: Vec<_> = (0u8..2)
            .map(|id| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        ring.publish((id, i));
                    }
                })
            })
            .collect();

        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut seen = [Vec::new(), Vec::new()];
                let mut lost = 0u64;
                let mut received = 0u64;
                while received + lost < 2 * PER_PRODUCER {
                    if let Some(popped) = ring.try_pop() {
                        lost += popped.lost;
                        received += 1;
                        let (id, i) = popped.value;
                        seen[id as usize].push(i);
                    } else {
                        thread::yield_now();
                    }
                }
                (seen, lost)
            })
        };

        for p in producers {
            p.join().unwrap();
        }
        let (seen, lost) = consumer.join().unwrap();

        // Capacity exceeds the total published, so nothing may be lost and
        // each producer's stream must arrive in publish order.
        assert_eq!(lost, 0);
        for stream in &seen {
            assert_eq!(stream.len(), PER_PRODUCER as usize);
            assert!(stream.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_drop_frees_unclaimed_payloads() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        DROPS.store(0, Ordering::SeqCst);
        {
            let ring = StagingRing::new(64);
            for _ in 0..10 {
                ring.publish(Counted);
            }
            drop(ring.try_pop()); // one claimed and dropped by the consumer
        }
        // The remaining nine are freed by the ring's Drop.
        assert_eq!(DROPS.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_overwrite_frees_old_payloads() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        DROPS.store(0, Ordering::SeqCst);
        let ring = StagingRing::new(MIN_SLOTS);
        for _ in 0..ring.capacity() + 5 {
            ring.publish(Counted);
        }
        // Five overflows evicted and freed five payloads.
        assert_eq!(DROPS.load(Ordering::SeqCst), 5);
        drop(ring);
        assert_eq!(DROPS.load(Ordering::SeqCst), MIN_SLOTS + 5);
    }
}
