//! Single-producer single-consumer ring buffer with per-slot stamps.
//!
//! Each slot carries a stamp: zero when empty, `position + 1` when it holds
//! the value written at `position`. The producer only looks at the slot it is
//! about to write and the consumer only at the slot it is about to read, so
//! neither side touches the other's index on the hot path.
//!
//! The queue is shared by reference. Instead of splitting it into producer
//! and consumer halves, `push` and `pop` are `unsafe` and the caller upholds
//! the single-producer single-consumer discipline. `skein-channel` does this
//! by binding each side to the first strand that uses it.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering, fence};

use crossbeam_utils::CachePadded;

use crate::{Full, slot_index};

struct Slot<T> {
    stamp: AtomicU64,
    data: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded SPSC queue with an exact capacity.
pub struct SpscQueue<T> {
    /// Producer-private write position.
    local_tail: CachePadded<UnsafeCell<u64>>,
    /// Consumer-private read position.
    local_head: CachePadded<UnsafeCell<u64>>,
    /// Published positions, only read by `len`.
    tail: CachePadded<AtomicU64>,
    head: CachePadded<AtomicU64>,
    capacity: usize,
    slots: Box<[Slot<T>]>,
}

// Safety: values move from the single producer to the single consumer
// through the slot stamps.
unsafe impl<T: Send> Send for SpscQueue<T> {}
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    /// Creates a queue holding at most `capacity` elements.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be non-zero");

        let slots = (0..capacity)
            .map(|_| Slot {
                stamp: AtomicU64::new(0),
                data: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Self {
            local_tail: CachePadded::new(UnsafeCell::new(0)),
            local_head: CachePadded::new(UnsafeCell::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
            capacity,
            slots,
        }
    }

    /// Attempts to enqueue a value.
    ///
    /// # Errors
    ///
    /// Returns `Err(Full(value))` if the queue is full.
    ///
    /// # Safety
    ///
    /// At most one thread may call `push` at any one time.
    #[inline]
    pub unsafe fn push(&self, value: T) -> Result<(), Full<T>> {
        // Safety: caller guarantees a single producer
        let tail = unsafe { *self.local_tail.get() };
        let slot = &self.slots[slot_index(tail, self.capacity)];

        if slot.stamp.load(Ordering::Acquire) != 0 {
            return Err(Full(value));
        }

        unsafe { (*slot.data.get()).write(value) };
        slot.stamp.store(tail + 1, Ordering::Release);

        let next = tail + 1;
        unsafe { *self.local_tail.get() = next };
        self.tail.store(next, Ordering::Relaxed);
        Ok(())
    }

    /// Attempts to dequeue the oldest value.
    ///
    /// # Safety
    ///
    /// At most one thread may call `pop` at any one time.
    #[inline]
    pub unsafe fn pop(&self) -> Option<T> {
        // Safety: caller guarantees a single consumer
        let head = unsafe { *self.local_head.get() };
        let slot = &self.slots[slot_index(head, self.capacity)];

        if slot.stamp.load(Ordering::Acquire) != head + 1 {
            return None;
        }

        let value = unsafe { (*slot.data.get()).assume_init_read() };
        // Our read must complete before the producer may overwrite
        fence(Ordering::Release);
        slot.stamp.store(0, Ordering::Relaxed);

        let next = head + 1;
        unsafe { *self.local_head.get() = next };
        self.head.store(next, Ordering::Relaxed);
        Some(value)
    }

    /// Returns the capacity of the queue.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of elements in the queue. The value is a snapshot.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (tail.saturating_sub(head) as usize).min(self.capacity)
    }

    /// Returns `true` if the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if the queue is full.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }
}

impl<T> Drop for SpscQueue<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if *slot.stamp.get_mut() != 0 {
                // Safety: a non-zero stamp marks an unread value
                unsafe { slot.data.get_mut().assume_init_drop() };
            }
        }
    }
}

impl<T> fmt::Debug for SpscQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpscQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
