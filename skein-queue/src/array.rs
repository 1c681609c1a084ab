//! Bounded multi-producer multi-consumer ring buffer.
//!
//! Producers and consumers each claim a position with a single
//! compare-and-swap and then coordinate through the slot's sequence number,
//! so a slow producer never blocks a fast one and a consumer never reads a
//! slot that is still being written.
//!
//! ```text
//! sequence == pos              slot empty, writable by the producer at `pos`
//! sequence == pos + 1          slot holds data, readable by the consumer at `pos`
//! sequence == pos + slots      slot recycled, writable on the next lap
//! ```
//!
//! A single slot cannot tell "holds data" (`pos + 1`) from "recycled"
//! (`pos + slots`), so a capacity-1 queue allocates two slots and enforces
//! the bound on `head - tail` instead.
//!
//! Positions are 64-bit counters and never wrap in practice.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::{Full, slot_index};

struct Slot<T> {
    sequence: AtomicU64,
    data: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded MPMC queue with an exact capacity.
///
/// # Example
///
/// ```
/// use skein_queue::ArrayQueue;
/// use std::sync::Arc;
/// use std::thread;
///
/// let q = Arc::new(ArrayQueue::<u64>::new(64));
///
/// let producers: Vec<_> = (0..4)
///     .map(|p| {
///         let q = Arc::clone(&q);
///         thread::spawn(move || {
///             for i in 0..16 {
///                 while q.push(p * 100 + i).is_err() {
///                     std::hint::spin_loop();
///                 }
///             }
///         })
///     })
///     .collect();
///
/// for h in producers {
///     h.join().unwrap();
/// }
/// assert_eq!(q.len(), 64);
/// ```
pub struct ArrayQueue<T> {
    /// Next position for producers to claim.
    head: CachePadded<AtomicU64>,
    /// Next position for consumers to claim.
    tail: CachePadded<AtomicU64>,
    capacity: usize,
    slots: Box<[Slot<T>]>,
}

// Safety: slots are handed between threads through the sequence protocol;
// a value is only ever accessed by the party that claimed its position.
unsafe impl<T: Send> Send for ArrayQueue<T> {}
unsafe impl<T: Send> Sync for ArrayQueue<T> {}

impl<T> ArrayQueue<T> {
    /// Creates a queue holding at most `capacity` elements.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be non-zero");

        let slots = (0..capacity.max(2))
            .map(|i| Slot {
                sequence: AtomicU64::new(i as u64),
                data: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            capacity,
            slots,
        }
    }

    #[inline]
    fn slot(&self, position: u64) -> &Slot<T> {
        &self.slots[slot_index(position, self.slots.len())]
    }

    /// Returns `true` if `head` is a full capacity ahead of the consumers.
    #[inline]
    fn at_capacity(&self, head: u64) -> bool {
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) >= self.capacity as u64
    }

    /// Only a queue with spare slots needs the explicit bound check.
    #[inline]
    fn bounded_by_slots(&self) -> bool {
        self.capacity == self.slots.len()
    }

    /// Attempts to enqueue a value.
    ///
    /// # Errors
    ///
    /// Returns `Err(Full(value))` if the queue is full.
    #[inline]
    pub fn push(&self, value: T) -> Result<(), Full<T>> {
        let Some(position) = self.claim_write() else {
            return Err(Full(value));
        };

        let slot = self.slot(position);
        // Safety: the successful claim gives us exclusive access to this slot
        // until we publish it.
        unsafe {
            (*slot.data.get()).write(value);
        }
        slot.sequence
            .store(position.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Attempts to dequeue the oldest value.
    ///
    /// Returns `None` if the queue is empty, including the window where a
    /// producer has claimed the next slot but not yet published it.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        let position = self.claim_read()?;

        let slot = self.slot(position);
        // Safety: the claim gives us exclusive access to a published slot.
        let value = unsafe { (*slot.data.get()).assume_init_read() };
        slot.sequence.store(
            position.wrapping_add(self.slots.len() as u64),
            Ordering::Release,
        );
        Some(value)
    }

    fn claim_write(&self) -> Option<u64> {
        let mut head = self.head.load(Ordering::Relaxed);

        loop {
            let seq = self.slot(head).sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(head) as i64;

            if diff == 0 {
                if !self.bounded_by_slots() && self.at_capacity(head) {
                    return None;
                }
                match self.head.compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(head),
                    Err(h) => return self.claim_write_contended(h),
                }
            } else if diff < 0 {
                if self.at_capacity(head) {
                    return None;
                }
                // A consumer claimed the slot but has not recycled it yet
                return self.claim_write_contended(head);
            } else {
                head = self.head.load(Ordering::Relaxed);
            }
        }
    }

    #[cold]
    fn claim_write_contended(&self, mut head: u64) -> Option<u64> {
        let backoff = Backoff::new();

        loop {
            let seq = self.slot(head).sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(head) as i64;

            if diff == 0 {
                if !self.bounded_by_slots() && self.at_capacity(head) {
                    return None;
                }
                match self.head.compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(head),
                    Err(h) => {
                        head = h;
                        backoff.spin();
                    }
                }
            } else if diff < 0 {
                if self.at_capacity(head) {
                    return None;
                }
                backoff.snooze();
                head = self.head.load(Ordering::Relaxed);
            } else {
                head = self.head.load(Ordering::Relaxed);
                backoff.spin();
            }
        }
    }

    fn claim_read(&self) -> Option<u64> {
        let backoff = Backoff::new();
        let mut tail = self.tail.load(Ordering::Relaxed);

        loop {
            let seq = self.slot(tail).sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(tail.wrapping_add(1)) as i64;

            if diff == 0 {
                match self.tail.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(tail),
                    Err(t) => {
                        tail = t;
                        backoff.spin();
                    }
                }
            } else if diff < 0 {
                // Empty, or the producer at `tail` has not published yet
                return None;
            } else {
                tail = self.tail.load(Ordering::Relaxed);
                backoff.spin();
            }
        }
    }

    /// Returns the capacity of the queue.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of elements in the queue.
    ///
    /// This is a snapshot and may be stale by the time it is used. Slots that
    /// are claimed but not yet published are counted.
    pub fn len(&self) -> usize {
        loop {
            let tail = self.tail.load(Ordering::SeqCst);
            let head = self.head.load(Ordering::SeqCst);

            // Re-read tail to make sure the pair is consistent
            if self.tail.load(Ordering::SeqCst) == tail {
                let len = head.saturating_sub(tail) as usize;
                return len.min(self.capacity);
            }
        }
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

impl<T> Drop for ArrayQueue<T> {
    fn drop(&mut self) {
        let tail = *self.tail.get_mut();
        let head = *self.head.get_mut();

        let mut position = tail;
        while position != head {
            let index = slot_index(position, self.slots.len());
            let slot = &mut self.slots[index];
            if *slot.sequence.get_mut() == position.wrapping_add(1) {
                // Safety: the sequence says this slot holds a published value
                unsafe {
                    slot.data.get_mut().assume_init_drop();
                }
            }
            position = position.wrapping_add(1);
        }
    }
}

impl<T> fmt::Debug for ArrayQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
