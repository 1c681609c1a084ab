//! # skein-queue
//!
//! Lock-free queues that back skein channels. None of them block: every
//! operation either completes immediately or reports that the queue is full
//! or empty. Blocking, parking and close semantics live one layer up, in
//! `skein-channel`.
//!
//! ## Specializations
//!
//! | Queue | Producers | Consumers | Storage |
//! |-------|-----------|-----------|---------|
//! | [`ArrayQueue`] | many | many | bounded ring |
//! | [`SpscQueue`] | one | one | bounded ring |
//! | [`LinkedQueue`] | many | one | unbounded list |
//!
//! All three are FIFO and deliver each element exactly once. They trade
//! consumer cardinality and storage growth for throughput:
//!
//! - [`ArrayQueue`] claims slots with one compare-and-swap per operation and
//!   tolerates out-of-order completion through per-slot sequence numbers.
//!   Any party may dequeue, which is what lets a producer evict the oldest
//!   element.
//! - [`SpscQueue`] needs no compare-and-swap at all, but its `push` and `pop`
//!   are `unsafe`: the caller guarantees a single producer and a single
//!   consumer at any one time.
//! - [`LinkedQueue`] never fills up. Producers link a node with one atomic
//!   swap; `pop` is `unsafe` and must only be called by one consumer at a time.
//!
//! Capacities are exact (no rounding to a power of two) because channel
//! overflow policies are observable at the exact bound.
//!
//! ## Example
//!
//! ```
//! use skein_queue::ArrayQueue;
//!
//! let q = ArrayQueue::<u64>::new(3);
//!
//! q.push(1).unwrap();
//! q.push(2).unwrap();
//! q.push(3).unwrap();
//! assert!(q.push(4).is_err());
//!
//! assert_eq!(q.pop(), Some(1));
//! assert_eq!(q.len(), 2);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

mod array;
mod linked;
mod spsc;

use core::fmt;

pub use array::ArrayQueue;
pub use linked::LinkedQueue;
pub use spsc::SpscQueue;

/// Error returned when a bounded queue is full.
///
/// Contains the value that could not be enqueued, allowing recovery.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Full<T>(
    /// The value that could not be enqueued.
    pub T,
);

impl<T> Full<T> {
    /// Returns the value that could not be enqueued.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Full(..)")
    }
}

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue is full")
    }
}

impl<T> std::error::Error for Full<T> {}

/// Maps a monotonically increasing position onto a slot index.
#[inline(always)]
fn slot_index(position: u64, capacity: usize) -> usize {
    (position % capacity as u64) as usize
}
