//! Queue selection behind a channel.
//!
//! A channel picks the cheapest queue its configuration allows:
//!
//! | Bounded | Producers | Consumers | Policy | Queue |
//! |---------|-----------|-----------|--------|-------|
//! | yes | one | one | not DISPLACE | [`SpscQueue`] |
//! | yes | any | any | any | [`ArrayQueue`] |
//! | no | any | one | any | [`LinkedQueue`] |
//! | no | any | many | any | [`SegQueue`] |
//!
//! DISPLACE needs the producer to dequeue the oldest element, which only the
//! MPMC ring supports. The single-owner queues bind their owner side to the
//! first strand that uses it.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::SegQueue;
use skein_queue::{ArrayQueue, Full, LinkedQueue, SpscQueue};
use skein_strand::current_id;

use crate::channel::OverflowPolicy;

/// Id of the strand allowed to use one side of a single-owner queue.
struct Owner {
    side: &'static str,
    /// Zero until bound.
    strand: AtomicU64,
}

impl Owner {
    fn new(side: &'static str) -> Self {
        Self {
            side,
            strand: AtomicU64::new(0),
        }
    }

    /// Binds the side to the current strand on first use.
    ///
    /// # Panics
    ///
    /// Panics if the side is already bound to another strand.
    #[inline]
    fn check(&self) {
        let me = current_id().as_u64();
        let owner = self.strand.load(Ordering::Acquire);
        if owner == me {
            return;
        }
        if owner == 0 {
            match self
                .strand
                .compare_exchange(0, me, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(current) if current == me => return,
                Err(current) => self.violated(me, current),
            }
        }
        self.violated(me, owner);
    }

    #[cold]
    fn violated(&self, me: u64, owner: u64) -> ! {
        panic!(
            "illegal state: single-{} channel used by strand #{me}, owned by strand #{owner}",
            self.side
        );
    }
}

pub(crate) enum Buffer<T> {
    Spsc {
        queue: SpscQueue<T>,
        producer: Owner,
        consumer: Owner,
    },
    Array(ArrayQueue<T>),
    Linked {
        queue: LinkedQueue<T>,
        consumer: Owner,
    },
    Segmented(SegQueue<T>),
}

impl<T> Buffer<T> {
    pub(crate) fn new(
        capacity: Option<usize>,
        policy: OverflowPolicy,
        single_producer: bool,
        single_consumer: bool,
    ) -> Self {
        match capacity {
            Some(capacity)
                if single_producer && single_consumer && policy != OverflowPolicy::Displace =>
            {
                Buffer::Spsc {
                    queue: SpscQueue::new(capacity),
                    producer: Owner::new("producer"),
                    consumer: Owner::new("consumer"),
                }
            }
            Some(capacity) => Buffer::Array(ArrayQueue::new(capacity)),
            None if single_consumer => Buffer::Linked {
                queue: LinkedQueue::new(),
                consumer: Owner::new("consumer"),
            },
            None => Buffer::Segmented(SegQueue::new()),
        }
    }

    #[inline]
    pub(crate) fn try_push(&self, value: T) -> Result<(), Full<T>> {
        match self {
            Buffer::Spsc {
                queue, producer, ..
            } => {
                producer.check();
                // Safety: the producer side is bound to one strand
                unsafe { queue.push(value) }
            }
            Buffer::Array(queue) => queue.push(value),
            Buffer::Linked { queue, .. } => {
                queue.push(value);
                Ok(())
            }
            Buffer::Segmented(queue) => {
                queue.push(value);
                Ok(())
            }
        }
    }

    #[inline]
    pub(crate) fn try_pop(&self) -> Option<T> {
        match self {
            Buffer::Spsc {
                queue, consumer, ..
            } => {
                consumer.check();
                // Safety: the consumer side is bound to one strand
                unsafe { queue.pop() }
            }
            Buffer::Array(queue) => queue.pop(),
            Buffer::Linked { queue, consumer } => {
                consumer.check();
                // Safety: the consumer side is bound to one strand
                unsafe { queue.pop() }
            }
            Buffer::Segmented(queue) => queue.pop(),
        }
    }

    /// Dequeues the oldest element on behalf of a producer. Only the MPMC
    /// ring allows this; the unbounded queues never need it.
    pub(crate) fn evict_oldest(&self) -> Option<T> {
        match self {
            Buffer::Array(queue) => queue.pop(),
            _ => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Buffer::Spsc { queue, .. } => queue.len(),
            Buffer::Array(queue) => queue.len(),
            Buffer::Linked { queue, .. } => queue.len(),
            Buffer::Segmented(queue) => queue.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self {
            Buffer::Spsc { queue, .. } => queue.is_empty(),
            Buffer::Array(queue) => queue.is_empty(),
            Buffer::Linked { queue, .. } => queue.is_empty(),
            Buffer::Segmented(queue) => queue.is_empty(),
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        match self {
            Buffer::Spsc { queue, .. } => queue.is_full(),
            Buffer::Array(queue) => queue.is_full(),
            Buffer::Linked { .. } | Buffer::Segmented(_) => false,
        }
    }

    pub(crate) fn capacity(&self) -> Option<usize> {
        match self {
            Buffer::Spsc { queue, .. } => Some(queue.capacity()),
            Buffer::Array(queue) => Some(queue.capacity()),
            Buffer::Linked { .. } | Buffer::Segmented(_) => None,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Buffer::Spsc { .. } => "spsc",
            Buffer::Array(_) => "array",
            Buffer::Linked { .. } => "linked",
            Buffer::Segmented(_) => "segmented",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_strand::StrandBuilder;

    #[test]
    fn queue_choice() {
        let pick = |cap, policy, sp, sc| Buffer::<u8>::new(cap, policy, sp, sc).kind();

        assert_eq!(pick(Some(4), OverflowPolicy::Block, true, true), "spsc");
        assert_eq!(pick(Some(4), OverflowPolicy::Displace, true, true), "array");
        assert_eq!(pick(Some(4), OverflowPolicy::Block, false, true), "array");
        assert_eq!(pick(None, OverflowPolicy::Block, false, true), "linked");
        assert_eq!(pick(None, OverflowPolicy::Block, true, false), "segmented");
    }

    #[test]
    fn owner_binds_to_first_user() {
        let buffer = Buffer::new(Some(4), OverflowPolicy::Block, true, true);
        buffer.try_push(1u32).unwrap();
        buffer.try_push(2).unwrap();
        assert_eq!(buffer.try_pop(), Some(1));
        assert_eq!(buffer.try_pop(), Some(2));
        assert_eq!(buffer.try_pop(), None);
    }

    #[test]
    fn foreign_consumer_panics() {
        let buffer = std::sync::Arc::new(Buffer::new(None, OverflowPolicy::Block, false, true));
        buffer.try_push(1u32).unwrap();
        assert_eq!(buffer.try_pop(), Some(1));

        let other = std::sync::Arc::clone(&buffer);
        let strand = StrandBuilder::new()
            .uncaught_exception_handler(|_, _| {})
            .spawn(move || {
                other.try_pop();
            })
            .unwrap();

        match strand.join() {
            Err(skein_strand::StrandError::Failed(failure)) => {
                let msg = failure.cause().panic_message().unwrap_or("");
                assert!(msg.contains("single-consumer"), "unexpected panic: {msg}");
            }
            other => panic!("expected ownership violation, got {other:?}"),
        }
    }

    #[test]
    fn eviction_only_on_array() {
        let array = Buffer::new(Some(2), OverflowPolicy::Displace, false, false);
        array.try_push(1u32).unwrap();
        array.try_push(2).unwrap();
        assert!(array.is_full());
        assert_eq!(array.evict_oldest(), Some(1));
        assert_eq!(array.len(), 1);

        let linked = Buffer::new(None, OverflowPolicy::Displace, false, true);
        linked.try_push(1u32).unwrap();
        assert_eq!(linked.evict_oldest(), None);
        assert_eq!(linked.capacity(), None);
    }
}
