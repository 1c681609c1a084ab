//! Unbounded multi-producer single-consumer linked queue.
//!
//! Producers swap themselves onto `tail` and then link the previous node to
//! the new one. Between the swap and the link the list is briefly split; the
//! consumer sees that as "empty" and retries later, which is fine because the
//! channel layer re-checks after registering as a waiter.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: Option<T>,
}

impl<T> Node<T> {
    fn boxed(value: Option<T>) -> *mut Self {
        Box::into_raw(Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value,
        }))
    }
}

/// An unbounded MPSC queue.
pub struct LinkedQueue<T> {
    /// Most recently pushed node. Producers swap here.
    tail: CachePadded<AtomicPtr<Node<T>>>,
    /// Stub node preceding the oldest element. Consumer-private.
    head: CachePadded<UnsafeCell<*mut Node<T>>>,
    len: CachePadded<AtomicUsize>,
}

// Safety: nodes are handed from producers to the single consumer through
// the `next` links.
unsafe impl<T: Send> Send for LinkedQueue<T> {}
unsafe impl<T: Send> Sync for LinkedQueue<T> {}

impl<T> LinkedQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let stub = Node::boxed(None);
        Self {
            tail: CachePadded::new(AtomicPtr::new(stub)),
            head: CachePadded::new(UnsafeCell::new(stub)),
            len: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Enqueues a value. Never fails.
    pub fn push(&self, value: T) {
        let node = Node::boxed(Some(value));
        self.len.fetch_add(1, Ordering::Release);

        let prev = self.tail.swap(node, Ordering::AcqRel);
        // Safety: `prev` stays alive until the consumer has moved past it,
        // which cannot happen before this link is published.
        unsafe { (*prev).next.store(node, Ordering::Release) };
    }

    /// Dequeues the oldest value.
    ///
    /// # Safety
    ///
    /// At most one thread may call `pop` at any one time.
    pub unsafe fn pop(&self) -> Option<T> {
        unsafe {
            let head = *self.head.get();
            let next = (*head).next.load(Ordering::Acquire);
            if next.is_null() {
                return None;
            }

            // `next` becomes the new stub; take its value and free the old one
            let value = (*next).value.take();
            *self.head.get() = next;
            drop(Box::from_raw(head));

            self.len.fetch_sub(1, Ordering::Release);
            value
        }
    }

    /// Returns the number of elements in the queue. The value is a snapshot
    /// and counts pushes whose link is not yet visible.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Returns `true` if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for LinkedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LinkedQueue<T> {
    fn drop(&mut self) {
        let mut node = *self.head.get_mut();
        while !node.is_null() {
            // Safety: we have exclusive access and every node was boxed
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Ordering::Relaxed);
        }
    }
}

impl<T> fmt::Debug for LinkedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedQueue")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_pop_fifo() {
        let q = LinkedQueue::new();
        for i in 0..10 {
            q.push(i);
        }
        assert_eq!(q.len(), 10);

        for i in 0..10 {
            assert_eq!(unsafe { q.pop() }, Some(i));
        }
        assert_eq!(unsafe { q.pop() }, None);
        assert!(q.is_empty());
    }

    #[test]
    fn never_full() {
        let q = LinkedQueue::new();
        for i in 0..100_000u64 {
            q.push(i);
        }
        assert_eq!(q.len(), 100_000);
    }

    #[test]
    fn drop_frees_remaining() {
        let drops = Arc::new(AtomicUsize::new(0));

        struct DropCounter(Arc<AtomicUsize>);
        impl Drop for DropCounter {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let q = LinkedQueue::new();
        for _ in 0..5 {
            q.push(DropCounter(Arc::clone(&drops)));
        }
        drop(unsafe { q.pop() });
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        drop(q);
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn many_producers_one_consumer() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 10_000;

        let q = Arc::new(LinkedQueue::new());
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        q.push((p, i));
                    }
                })
            })
            .collect();

        let mut next = [0u64; PRODUCERS as usize];
        let mut received = 0;
        while received < PRODUCERS * PER_PRODUCER {
            if let Some((p, i)) = unsafe { q.pop() } {
                assert_eq!(next[p as usize], i);
                next[p as usize] += 1;
                received += 1;
            }
        }

        for h in handles {
            h.join().unwrap();
        }
    }
}
