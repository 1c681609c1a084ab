//! Broadcast channel that keeps a bounded history.
//!
//! A [`TickerChannel`] retains its last `capacity` messages. Sends never
//! block: once the history is full, each send overwrites the oldest entry.
//! Every [`TickerConsumer`] reads the whole stream through its own cursor, at
//! its own pace, without taking messages away from the others. A consumer
//! that falls more than `capacity` messages behind skips ahead to the oldest
//! message still retained.
//!
//! ```text
//! position:   0   1   2   3   4   5   6   tail = 7, capacity = 4
//!                         └─ retained ─┘
//!
//! consumer A  cursor 5  ──▶ reads 5, 6
//! consumer B  cursor 1  ──▶ lapped, resumes at 3
//! ```
//!
//! Each slot records the position of the message it holds, the way the
//! overwriting ring tags slots with their lap. A reader compares that tag
//! with its cursor: equal means the message is there, greater means the
//! reader was lapped, smaller means the writer has claimed the position but
//! not finished writing it.
//!
//! ```
//! use skein_channel::{ReceivePort, ticker};
//!
//! let tick = ticker::<u32>(4);
//! let early = tick.subscribe();
//! for i in 0..6 {
//!     tick.send(i).unwrap();
//! }
//! let late = tick.subscribe();
//! tick.close();
//!
//! assert_eq!(early.messages().collect::<Vec<_>>(), [2, 3, 4, 5]);
//! assert_eq!(late.messages().collect::<Vec<_>>(), [2, 3, 4, 5]);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crossbeam_utils::CachePadded;
use skein_strand::{ConditionSynchronizer, WaitError};
use tracing::{debug, trace};

use crate::error::{RecvError, SendError, TryRecvError};
use crate::port::ReceivePort;

struct Slot<T> {
    /// Position and message last written here.
    entry: Mutex<Option<(u64, T)>>,
}

struct Shared<T> {
    slots: Box<[Slot<T>]>,
    /// Next position to write.
    tail: CachePadded<AtomicU64>,
    /// Sends that passed the closed check and have not finished writing.
    in_flight: AtomicUsize,
    closed: AtomicBool,
    receivers: ConditionSynchronizer,
}

impl<T> Shared<T> {
    fn capacity(&self) -> u64 {
        self.slots.len() as u64
    }

    fn slot(&self, position: u64) -> &Slot<T> {
        &self.slots[(position % self.capacity()) as usize]
    }

    fn oldest_retained(&self, tail: u64) -> u64 {
        tail.saturating_sub(self.capacity())
    }

    /// Closed and nothing more will be written at or after `cursor`.
    fn finished_at(&self, cursor: u64) -> bool {
        self.closed.load(Ordering::SeqCst)
            && self.in_flight.load(Ordering::SeqCst) == 0
            && cursor >= self.tail.load(Ordering::SeqCst)
    }
}

/// Sending side of a ticker. Cloning shares the same history.
pub struct TickerChannel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TickerChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Creates a ticker that retains the last `capacity` messages.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn ticker<T>(capacity: usize) -> TickerChannel<T> {
    assert!(capacity > 0, "ticker capacity must be non-zero");
    let slots = (0..capacity)
        .map(|_| Slot {
            entry: Mutex::new(None),
        })
        .collect();

    TickerChannel {
        shared: Arc::new(Shared {
            slots,
            tail: CachePadded::new(AtomicU64::new(0)),
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            receivers: ConditionSynchronizer::new("ticker receive"),
        }),
    }
}

impl<T> TickerChannel<T> {
    /// Publishes `msg`, overwriting the oldest retained message if the
    /// history is full. Never blocks.
    ///
    /// # Errors
    ///
    /// [`SendError::Closed`] once the ticker is closed.
    pub fn send(&self, msg: T) -> Result<(), SendError<T>> {
        let shared = &*self.shared;
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        if shared.closed.load(Ordering::SeqCst) {
            shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            // Readers of a closed ticker wait for in-flight sends to drain
            self.notify();
            return Err(SendError::Closed(msg));
        }

        self.write(msg);
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.notify();
        Ok(())
    }

    /// Writes without the closed check or the wakeup.
    pub(crate) fn write(&self, msg: T) {
        let shared = &*self.shared;
        let position = shared.tail.fetch_add(1, Ordering::SeqCst);
        let slot = shared.slot(position);

        let mut entry = slot.entry.lock().unwrap_or_else(PoisonError::into_inner);
        let overwritten = if entry.as_ref().is_none_or(|(at, _)| *at < position) {
            entry.replace((position, msg))
        } else {
            // A later send claimed and filled this slot first
            trace!(position, "ticker message overtaken");
            None
        };
        drop(entry);
        drop(overwritten);
    }

    /// Wakes every consumer.
    pub(crate) fn notify(&self) {
        if self.shared.receivers.has_waiters() {
            self.shared.receivers.signal_all();
        }
    }

    /// Creates a consumer that starts at the oldest retained message.
    pub fn subscribe(&self) -> TickerConsumer<T> {
        let shared = &*self.shared;
        let start = shared.oldest_retained(shared.tail.load(Ordering::SeqCst));
        TickerConsumer {
            shared: Arc::clone(&self.shared),
            cursor: AtomicU64::new(start),
            last_read: AtomicU64::new(0),
        }
    }

    /// Closes the ticker. Consumers still read what is retained.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            debug!(sent = self.sent(), "ticker closed");
            self.shared.receivers.signal_all();
        }
    }

    /// Returns `true` once closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of messages sent so far.
    pub fn sent(&self) -> u64 {
        self.shared.tail.load(Ordering::SeqCst)
    }

    /// Number of messages retained.
    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }
}

impl<T> fmt::Debug for TickerChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickerChannel")
            .field("capacity", &self.capacity())
            .field("sent", &self.sent())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// One reader of a [`TickerChannel`].
///
/// A consumer may be shared between strands; each message is then read by
/// exactly one of them.
pub struct TickerConsumer<T> {
    shared: Arc<Shared<T>>,
    cursor: AtomicU64,
    /// Position of the last message read plus one; zero before the first.
    last_read: AtomicU64,
}

impl<T> TickerConsumer<T> {
    /// Moves the cursor forward past lapped positions. Returns where the
    /// cursor is now, which is further on if another strand moved it first.
    fn skip(&self, from: u64, to: u64) -> u64 {
        match self
            .cursor
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => to,
            Err(now) => now,
        }
    }

    /// Position of the last message this consumer read, if any.
    pub fn last_index_read(&self) -> Option<u64> {
        self.last_read.load(Ordering::SeqCst).checked_sub(1)
    }

    /// Number of retained messages this consumer has not read yet.
    pub fn pending(&self) -> u64 {
        let tail = self.shared.tail.load(Ordering::SeqCst);
        let cursor = self
            .cursor
            .load(Ordering::SeqCst)
            .max(self.shared.oldest_retained(tail));
        tail.saturating_sub(cursor)
    }
}

impl<T: Clone> TickerConsumer<T> {
    fn read(&self) -> Result<T, TryRecvError> {
        let shared = &*self.shared;
        let mut cursor = self.cursor.load(Ordering::SeqCst);
        loop {
            let tail = shared.tail.load(Ordering::SeqCst);
            if cursor >= tail {
                return Err(if shared.finished_at(cursor) {
                    TryRecvError::Closed
                } else {
                    TryRecvError::Empty
                });
            }

            let oldest = shared.oldest_retained(tail);
            if cursor < oldest {
                trace!(from = cursor, to = oldest, "ticker consumer lapped");
                cursor = self.skip(cursor, oldest);
                continue;
            }

            let entry = shared
                .slot(cursor)
                .entry
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match &*entry {
                Some((at, msg)) if *at == cursor => {
                    let msg = msg.clone();
                    drop(entry);
                    match self.cursor.compare_exchange(
                        cursor,
                        cursor + 1,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => {
                            self.last_read.fetch_max(cursor + 1, Ordering::SeqCst);
                            return Ok(msg);
                        }
                        // Another strand sharing this consumer read it
                        Err(now) => cursor = now,
                    }
                }
                Some((at, _)) if *at > cursor => {
                    drop(entry);
                    let oldest = shared.oldest_retained(shared.tail.load(Ordering::SeqCst));
                    cursor = self.skip(cursor, oldest.max(cursor + 1));
                }
                // Claimed by a send that has not written it yet
                _ => return Err(TryRecvError::Empty),
            }
        }
    }

    fn read_until(&self, deadline: Option<Instant>) -> Result<T, RecvError> {
        match self.read() {
            Ok(msg) => return Ok(msg),
            Err(TryRecvError::Empty) => {}
            Err(_) => return Err(RecvError::Closed),
        }

        let receivers = &self.shared.receivers;
        let registration = receivers.register();
        let mut iteration = 0;
        let result = loop {
            match self.read() {
                Ok(msg) => break Ok(msg),
                Err(TryRecvError::Empty) => {}
                Err(_) => break Err(RecvError::Closed),
            }
            match receivers.wait(&registration, iteration, deadline) {
                Ok(()) => {}
                Err(WaitError::Timeout) => break Err(RecvError::Timeout),
                Err(WaitError::Interrupted) => break Err(RecvError::Interrupted),
            }
            iteration += 1;
        };
        receivers.unregister(registration);
        result
    }
}

impl<T: Clone> ReceivePort for TickerConsumer<T> {
    type Message = T;

    fn try_receive(&self) -> Result<T, TryRecvError> {
        self.read()
    }

    fn receive_until(&self, deadline: Option<Instant>) -> Result<T, RecvError> {
        self.read_until(deadline)
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl<T> fmt::Debug for TickerConsumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickerConsumer")
            .field("cursor", &self.cursor.load(Ordering::SeqCst))
            .field("last_index_read", &self.last_index_read())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_strand::StrandBuilder;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn consumer_reads_every_message_within_capacity() {
        let tick = ticker::<u32>(8);
        let consumer = tick.subscribe();
        assert_eq!(consumer.last_index_read(), None);

        for i in 0..5 {
            tick.send(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(consumer.try_receive().unwrap(), i);
        }
        assert_eq!(consumer.last_index_read(), Some(4));
        assert!(matches!(consumer.try_receive(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn consumers_do_not_steal_from_each_other() {
        let tick = ticker::<u32>(4);
        let a = tick.subscribe();
        let b = tick.subscribe();

        tick.send(1).unwrap();
        tick.send(2).unwrap();

        assert_eq!(a.try_receive().unwrap(), 1);
        assert_eq!(a.try_receive().unwrap(), 2);
        assert_eq!(b.try_receive().unwrap(), 1);
        assert_eq!(b.try_receive().unwrap(), 2);
    }

    #[test]
    fn lapped_consumer_resumes_at_oldest() {
        let tick = ticker::<u32>(3);
        let consumer = tick.subscribe();

        for i in 0..10 {
            tick.send(i).unwrap();
        }
        assert_eq!(consumer.pending(), 3);
        assert_eq!(consumer.try_receive().unwrap(), 7);
        assert_eq!(consumer.last_index_read(), Some(7));
        assert_eq!(consumer.try_receive().unwrap(), 8);

        tick.send(10).unwrap();
        tick.send(11).unwrap();
        tick.send(12).unwrap();
        assert_eq!(consumer.try_receive().unwrap(), 10);
    }

    #[test]
    fn subscribe_starts_at_oldest_retained() {
        let tick = ticker::<u32>(2);
        for i in 0..5 {
            tick.send(i).unwrap();
        }
        let late = tick.subscribe();
        assert_eq!(late.try_receive().unwrap(), 3);
        assert_eq!(late.try_receive().unwrap(), 4);
    }

    #[test]
    fn close_drains_then_reports_closed() {
        let tick = ticker::<u32>(4);
        let consumer = tick.subscribe();
        tick.send(1).unwrap();
        tick.close();

        assert!(matches!(tick.send(2), Err(SendError::Closed(2))));
        assert!(consumer.is_closed());
        assert_eq!(consumer.receive().unwrap(), 1);
        assert!(matches!(consumer.try_receive(), Err(TryRecvError::Closed)));
        assert!(matches!(consumer.receive(), Err(RecvError::Closed)));
    }

    #[test]
    fn receive_times_out() {
        let tick = ticker::<u32>(4);
        let consumer = tick.subscribe();
        let start = Instant::now();
        assert!(matches!(
            consumer.receive_timeout(Duration::from_millis(20)),
            Err(RecvError::Timeout)
        ));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn send_wakes_parked_fiber_consumer() {
        let tick = ticker::<u32>(4);
        let consumer = tick.subscribe();
        let got = crate::channel::channel::<u32>(1, crate::OverflowPolicy::Block);

        let fiber = {
            let got = got.clone();
            StrandBuilder::new()
                .fiber()
                .spawn(move || got.send(consumer.receive().unwrap()).unwrap())
                .unwrap()
        };

        thread::sleep(Duration::from_millis(20));
        tick.send(42).unwrap();
        fiber.join().unwrap();
        assert_eq!(got.receive().unwrap(), 42);
    }

    #[test]
    fn shared_consumer_reads_each_message_once() {
        const N: u32 = 2000;

        let tick = ticker::<u32>(N as usize);
        let consumer = Arc::new(tick.subscribe());
        for i in 0..N {
            tick.send(i).unwrap();
        }
        tick.close();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let consumer = Arc::clone(&consumer);
                thread::spawn(move || consumer.messages().collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u32> = Vec::new();
        for reader in readers {
            let got = reader.join().unwrap();
            assert!(got.windows(2).all(|w| w[0] < w[1]));
            all.extend(got);
        }
        all.sort_unstable();
        assert_eq!(all, (0..N).collect::<Vec<_>>());
    }
}
