//! Receive-side view of a message source, and combinators over it.
//!
//! [`ReceivePort`] is implemented by [`Channel`] and
//! [`TickerConsumer`](crate::TickerConsumer). The combinators wrap a port and
//! are ports themselves, so they stack:
//!
//! ```
//! use skein_channel::{OverflowPolicy, ReceivePort, channel};
//!
//! let ch = channel::<u32>(8, OverflowPolicy::Block);
//! for i in 1..=6 {
//!     ch.send(i).unwrap();
//! }
//! ch.close();
//!
//! let evens = ch.clone().filter(|v| v % 2 == 0).map(|v| v * 10);
//! assert_eq!(evens.messages().collect::<Vec<_>>(), [20, 40, 60]);
//! ```
//!
//! Combinators transform on the receiving strand. Nothing runs until a
//! message is received.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use skein_strand::{ConditionSynchronizer, WaitError};

use crate::channel::Channel;
use crate::error::{RecvError, TryRecvError};

/// Anything messages can be received from.
pub trait ReceivePort {
    /// Type of the received messages.
    type Message;

    /// Receives without parking.
    ///
    /// # Errors
    ///
    /// [`TryRecvError::Empty`] if nothing is ready, or a closed variant once
    /// the port is closed and drained.
    fn try_receive(&self) -> Result<Self::Message, TryRecvError>;

    /// Receives, parking until a message arrives, the port closes or
    /// `deadline` passes.
    ///
    /// # Errors
    ///
    /// See [`Channel::receive`].
    fn receive_until(&self, deadline: Option<Instant>) -> Result<Self::Message, RecvError>;

    /// Returns `true` once the port will yield no further messages, or will
    /// once drained.
    fn is_closed(&self) -> bool;

    /// Receives, parking as long as it takes.
    fn receive(&self) -> Result<Self::Message, RecvError> {
        self.receive_until(None)
    }

    /// Receives, giving up with [`RecvError::Timeout`] after `timeout`.
    fn receive_timeout(&self, timeout: Duration) -> Result<Self::Message, RecvError> {
        self.receive_until(Some(Instant::now() + timeout))
    }

    /// Blocking iterator that ends once the port is closed and drained.
    fn messages(&self) -> Messages<'_, Self>
    where
        Self: Sized,
    {
        Messages { port: self }
    }

    /// Applies `f` to every received message.
    fn map<F, U>(self, f: F) -> Map<Self, F>
    where
        Self: Sized,
        F: Fn(Self::Message) -> U,
    {
        Map { port: self, f }
    }

    /// Yields only messages for which `predicate` holds. The rest are
    /// received and dropped.
    fn filter<F>(self, predicate: F) -> Filter<Self, F>
    where
        Self: Sized,
        F: Fn(&Self::Message) -> bool,
    {
        Filter {
            port: self,
            predicate,
        }
    }

    /// Yields at most `limit` messages in total, across every strand that
    /// receives from it, then reports itself closed.
    fn take(self, limit: usize) -> Take<Self>
    where
        Self: Sized,
    {
        Take {
            port: self,
            limit,
            reserved: AtomicUsize::new(0),
            taken: AtomicUsize::new(0),
            waiters: ConditionSynchronizer::new("take"),
        }
    }
}

impl<T> ReceivePort for Channel<T> {
    type Message = T;

    fn try_receive(&self) -> Result<T, TryRecvError> {
        Channel::try_receive(self)
    }

    fn receive_until(&self, deadline: Option<Instant>) -> Result<T, RecvError> {
        Channel::receive_until(self, deadline)
    }

    fn is_closed(&self) -> bool {
        Channel::is_closed(self)
    }
}

/// Blocking iterator over a port. See [`ReceivePort::messages`].
pub struct Messages<'a, P> {
    port: &'a P,
}

impl<P: ReceivePort> Iterator for Messages<'_, P> {
    type Item = P::Message;

    fn next(&mut self) -> Option<P::Message> {
        self.port.receive().ok()
    }
}

// ============================================================================
// Map
// ============================================================================

/// Port returned by [`ReceivePort::map`].
pub struct Map<P, F> {
    port: P,
    f: F,
}

impl<P, F, U> ReceivePort for Map<P, F>
where
    P: ReceivePort,
    F: Fn(P::Message) -> U,
{
    type Message = U;

    fn try_receive(&self) -> Result<U, TryRecvError> {
        self.port.try_receive().map(&self.f)
    }

    fn receive_until(&self, deadline: Option<Instant>) -> Result<U, RecvError> {
        self.port.receive_until(deadline).map(&self.f)
    }

    fn is_closed(&self) -> bool {
        self.port.is_closed()
    }
}

impl<P: fmt::Debug, F> fmt::Debug for Map<P, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Filter
// ============================================================================

/// Port returned by [`ReceivePort::filter`].
pub struct Filter<P, F> {
    port: P,
    predicate: F,
}

impl<P, F> ReceivePort for Filter<P, F>
where
    P: ReceivePort,
    F: Fn(&P::Message) -> bool,
{
    type Message = P::Message;

    fn try_receive(&self) -> Result<P::Message, TryRecvError> {
        loop {
            let msg = self.port.try_receive()?;
            if (self.predicate)(&msg) {
                return Ok(msg);
            }
        }
    }

    /// The deadline covers the whole receive, rejected messages included.
    fn receive_until(&self, deadline: Option<Instant>) -> Result<P::Message, RecvError> {
        loop {
            let msg = self.port.receive_until(deadline)?;
            if (self.predicate)(&msg) {
                return Ok(msg);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.port.is_closed()
    }
}

impl<P: fmt::Debug, F> fmt::Debug for Filter<P, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Take
// ============================================================================

/// Port returned by [`ReceivePort::take`].
///
/// A receiver first reserves one of the `limit` messages, then receives from
/// the underlying port. A reservation is returned if that receive fails, and
/// strands waiting for one are woken. While every remaining reservation is
/// held, `try_receive` reports [`TryRecvError::Empty`] and blocking receives
/// park until a holder either succeeds or gives its reservation back.
pub struct Take<P> {
    port: P,
    limit: usize,
    reserved: AtomicUsize,
    taken: AtomicUsize,
    waiters: ConditionSynchronizer,
}

impl<P> Take<P> {
    fn reserve(&self) -> bool {
        self.reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| {
                (r < self.limit).then_some(r + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.reserved.fetch_sub(1, Ordering::SeqCst);
        if self.waiters.has_waiters() {
            self.waiters.signal();
        }
    }

    fn took(&self) {
        if self.taken.fetch_add(1, Ordering::SeqCst) + 1 == self.limit
            && self.waiters.has_waiters()
        {
            self.waiters.signal_all();
        }
    }

    fn exhausted(&self) -> bool {
        self.taken.load(Ordering::SeqCst) >= self.limit
    }

    /// Number of messages yielded so far.
    pub fn taken(&self) -> usize {
        self.taken.load(Ordering::SeqCst)
    }
}

impl<P: ReceivePort> ReceivePort for Take<P> {
    type Message = P::Message;

    fn try_receive(&self) -> Result<P::Message, TryRecvError> {
        if self.exhausted() {
            return Err(TryRecvError::Closed);
        }
        if !self.reserve() {
            return Err(TryRecvError::Empty);
        }
        match self.port.try_receive() {
            Ok(msg) => {
                self.took();
                Ok(msg)
            }
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    fn receive_until(&self, deadline: Option<Instant>) -> Result<P::Message, RecvError> {
        if self.exhausted() {
            return Err(RecvError::Closed);
        }
        if !self.reserve() {
            let reserved = self.waiters.wait_until(
                || self.exhausted() || self.reserve(),
                deadline,
            );
            match reserved {
                Ok(()) => {}
                Err(WaitError::Timeout) => {
                    // Pass on a release signal this strand may have absorbed
                    if self.waiters.has_waiters() {
                        self.waiters.signal();
                    }
                    return Err(RecvError::Timeout);
                }
                Err(WaitError::Interrupted) => return Err(RecvError::Interrupted),
            }
            // Woken by the last message: no reservation was taken
            if self.exhausted() {
                return Err(RecvError::Closed);
            }
        }

        match self.port.receive_until(deadline) {
            Ok(msg) => {
                self.took();
                Ok(msg)
            }
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.exhausted() || self.port.is_closed()
    }
}

impl<P: fmt::Debug> fmt::Debug for Take<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Take")
            .field("port", &self.port)
            .field("limit", &self.limit)
            .field("taken", &self.taken())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{OverflowPolicy, channel};
    use skein_strand::StrandBuilder;
    use std::sync::Arc;
    use std::thread;

    // ============================================================================
    // Map / Filter
    // ============================================================================

    #[test]
    fn map_transforms_in_order() {
        let ch = channel::<u32>(8, OverflowPolicy::Block);
        let plus_ten = ch.clone().map(|v| v + 10);

        for i in 0..5 {
            ch.send(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(plus_ten.receive().unwrap(), i + 10);
        }
        assert!(matches!(plus_ten.try_receive(), Err(TryRecvError::Empty)));

        ch.close();
        assert!(plus_ten.is_closed());
        assert!(matches!(plus_ten.receive(), Err(RecvError::Closed)));
    }

    #[test]
    fn filter_skips_rejected() {
        let ch = channel::<u32>(16, OverflowPolicy::Block);
        let evens = ch.clone().filter(|v| v % 2 == 0);

        for i in 1..=9 {
            ch.send(i).unwrap();
        }
        ch.close();

        assert_eq!(evens.messages().collect::<Vec<_>>(), [2, 4, 6, 8]);
        assert!(ch.is_drained());
    }

    #[test]
    fn filter_try_receive_reports_empty_after_rejects() {
        let ch = channel::<u32>(4, OverflowPolicy::Block);
        let evens = ch.clone().filter(|v| v % 2 == 0);

        ch.send(1).unwrap();
        ch.send(3).unwrap();
        assert!(matches!(evens.try_receive(), Err(TryRecvError::Empty)));
        assert!(ch.is_empty());
    }

    #[test]
    fn filter_with_timeouts() {
        let ch = channel::<u32>(4, OverflowPolicy::Block);
        let evens = ch.clone().filter(|v| v % 2 == 0);

        let producer = {
            let ch = ch.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                ch.send(1).unwrap();
                thread::sleep(Duration::from_millis(50));
                ch.send(2).unwrap();
                thread::sleep(Duration::from_millis(200));
                ch.send(3).unwrap();
                ch.send(4).unwrap();
                ch.close();
            })
        };

        assert!(matches!(
            evens.receive_timeout(Duration::from_millis(10)),
            Err(RecvError::Timeout)
        ));
        assert_eq!(evens.receive_timeout(Duration::from_secs(5)).unwrap(), 2);
        assert!(matches!(
            evens.receive_timeout(Duration::from_millis(20)),
            Err(RecvError::Timeout)
        ));
        assert_eq!(evens.receive_timeout(Duration::from_secs(5)).unwrap(), 4);
        assert!(matches!(evens.receive(), Err(RecvError::Closed)));

        producer.join().unwrap();
    }

    #[test]
    fn map_over_fiber_receiver() {
        let ch = channel::<u32>(4, OverflowPolicy::Block);
        let doubled = ch.clone().map(|v| v * 2);

        let sum = channel::<u32>(1, OverflowPolicy::Block);

        let fiber = {
            let sum = sum.clone();
            StrandBuilder::new()
                .fiber()
                .spawn(move || sum.send(doubled.messages().sum()).unwrap())
                .unwrap()
        };

        for i in 1..=10 {
            ch.send(i).unwrap();
        }
        ch.close();
        fiber.join().unwrap();
        assert_eq!(sum.receive().unwrap(), 110);
    }

    // ============================================================================
    // Take
    // ============================================================================

    #[test]
    fn take_zero_is_closed_at_once() {
        let ch = channel::<u32>(4, OverflowPolicy::Block);
        ch.send(1).unwrap();
        let none = ch.clone().take(0);

        assert!(none.is_closed());
        assert!(matches!(none.try_receive(), Err(TryRecvError::Closed)));
        assert!(matches!(none.receive(), Err(RecvError::Closed)));
        assert_eq!(ch.len(), 1);
    }

    #[test]
    fn take_stops_after_limit() {
        let ch = channel::<u32>(8, OverflowPolicy::Block);
        let first = ch.clone().take(3);

        for i in 0..6 {
            ch.send(i).unwrap();
        }

        assert_eq!(first.messages().collect::<Vec<_>>(), [0, 1, 2]);
        assert!(first.is_closed());
        assert_eq!(first.taken(), 3);
        assert_eq!(ch.len(), 3);
    }

    #[test]
    fn take_try_receive_while_reservation_held() {
        let ch = channel::<u32>(4, OverflowPolicy::Block);
        let one = Arc::new(ch.clone().take(1));

        let holder = {
            let one = Arc::clone(&one);
            thread::spawn(move || one.receive())
        };
        while ch.receivers().waiter_count() == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        // The only reservation is parked on the channel
        assert!(matches!(one.try_receive(), Err(TryRecvError::Empty)));
        assert!(!one.is_closed());

        ch.send(7).unwrap();
        assert_eq!(holder.join().unwrap().unwrap(), 7);
        assert!(one.is_closed());
        assert!(matches!(one.try_receive(), Err(TryRecvError::Closed)));
    }

    #[test]
    fn take_returns_reservation_on_timeout() {
        let ch = channel::<u32>(4, OverflowPolicy::Block);
        let one = ch.clone().take(1);

        assert!(matches!(
            one.receive_timeout(Duration::from_millis(10)),
            Err(RecvError::Timeout)
        ));
        ch.send(9).unwrap();
        assert_eq!(one.try_receive().unwrap(), 9);
    }

    #[test]
    fn take_across_strands_yields_exactly_limit() {
        const LIMIT: usize = 50;

        let ch = channel::<usize>(16, OverflowPolicy::Block);
        let limited = Arc::new(ch.clone().take(LIMIT));
        let received = Arc::new(AtomicUsize::new(0));

        let consumers: Vec<_> = (0..4)
            .map(|i| {
                let limited = Arc::clone(&limited);
                let received = Arc::clone(&received);
                let builder = if i % 2 == 0 {
                    StrandBuilder::new().fiber()
                } else {
                    StrandBuilder::new()
                };
                builder
                    .spawn(move || {
                        for _ in limited.messages() {
                            received.fetch_add(1, Ordering::Relaxed);
                        }
                    })
                    .unwrap()
            })
            .collect();

        let mut sent = 0;
        while !limited.is_closed() {
            if ch.send_timeout(sent, Duration::from_millis(10)).is_ok() {
                sent += 1;
            }
        }
        for consumer in consumers {
            consumer.join().unwrap();
        }

        assert_eq!(received.load(Ordering::Relaxed), LIMIT);
        assert_eq!(limited.taken(), LIMIT);
        assert_eq!(ch.len(), sent - LIMIT);
    }
}
