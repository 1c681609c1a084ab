//! The channel: a buffer, an overflow policy and two waiter sets.
//!
//! # Protocol
//!
//! ```text
//! send(msg)                               receive()
//!   in_flight += 1                          pop ──▶ Some: wake a sender, done
//!   closed? ──▶ Closed(msg)                 closed && in_flight == 0?
//!   push per policy                           └─▶ pop again, else Closed
//!   in_flight -= 1                          register on receivers
//!   wake a receiver if any waits            loop { pop, wait }
//!                                           unregister, forward
//! ```
//!
//! The in-flight counter closes the window between a sender passing the
//! closed check and its element becoming visible: a receiver reports the
//! closed sentinel only when no such send can still land.
//!
//! A waiter that leaves (success, timeout or interrupt) may have absorbed a
//! signal meant for another waiter. On the way out it forwards one signal if
//! the channel is still ready for the others.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use skein_queue::Full;
use skein_strand::{ConditionSynchronizer, DEFAULT_SNOOZE_ITERS, WaitError};
use tracing::{debug, trace};

use crate::buffer::Buffer;
use crate::error::{Cause, RecvError, SendError, TryRecvError, TrySendError, terminal};

/// What a bounded channel does with a send into a full buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OverflowPolicy {
    /// Park the sender until space frees up.
    #[default]
    Block,
    /// Fail with [`SendError::CapacityExceeded`], leaving the buffer unchanged.
    Throw,
    /// Discard the new message and report success.
    Drop,
    /// Evict the oldest buffered message and enqueue the new one.
    Displace,
}

struct Shared<T> {
    buffer: Buffer<T>,
    policy: OverflowPolicy,
    closed: CachePadded<AtomicBool>,
    /// Set once, by the first close. `Some` for an exceptional close.
    cause: OnceLock<Option<Cause>>,
    /// Senders between their closed check and the end of their push.
    in_flight: CachePadded<AtomicUsize>,
    receivers: ConditionSynchronizer,
    senders: ConditionSynchronizer,
    /// Deadline of a timer channel.
    fires_at: Option<Instant>,
}

/// A multi-producer multi-consumer channel.
///
/// Cloning yields another handle to the same channel. Blocking operations
/// park the calling strand, thread- or fiber-backed, and never hold a lock
/// while parked.
///
/// # Example
///
/// ```
/// use skein_channel::{channel, OverflowPolicy, RecvError};
/// use skein_strand::StrandBuilder;
///
/// let ch = channel::<u32>(4, OverflowPolicy::Block);
///
/// let producer = {
///     let ch = ch.clone();
///     StrandBuilder::new()
///         .fiber()
///         .spawn(move || {
///             for i in 0..10 {
///                 ch.send(i).unwrap();
///             }
///             ch.close();
///         })
///         .unwrap()
/// };
///
/// let received: Vec<u32> = ch.iter().collect();
/// assert_eq!(received, (0..10).collect::<Vec<_>>());
/// assert!(matches!(ch.receive(), Err(RecvError::Closed)));
/// producer.join().unwrap();
/// ```
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Configures a [`Channel`].
///
/// Defaults: unbounded, [`OverflowPolicy::Block`], many producers, many
/// consumers, [`DEFAULT_SNOOZE_ITERS`] backoff snoozes before parking.
#[derive(Debug, Clone)]
pub struct ChannelBuilder {
    capacity: Option<usize>,
    policy: OverflowPolicy,
    single_producer: bool,
    single_consumer: bool,
    snooze_iters: usize,
}

impl Default for ChannelBuilder {
    fn default() -> Self {
        Self {
            capacity: None,
            policy: OverflowPolicy::Block,
            single_producer: false,
            single_consumer: false,
            snooze_iters: DEFAULT_SNOOZE_ITERS,
        }
    }
}

impl ChannelBuilder {
    /// Returns a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds the buffer to exactly `capacity` messages.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Lets the buffer grow without bound.
    pub fn unbounded(mut self) -> Self {
        self.capacity = None;
        self
    }

    /// Overflow policy of a bounded channel.
    pub fn policy(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Promises that only one strand ever sends.
    pub fn single_producer(mut self, single: bool) -> Self {
        self.single_producer = single;
        self
    }

    /// Promises that only one strand ever receives.
    pub fn single_consumer(mut self, single: bool) -> Self {
        self.single_consumer = single;
        self
    }

    /// Backoff snoozes before a blocked sender or receiver parks.
    pub fn snooze_iters(mut self, iters: usize) -> Self {
        self.snooze_iters = iters;
        self
    }

    /// Creates the channel.
    ///
    /// # Panics
    ///
    /// Panics if a capacity of 0 was requested.
    pub fn build<T>(self) -> Channel<T> {
        assert!(self.capacity != Some(0), "capacity must be non-zero");
        let buffer = Buffer::new(
            self.capacity,
            self.policy,
            self.single_producer,
            self.single_consumer,
        );
        Channel::from_parts(buffer, self.policy, self.snooze_iters, None)
    }
}

/// Creates a bounded channel shared by any number of senders and receivers.
///
/// # Panics
///
/// Panics if `capacity` is 0.
pub fn channel<T>(capacity: usize, policy: OverflowPolicy) -> Channel<T> {
    ChannelBuilder::new().capacity(capacity).policy(policy).build()
}

/// Creates an unbounded channel. Sends never block.
pub fn unbounded<T>() -> Channel<T> {
    ChannelBuilder::new().build()
}

/// Creates a timer channel: it never holds a message and reads as closed
/// from `duration` after now. Sends to it fail with [`SendError::Closed`].
///
/// Used as a select candidate, its receive commits when the timer fires.
///
/// ```
/// use skein_channel::{timeout, RecvError};
/// use std::time::{Duration, Instant};
///
/// let start = Instant::now();
/// let timer = timeout::<()>(Duration::from_millis(20));
/// assert!(matches!(timer.receive(), Err(RecvError::Closed)));
/// assert!(start.elapsed() >= Duration::from_millis(20));
/// ```
pub fn timeout<T>(duration: Duration) -> Channel<T> {
    let fires_at = Instant::now() + duration;
    let buffer = Buffer::new(None, OverflowPolicy::Block, false, false);
    Channel::from_parts(buffer, OverflowPolicy::Block, 0, Some(fires_at))
}

/// Earlier of two optional deadlines.
pub(crate) fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl<T> Channel<T> {
    fn from_parts(
        buffer: Buffer<T>,
        policy: OverflowPolicy,
        snooze_iters: usize,
        fires_at: Option<Instant>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                buffer,
                policy,
                closed: CachePadded::new(AtomicBool::new(false)),
                cause: OnceLock::new(),
                in_flight: CachePadded::new(AtomicUsize::new(0)),
                receivers: ConditionSynchronizer::with_snooze_iters("channel receive", snooze_iters),
                senders: ConditionSynchronizer::with_snooze_iters("channel send", snooze_iters),
                fires_at,
            }),
        }
    }

    // ============================================================================
    // Sending
    // ============================================================================

    /// Sends a message, applying the overflow policy if the buffer is full.
    ///
    /// # Errors
    ///
    /// - [`SendError::Closed`] if the channel is closed.
    /// - [`SendError::CapacityExceeded`] under [`OverflowPolicy::Throw`].
    /// - [`SendError::Interrupted`] if the strand was interrupted while
    ///   parked under [`OverflowPolicy::Block`].
    pub fn send(&self, msg: T) -> Result<(), SendError<T>> {
        self.send_until(msg, None)
    }

    /// Like [`send`](Self::send), but gives up with [`SendError::Timeout`]
    /// once `timeout` has passed.
    pub fn send_timeout(&self, msg: T, timeout: Duration) -> Result<(), SendError<T>> {
        self.send_until(msg, Some(Instant::now() + timeout))
    }

    /// Sends without parking.
    ///
    /// [`OverflowPolicy::Drop`] and [`OverflowPolicy::Displace`] apply here
    /// too; `Block` and `Throw` report [`TrySendError::Full`].
    pub fn try_send(&self, msg: T) -> Result<(), TrySendError<T>> {
        self.offer(msg)
    }

    fn send_until(&self, msg: T, deadline: Option<Instant>) -> Result<(), SendError<T>> {
        let mut msg = match self.offer(msg) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(m)) => return Err(SendError::Closed(m)),
            Err(TrySendError::Full(m)) => m,
        };
        if self.shared.policy == OverflowPolicy::Throw {
            return Err(SendError::CapacityExceeded(msg));
        }

        let senders = &self.shared.senders;
        let registration = senders.register();
        let mut iteration = 0;
        let result = loop {
            msg = match self.offer(msg) {
                Ok(()) => break Ok(()),
                Err(TrySendError::Closed(m)) => break Err(SendError::Closed(m)),
                Err(TrySendError::Full(m)) => m,
            };
            match senders.wait(&registration, iteration, deadline) {
                Ok(()) => {}
                Err(WaitError::Timeout) => break Err(SendError::Timeout(msg)),
                Err(WaitError::Interrupted) => break Err(SendError::Interrupted(msg)),
            }
            iteration += 1;
        };
        senders.unregister(registration);
        self.forward_to_senders();
        result
    }

    /// One non-blocking send attempt with the policy applied.
    pub(crate) fn offer(&self, msg: T) -> Result<(), TrySendError<T>> {
        let shared = &*self.shared;
        if shared.fires_at.is_some() {
            return Err(TrySendError::Closed(msg));
        }

        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = if shared.closed.load(Ordering::SeqCst) {
            Err(TrySendError::Closed(msg))
        } else {
            self.push(msg)
        };
        let last = shared.in_flight.fetch_sub(1, Ordering::SeqCst) == 1;

        if result.is_ok() && shared.receivers.has_waiters() {
            shared.receivers.signal();
        }
        // Receivers seeing a closed channel with sends in flight wait for us
        if last && shared.closed.load(Ordering::SeqCst) {
            shared.receivers.signal_all();
        }
        result
    }

    fn push(&self, msg: T) -> Result<(), TrySendError<T>> {
        let buffer = &self.shared.buffer;
        match self.shared.policy {
            OverflowPolicy::Block | OverflowPolicy::Throw => {
                buffer.try_push(msg).map_err(|Full(m)| TrySendError::Full(m))
            }
            OverflowPolicy::Drop => {
                if let Err(Full(dropped)) = buffer.try_push(msg) {
                    trace!(capacity = ?buffer.capacity(), "channel full, message dropped");
                    drop(dropped);
                }
                Ok(())
            }
            OverflowPolicy::Displace => {
                let mut msg = msg;
                loop {
                    match buffer.try_push(msg) {
                        Ok(()) => return Ok(()),
                        Err(Full(m)) => msg = m,
                    }
                    if buffer.evict_oldest().is_some() {
                        trace!(capacity = ?buffer.capacity(), "channel full, oldest message displaced");
                    }
                }
            }
        }
    }

    // ============================================================================
    // Receiving
    // ============================================================================

    /// Receives the oldest message, parking while the channel is empty.
    ///
    /// # Errors
    ///
    /// - [`RecvError::Closed`] or [`RecvError::ClosedExceptionally`] once the
    ///   channel is closed and drained.
    /// - [`RecvError::Interrupted`] if the strand was interrupted while parked.
    pub fn receive(&self) -> Result<T, RecvError> {
        self.receive_until(None)
    }

    /// Like [`receive`](Self::receive), but gives up with
    /// [`RecvError::Timeout`] once `timeout` has passed.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<T, RecvError> {
        self.receive_until(Some(Instant::now() + timeout))
    }

    /// Receives without parking.
    pub fn try_receive(&self) -> Result<T, TryRecvError> {
        let shared = &*self.shared;
        if let Some(msg) = shared.buffer.try_pop() {
            self.taken();
            return Ok(msg);
        }

        if shared.closed.load(Ordering::SeqCst) {
            if shared.in_flight.load(Ordering::SeqCst) > 0 {
                return Err(TryRecvError::Empty);
            }
            // Anything pushed before the last in-flight send finished is visible now
            if let Some(msg) = shared.buffer.try_pop() {
                self.taken();
                return Ok(msg);
            }
            return Err(self.closed_error());
        }

        if shared.fires_at.is_some_and(|at| Instant::now() >= at) {
            return Err(TryRecvError::Closed);
        }
        Err(TryRecvError::Empty)
    }

    pub(crate) fn receive_until(&self, deadline: Option<Instant>) -> Result<T, RecvError> {
        match self.try_receive() {
            Ok(msg) => return Ok(msg),
            Err(TryRecvError::Empty) => {}
            Err(e) => return Err(terminal(e)),
        }

        let shared = &*self.shared;
        let park_deadline = earliest(deadline, shared.fires_at);
        let registration = shared.receivers.register();
        let mut iteration = 0;
        let result = loop {
            match self.try_receive() {
                Ok(msg) => break Ok(msg),
                Err(TryRecvError::Empty) => {}
                Err(e) => break Err(terminal(e)),
            }
            match shared.receivers.wait(&registration, iteration, park_deadline) {
                Ok(()) => {}
                // the timer fired first; the next attempt sees it closed
                Err(WaitError::Timeout) if deadline.is_none_or(|d| Instant::now() < d) => {}
                Err(WaitError::Timeout) => break Err(RecvError::Timeout),
                Err(WaitError::Interrupted) => break Err(RecvError::Interrupted),
            }
            iteration += 1;
        };
        shared.receivers.unregister(registration);
        self.forward_to_receivers();
        result
    }

    /// A message left the buffer: a parked sender may proceed.
    #[inline]
    fn taken(&self) {
        if self.shared.senders.has_waiters() {
            self.shared.senders.signal();
        }
    }

    fn closed_error(&self) -> TryRecvError {
        match self.shared.cause.get() {
            Some(Some(cause)) => TryRecvError::ClosedExceptionally(Arc::clone(cause)),
            _ => TryRecvError::Closed,
        }
    }

    /// Iterates over received messages until the channel is closed and
    /// drained. Ends early on interrupt.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { channel: self }
    }

    // ============================================================================
    // Wakeup forwarding
    // ============================================================================

    pub(crate) fn forward_to_receivers(&self) {
        let shared = &*self.shared;
        if !shared.buffer.is_empty() && shared.receivers.has_waiters() {
            shared.receivers.signal();
        }
    }

    pub(crate) fn forward_to_senders(&self) {
        let shared = &*self.shared;
        if !shared.buffer.is_full() && shared.senders.has_waiters() {
            shared.senders.signal();
        }
    }

    pub(crate) fn receivers(&self) -> &ConditionSynchronizer {
        &self.shared.receivers
    }

    pub(crate) fn senders(&self) -> &ConditionSynchronizer {
        &self.shared.senders
    }

    pub(crate) fn fires_at(&self) -> Option<Instant> {
        self.shared.fires_at
    }

    // ============================================================================
    // Closing
    // ============================================================================

    /// Closes the channel. Further sends fail; buffered messages stay
    /// receivable, after which receives report [`RecvError::Closed`].
    ///
    /// Idempotent. Only the first close, plain or exceptional, takes effect.
    pub fn close(&self) {
        self.close_inner(None);
    }

    /// Closes the channel with an error. Once drained, receives report
    /// [`RecvError::ClosedExceptionally`] carrying `cause`.
    pub fn close_with(&self, cause: Cause) {
        self.close_inner(Some(cause));
    }

    fn close_inner(&self, cause: Option<Cause>) {
        let shared = &*self.shared;
        let exceptional = cause.is_some();
        if shared.cause.set(cause).is_err() {
            return;
        }
        shared.closed.store(true, Ordering::SeqCst);
        debug!(
            queue = shared.buffer.kind(),
            buffered = shared.buffer.len(),
            exceptional,
            "channel closed"
        );

        shared.receivers.signal_all();
        shared.senders.signal_all();
    }

    /// The error the channel was closed with, if it was closed exceptionally.
    pub fn close_cause(&self) -> Option<Cause> {
        self.shared.cause.get().cloned().flatten()
    }

    /// Returns `true` once the channel is closed for sending. A timer
    /// channel reports closed from its deadline on.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
            || self.shared.fires_at.is_some_and(|at| Instant::now() >= at)
    }

    /// Returns `true` once the channel is closed and every message has been
    /// received.
    pub fn is_drained(&self) -> bool {
        self.is_closed()
            && self.shared.in_flight.load(Ordering::SeqCst) == 0
            && self.shared.buffer.is_empty()
    }

    // ============================================================================
    // Observation
    // ============================================================================

    /// Number of buffered messages. A snapshot.
    pub fn len(&self) -> usize {
        self.shared.buffer.len()
    }

    /// Returns `true` if nothing is buffered. A snapshot.
    pub fn is_empty(&self) -> bool {
        self.shared.buffer.is_empty()
    }

    /// The bound on buffered messages, `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.shared.buffer.capacity()
    }

    /// The overflow policy fixed at construction.
    pub fn policy(&self) -> OverflowPolicy {
        self.shared.policy
    }

    /// Returns `true` if both handles refer to the same channel.
    pub fn same_channel(&self, other: &Channel<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("queue", &self.shared.buffer.kind())
            .field("policy", &self.shared.policy)
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Blocking iterator over a channel's messages. See [`Channel::iter`].
pub struct Iter<'a, T> {
    channel: &'a Channel<T>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.channel.receive().ok()
    }
}

impl<'a, T> IntoIterator for &'a Channel<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}
