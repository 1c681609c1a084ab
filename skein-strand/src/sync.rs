//! Register / wait / signal synchronization between strands.
//!
//! A [`ConditionSynchronizer`] holds the set of strands waiting for some
//! condition (a channel becoming non-empty, a strand terminating). The set is
//! a copy-on-write snapshot behind an [`ArcSwap`]: registration and removal
//! swap in a new vector, signalling reads the current one without locking.
//! Nobody ever parks while holding a lock on it.
//!
//! # Protocol
//!
//! ```text
//! Waiter:                              Signaller:
//! ─────────────────────                ─────────────────────
//! register()                           make condition true
//! [SeqCst fence]                       [SeqCst fence]
//! check condition -> false             has_waiters() -> true
//! wait()                               signal()
//! ...re-check, wait again...
//! unregister()
//! ```
//!
//! The fences order the registration against the condition check on both
//! sides, so either the waiter sees the condition or the signaller sees the
//! waiter. A wakeup that lands before the waiter parks is kept as the
//! strand's park permit.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering, fence};
use std::time::Instant;

use arc_swap::ArcSwap;
use crossbeam_utils::Backoff;
use tracing::trace;

use crate::error::WaitError;
use crate::strand::{self, Strand, StrandKind};

/// Default number of backoff snooze iterations before a waiter parks.
///
/// Each snooze uses `crossbeam_utils::Backoff::snooze()`, which spins first
/// and then yields to the OS scheduler.
pub const DEFAULT_SNOOZE_ITERS: usize = 8;

/// A one-shot flag shared by all registrations of one multi-way wait.
///
/// Once claimed, signallers skip those registrations and wake someone else.
#[derive(Default)]
pub struct Claim {
    claimed: AtomicBool,
}

impl Claim {
    /// Creates an unclaimed flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the flag. Returns `true` only for the first caller.
    pub fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Returns `true` once claimed.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claim")
            .field("claimed", &self.is_claimed())
            .finish()
    }
}

struct Waiter {
    strand: Strand,
    claim: Option<Arc<Claim>>,
}

impl Waiter {
    fn is_live(&self) -> bool {
        self.claim.as_ref().is_none_or(|c| !c.is_claimed())
    }
}

/// Adaptive wait: snooze for the first few iterations, then park.
///
/// One `Parking` drives one logical wait, however many synchronizers the
/// waiter is registered on.
pub struct Parking {
    backoff: Backoff,
    snooze_iters: usize,
    blocker: &'static str,
}

impl Parking {
    /// Creates a wait that snoozes `snooze_iters` times before parking.
    pub fn new(snooze_iters: usize, blocker: &'static str) -> Self {
        Self {
            backoff: Backoff::new(),
            snooze_iters,
            blocker,
        }
    }

    /// Waits once. `iteration` counts the caller's retries of the same wait.
    ///
    /// Returns normally on any wakeup, including spurious ones.
    ///
    /// # Errors
    ///
    /// - [`WaitError::Timeout`] if `deadline` has passed.
    /// - [`WaitError::Interrupted`] if the current strand was interrupted.
    ///   The flag is cleared.
    pub fn wait(&self, iteration: usize, deadline: Option<Instant>) -> Result<(), WaitError> {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(WaitError::Timeout);
        }
        if strand::interrupted() {
            return Err(WaitError::Interrupted);
        }

        if iteration < self.snooze_iters {
            self.backoff.snooze();
            return Ok(());
        }

        match deadline {
            Some(deadline) => strand::park_until(self.blocker, deadline),
            None => strand::park(self.blocker),
        }

        if strand::interrupted() {
            return Err(WaitError::Interrupted);
        }
        Ok(())
    }
}

/// Proof of registration on a [`ConditionSynchronizer`].
///
/// Owned by the registering strand; hand it back to
/// [`unregister`](ConditionSynchronizer::unregister) when done.
pub struct Registration {
    waiter: Arc<Waiter>,
    parking: Parking,
}

impl Registration {
    /// The registered strand.
    pub fn strand(&self) -> &Strand {
        &self.waiter.strand
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("strand", &self.waiter.strand)
            .finish_non_exhaustive()
    }
}

/// A lock-free waiter set with strand-aware wakeups.
///
/// # Example
///
/// ```
/// use skein_strand::{ConditionSynchronizer, StrandBuilder};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// let cond = Arc::new(ConditionSynchronizer::new("flag"));
/// let flag = Arc::new(AtomicBool::new(false));
///
/// let waiter = {
///     let (cond, flag) = (Arc::clone(&cond), Arc::clone(&flag));
///     StrandBuilder::new()
///         .fiber()
///         .spawn(move || {
///             cond.wait_until(|| flag.load(Ordering::SeqCst), None).unwrap();
///         })
///         .unwrap()
/// };
///
/// flag.store(true, Ordering::SeqCst);
/// cond.signal_all();
/// waiter.join().unwrap();
/// ```
pub struct ConditionSynchronizer {
    waiters: ArcSwap<Vec<Arc<Waiter>>>,
    snooze_iters: usize,
    blocker: &'static str,
}

impl ConditionSynchronizer {
    /// Creates an empty synchronizer. `blocker` names what waiters are
    /// parked on, as reported by [`Strand::blocker`].
    pub fn new(blocker: &'static str) -> Self {
        Self::with_snooze_iters(blocker, DEFAULT_SNOOZE_ITERS)
    }

    /// Creates an empty synchronizer whose waiters snooze `snooze_iters`
    /// times before parking.
    pub fn with_snooze_iters(blocker: &'static str, snooze_iters: usize) -> Self {
        Self {
            waiters: ArcSwap::from_pointee(Vec::new()),
            snooze_iters,
            blocker,
        }
    }

    /// Registers the current strand as a waiter.
    pub fn register(&self) -> Registration {
        self.register_waiter(None)
    }

    /// Registers the current strand on behalf of a multi-way wait. Signals
    /// skip this registration once `claim` is taken.
    pub fn register_claimed(&self, claim: Arc<Claim>) -> Registration {
        self.register_waiter(Some(claim))
    }

    fn register_waiter(&self, claim: Option<Arc<Claim>>) -> Registration {
        let waiter = Arc::new(Waiter {
            strand: Strand::current(),
            claim,
        });

        self.waiters.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&waiter));
            next
        });
        fence(Ordering::SeqCst);
        trace!(blocker = self.blocker, strand = %waiter.strand, "registered");

        Registration {
            waiter,
            parking: Parking::new(self.snooze_iters, self.blocker),
        }
    }

    /// Removes a registration.
    ///
    /// # Panics
    ///
    /// Panics if `registration` is not registered on this synchronizer.
    pub fn unregister(&self, registration: Registration) {
        let target = &registration.waiter;
        assert!(
            self.waiters.load().iter().any(|w| Arc::ptr_eq(w, target)),
            "illegal state: unregister without matching register on {:?}",
            self.blocker
        );

        self.waiters.rcu(|current| {
            current
                .iter()
                .filter(|w| !Arc::ptr_eq(w, target))
                .cloned()
                .collect::<Vec<_>>()
        });
        trace!(blocker = self.blocker, strand = %target.strand, "unregistered");
    }

    /// Waits once on behalf of `registration`; see [`Parking::wait`].
    pub fn wait(
        &self,
        registration: &Registration,
        iteration: usize,
        deadline: Option<Instant>,
    ) -> Result<(), WaitError> {
        registration.parking.wait(iteration, deadline)
    }

    /// Waits until `predicate` holds, registering for the duration.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError`] on deadline or interrupt.
    pub fn wait_until<P>(&self, mut predicate: P, deadline: Option<Instant>) -> Result<(), WaitError>
    where
        P: FnMut() -> bool,
    {
        if predicate() {
            return Ok(());
        }

        let registration = self.register();
        let mut iteration = 0;
        let result = loop {
            if predicate() {
                break Ok(());
            }
            if let Err(e) = self.wait(&registration, iteration, deadline) {
                break Err(e);
            }
            iteration += 1;
        };
        self.unregister(registration);
        result
    }

    /// Returns `true` if any strand is registered.
    pub fn has_waiters(&self) -> bool {
        fence(Ordering::SeqCst);
        !self.waiters.load().is_empty()
    }

    /// Number of registered waiters, claimed ones included.
    pub fn waiter_count(&self) -> usize {
        self.waiters.load().len()
    }

    /// Wakes one waiter, in registration order.
    ///
    /// Registrations whose claim is taken are skipped. A fiber is woken only
    /// if it is confirmed parked; a thread is woken regardless, since whether
    /// it has reached its park cannot be observed atomically. If no waiter
    /// qualifies, the first live one gets the permit so that a waiter between
    /// its last check and its park is not missed.
    pub fn signal(&self) {
        fence(Ordering::SeqCst);
        let waiters = self.waiters.load();
        let mut fallback = None;

        for waiter in waiters.iter().filter(|w| w.is_live()) {
            match waiter.strand.kind() {
                StrandKind::Thread => {
                    waiter.strand.unpark();
                    return;
                }
                StrandKind::Fiber if waiter.strand.is_parked() => {
                    waiter.strand.unpark();
                    return;
                }
                StrandKind::Fiber => {
                    fallback.get_or_insert(waiter);
                }
            }
        }

        if let Some(waiter) = fallback {
            waiter.strand.unpark();
        }
    }

    /// Wakes every live waiter.
    pub fn signal_all(&self) {
        fence(Ordering::SeqCst);
        for waiter in self.waiters.load().iter().filter(|w| w.is_live()) {
            waiter.strand.unpark();
        }
    }
}

impl fmt::Debug for ConditionSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionSynchronizer")
            .field("blocker", &self.blocker)
            .field("waiters", &self.waiter_count())
            .finish()
    }
}
