//! # skein-strand
//!
//! One abstraction over two kinds of execution context: OS threads and
//! fibers multiplexed onto a pool of carrier threads. Both are [`Strand`]s
//! with the same identity, lifecycle, park/unpark and failure contract, so
//! blocking primitives built on top (channels, selectors, async adapters)
//! never need to know which kind they are suspending.
//!
//! ## Contents
//!
//! | Item | Purpose |
//! |------|---------|
//! | [`Strand`], [`StrandBuilder`] | create, start, join, interrupt, cancel |
//! | [`FiberScheduler`] | elastic carrier pool for fiber-backed strands |
//! | [`park`], [`unpark`], [`sleep`], [`interrupted`] | operations on the current strand |
//! | [`ConditionSynchronizer`] | lock-free waiter set with register / wait / signal |
//! | [`FiberAsync`] | callback-to-blocking adapter |
//! | [`StrandFactory`] | spawn workers without fixing their kind |
//!
//! ## Failures
//!
//! A panic or `Err` escaping a strand body is captured, never rethrown into
//! unrelated code. It is delivered to joiners as [`StrandError::Failed`] and,
//! if no joiner is waiting, to the uncaught failure handler (per strand,
//! else process-wide, else an `error!` log).
//!
//! ```
//! use skein_strand::{StrandBuilder, StrandError};
//!
//! let strand = StrandBuilder::new()
//!     .uncaught_exception_handler(|_, _| {})
//!     .spawn(|| panic!("boom"))
//!     .unwrap();
//!
//! match strand.join() {
//!     Err(StrandError::Failed(failure)) => {
//!         assert_eq!(failure.cause().panic_message(), Some("boom"));
//!     }
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```
//!
//! ## Parking
//!
//! Park permits follow `std::thread::park` semantics: one permit, wakeups may
//! be spurious, so callers re-check their condition in a loop. Interrupting a
//! strand sets its flag and wakes it.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod builder;
mod error;
mod factory;
mod fiber_async;
pub mod registry;
mod scheduler;
mod strand;
mod sync;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use builder::{StrandBuilder, spawn, spawn_fiber};
pub use error::{AsyncError, Failure, StrandError, StrandFailure, WaitError};
pub use factory::StrandFactory;
pub use fiber_async::{AsyncRequest, Completion, FiberAsync, run_blocking, run_blocking_timeout};
pub use scheduler::{
    DEFAULT_FIBER_STACK_SIZE, DEFAULT_KEEP_ALIVE, FiberScheduler, FiberSchedulerBuilder,
};
pub use strand::{
    DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY, Strand, StrandId, StrandKind, StrandState,
    UncaughtHandler, clear_default_uncaught_exception_handler, current_id,
    default_uncaught_exception_handler, in_strand_context, interrupted, park, park_timeout,
    park_until, set_default_uncaught_exception_handler, sleep, unpark, yield_now,
};
pub use sync::{Claim, ConditionSynchronizer, DEFAULT_SNOOZE_ITERS, Parking, Registration};

/// Locks `mutex`, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
