//! Turning a single-shot callback API into a blocking call.
//!
//! The caller's strand starts the operation through
//! [`AsyncRequest::request_async`], handing it a [`Completion`]. It then parks
//! until some other thread or strand calls [`Completion::complete`] or
//! [`Completion::fail`]. A fiber parks on its own parker, so the wait costs
//! no more than the carrier it already occupies.
//!
//! Completion is decided by a single compare-and-swap on `completed`. The
//! first of complete, fail, timeout or interrupt to win it is authoritative;
//! everything after is ignored. The winner then publishes the result and
//! raises `ready`.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::builder::StrandBuilder;
use crate::error::{AsyncError, Failure, panic_message};
use crate::lock;
use crate::strand::{self, Strand};

const BLOCKER: &str = "fiber-async";

/// An asynchronous operation that reports its outcome through a callback.
///
/// # Example
///
/// ```
/// use skein_strand::{AsyncRequest, Completion, FiberAsync, StrandBuilder};
/// use std::thread;
///
/// struct Lookup(u32);
///
/// impl AsyncRequest for Lookup {
///     type Output = String;
///     type Error = std::io::Error;
///
///     fn request_async(&mut self, completion: Completion<String, std::io::Error>) {
///         let key = self.0;
///         thread::spawn(move || completion.complete(format!("value-{key}")));
///     }
/// }
///
/// let strand = StrandBuilder::new()
///     .fiber()
///     .spawn(|| {
///         let value = FiberAsync::new(Lookup(7)).run().unwrap();
///         assert_eq!(value, "value-7");
///     })
///     .unwrap();
/// strand.join().unwrap();
/// ```
pub trait AsyncRequest: Send {
    /// Value delivered on success.
    type Output: Send + 'static;
    /// Error delivered on failure.
    type Error: Send + 'static;

    /// Starts the operation. Called exactly once per run.
    fn request_async(&mut self, completion: Completion<Self::Output, Self::Error>);

    /// Performs the operation synchronously; used when `run` is called
    /// outside a strand started by this crate.
    fn request_sync(&mut self) -> Result<Self::Output, AsyncError<Self::Error>> {
        Err(AsyncError::IllegalState("not running inside a strand"))
    }

    /// Timed variant of [`request_sync`](Self::request_sync).
    fn request_sync_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Self::Output, AsyncError<Self::Error>> {
        let _ = timeout;
        self.request_sync()
    }

    /// Called when the waiting strand is interrupted. The operation may
    /// still complete; its result is then discarded.
    fn interrupted(&mut self) {}

    /// Called when the wait times out. Override to cancel the operation.
    fn timed_out(&mut self) {}
}

struct State<V, E> {
    completed: AtomicBool,
    ready: AtomicBool,
    slot: Mutex<Option<Result<V, E>>>,
    waiter: Strand,
}

/// Callback handle passed to [`AsyncRequest::request_async`].
///
/// Cloneable and `Send`; any clone may complete the operation, once.
pub struct Completion<V, E> {
    state: Arc<State<V, E>>,
}

impl<V, E> Clone for Completion<V, E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<V, E> Completion<V, E> {
    fn new(waiter: Strand) -> Self {
        Self {
            state: Arc::new(State {
                completed: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                slot: Mutex::new(None),
                waiter,
            }),
        }
    }

    /// Reports success. Returns `false` if the outcome was already decided.
    pub fn complete(&self, value: V) -> bool {
        self.finish(Ok(value))
    }

    /// Reports failure. Returns `false` if the outcome was already decided.
    pub fn fail(&self, error: E) -> bool {
        self.finish(Err(error))
    }

    /// Returns `true` once the outcome is decided.
    pub fn is_completed(&self) -> bool {
        self.state.completed.load(Ordering::SeqCst)
    }

    fn claim(&self) -> bool {
        self.state
            .completed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn finish(&self, result: Result<V, E>) -> bool {
        if !self.claim() {
            trace!(waiter = %self.state.waiter, "late completion ignored");
            return false;
        }
        self.publish(result);
        true
    }

    /// Hands the decided outcome to the waiter.
    fn publish(&self, result: Result<V, E>) {
        *lock(&self.state.slot) = Some(result);
        self.state.ready.store(true, Ordering::SeqCst);
        self.state.waiter.unpark();
    }

    fn take(&self) -> Option<Result<V, E>> {
        if self.state.ready.load(Ordering::SeqCst) {
            lock(&self.state.slot).take()
        } else {
            None
        }
    }
}

impl<V, E> fmt::Debug for Completion<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("completed", &self.is_completed())
            .finish_non_exhaustive()
    }
}

/// Runs an [`AsyncRequest`] as a blocking call on the current strand.
///
/// One `FiberAsync` runs once; a second run fails with
/// [`AsyncError::IllegalState`].
pub struct FiberAsync<R: AsyncRequest> {
    request: R,
    started: bool,
    completion: Option<Completion<R::Output, R::Error>>,
}

impl<R: AsyncRequest> FiberAsync<R> {
    /// Wraps `request`.
    pub fn new(request: R) -> Self {
        Self {
            request,
            started: false,
            completion: None,
        }
    }

    /// Starts the operation and waits for its outcome.
    ///
    /// # Errors
    ///
    /// - [`AsyncError::Failed`] with the error the operation reported.
    /// - [`AsyncError::Interrupted`] if the strand was interrupted.
    /// - [`AsyncError::Panicked`] if `request_async` panicked.
    /// - [`AsyncError::IllegalState`] on reuse.
    pub fn run(&mut self) -> Result<R::Output, AsyncError<R::Error>> {
        self.run_until(None)
    }

    /// Like [`run`](Self::run), giving up with [`AsyncError::Timeout`] after
    /// `timeout`. The operation itself is left running unless
    /// [`AsyncRequest::timed_out`] cancels it.
    pub fn run_timeout(&mut self, timeout: Duration) -> Result<R::Output, AsyncError<R::Error>> {
        self.run_until(Some(timeout))
    }

    /// Returns `true` once the outcome is decided.
    pub fn is_completed(&self) -> bool {
        self.completion.as_ref().is_some_and(Completion::is_completed)
    }

    /// Returns the wrapped request.
    pub fn into_inner(self) -> R {
        self.request
    }

    fn run_until(&mut self, timeout: Option<Duration>) -> Result<R::Output, AsyncError<R::Error>> {
        if self.started {
            return Err(AsyncError::IllegalState("FiberAsync has already been used"));
        }
        self.started = true;

        if !strand::in_strand_context() {
            return match timeout {
                Some(timeout) => self.request.request_sync_timeout(timeout),
                None => self.request.request_sync(),
            };
        }
        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(AsyncError::Timeout);
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        let completion = Completion::new(Strand::current());
        self.completion = Some(completion.clone());

        let callback = completion.clone();
        let request = &mut self.request;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| request.request_async(callback))) {
            if completion.claim() {
                return Err(AsyncError::Panicked(panic_message(&*payload)));
            }
        }

        let mut interrupt_lost = false;
        let result = loop {
            if let Some(result) = completion.take() {
                break result.map_err(AsyncError::Failed);
            }

            if strand::interrupted() {
                if completion.claim() {
                    self.request.interrupted();
                    return Err(AsyncError::Interrupted);
                }
                // The outcome was decided first; the interrupt stays pending
                interrupt_lost = true;
            }
            if completion.is_completed() {
                // Decided but not yet published
                strand::yield_now();
                continue;
            }

            match deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    if completion.claim() {
                        trace!("fiber async timed out");
                        self.request.timed_out();
                        return Err(AsyncError::Timeout);
                    }
                }
                Some(deadline) => strand::park_until(BLOCKER, deadline),
                None => strand::park(BLOCKER),
            }
        };

        if interrupt_lost {
            Strand::current().interrupt();
        }
        result
    }
}

impl<R: AsyncRequest + fmt::Debug> fmt::Debug for FiberAsync<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberAsync")
            .field("request", &self.request)
            .field("started", &self.started)
            .field("completed", &self.is_completed())
            .finish()
    }
}

// ============================================================================
// Blocking work off the current strand
// ============================================================================

struct Blocking<F> {
    work: Option<F>,
}

impl<F, T> AsyncRequest for Blocking<F>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    type Output = T;
    type Error = Failure;

    fn request_async(&mut self, completion: Completion<T, Failure>) {
        let Some(work) = self.work.take() else {
            completion.fail(Failure::Panicked("blocking work already taken".into()));
            return;
        };

        let runner = completion.clone();
        let spawned = StrandBuilder::new().name("blocking").spawn(move || {
            match panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(value) => runner.complete(value),
                Err(payload) => runner.fail(Failure::from_panic(payload)),
            };
        });
        if let Err(e) = spawned {
            completion.fail(Failure::Error(Box::new(e)));
        }
    }

    fn request_sync(&mut self) -> Result<T, AsyncError<Failure>> {
        let work = self
            .work
            .take()
            .ok_or(AsyncError::IllegalState("blocking work already taken"))?;
        panic::catch_unwind(AssertUnwindSafe(work))
            .map_err(|payload| AsyncError::Failed(Failure::from_panic(payload)))
    }
}

/// Runs blocking `work` on a dedicated thread-backed strand while the
/// current strand waits for it as a [`FiberAsync`].
///
/// Outside a strand the work runs inline.
///
/// # Errors
///
/// Returns [`AsyncError::Failed`] with [`Failure::Panicked`] if `work`
/// panics.
pub fn run_blocking<T, F>(work: F) -> Result<T, AsyncError<Failure>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    FiberAsync::new(Blocking { work: Some(work) }).run()
}

/// Like [`run_blocking`], giving up after `timeout`. The work keeps running
/// to completion in the background.
pub fn run_blocking_timeout<T, F>(work: F, timeout: Duration) -> Result<T, AsyncError<Failure>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    FiberAsync::new(Blocking { work: Some(work) }).run_timeout(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct Immediate(Option<Result<u32, String>>);

    impl AsyncRequest for Immediate {
        type Output = u32;
        type Error = String;

        fn request_async(&mut self, completion: Completion<u32, String>) {
            match self.0.take() {
                Some(Ok(v)) => completion.complete(v),
                Some(Err(e)) => completion.fail(e),
                None => false,
            };
        }

        fn request_sync(&mut self) -> Result<u32, AsyncError<String>> {
            Ok(0)
        }
    }

    struct Never;

    impl AsyncRequest for Never {
        type Output = ();
        type Error = ();

        fn request_async(&mut self, _completion: Completion<(), ()>) {}
    }

    fn in_fiber<F: FnOnce() + Send + 'static>(f: F) {
        StrandBuilder::new().fiber().spawn(f).unwrap().join().unwrap();
    }

    #[test]
    fn completes_from_another_thread() {
        struct Delayed;
        impl AsyncRequest for Delayed {
            type Output = &'static str;
            type Error = ();

            fn request_async(&mut self, completion: Completion<&'static str, ()>) {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(20));
                    completion.complete("done");
                });
            }
        }

        in_fiber(|| {
            let mut call = FiberAsync::new(Delayed);
            assert_eq!(call.run().unwrap(), "done");
            assert!(call.is_completed());
        });
    }

    #[test]
    fn failure_is_returned() {
        in_fiber(|| {
            let result = FiberAsync::new(Immediate(Some(Err("nope".into())))).run();
            assert!(matches!(result, Err(AsyncError::Failed(e)) if e == "nope"));
        });
    }

    #[test]
    fn reuse_is_illegal() {
        in_fiber(|| {
            let mut call = FiberAsync::new(Immediate(Some(Ok(1))));
            assert_eq!(call.run().unwrap(), 1);
            assert!(matches!(call.run(), Err(AsyncError::IllegalState(_))));
        });
    }

    #[test]
    fn first_completion_wins() {
        struct DoubleFire;
        impl AsyncRequest for DoubleFire {
            type Output = u32;
            type Error = String;

            fn request_async(&mut self, completion: Completion<u32, String>) {
                assert!(completion.complete(1));
                assert!(!completion.complete(2));
                assert!(!completion.fail("late".into()));
            }
        }

        in_fiber(|| {
            assert_eq!(FiberAsync::new(DoubleFire).run().unwrap(), 1);
        });
    }

    #[test]
    fn timeout_then_late_completion_is_ignored() {
        struct Slow(Arc<Mutex<Option<Completion<u32, ()>>>>);
        impl AsyncRequest for Slow {
            type Output = u32;
            type Error = ();

            fn request_async(&mut self, completion: Completion<u32, ()>) {
                *self.0.lock().unwrap() = Some(completion);
            }
        }

        let stash = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&stash);
        in_fiber(move || {
            let start = Instant::now();
            let result = FiberAsync::new(Slow(inner)).run_timeout(Duration::from_millis(30));
            assert!(matches!(result, Err(AsyncError::Timeout)));
            assert!(start.elapsed() >= Duration::from_millis(30));
        });

        let completion = stash.lock().unwrap().take().unwrap();
        assert!(completion.is_completed());
        assert!(!completion.complete(5));
    }

    #[test]
    fn zero_timeout_fails_without_requesting() {
        in_fiber(|| {
            let mut call = FiberAsync::new(Never);
            assert!(matches!(call.run_timeout(Duration::ZERO), Err(AsyncError::Timeout)));
        });
    }

    #[test]
    fn interrupt_aborts_wait() {
        let strand = StrandBuilder::new()
            .fiber()
            .spawn(|| {
                let result = FiberAsync::new(Never).run();
                assert!(matches!(result, Err(AsyncError::Interrupted)));
            })
            .unwrap();

        while !strand.is_parked() {
            thread::yield_now();
        }
        strand.interrupt();
        strand.join_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn interrupt_after_completion_stays_pending() {
        struct DecidedThenInterrupted;
        impl AsyncRequest for DecidedThenInterrupted {
            type Output = u32;
            type Error = ();

            fn request_async(&mut self, completion: Completion<u32, ()>) {
                // decided, then interrupted, then published
                assert!(completion.claim());
                Strand::current().interrupt();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(20));
                    completion.publish(Ok(5));
                });
            }
        }

        in_fiber(|| {
            let result = FiberAsync::new(DecidedThenInterrupted).run();
            assert!(matches!(result, Ok(5)));
            assert!(strand::interrupted());
            assert!(!strand::interrupted());
        });
    }

    #[test]
    fn panicking_request_is_reported() {
        struct Explodes;
        impl AsyncRequest for Explodes {
            type Output = ();
            type Error = ();

            fn request_async(&mut self, _completion: Completion<(), ()>) {
                panic!("kaboom");
            }
        }

        in_fiber(|| {
            let result = FiberAsync::new(Explodes).run();
            assert!(matches!(result, Err(AsyncError::Panicked(msg)) if msg == "kaboom"));
        });
    }

    #[test]
    fn outside_strand_uses_sync_fallback() {
        thread::spawn(|| {
            let result = FiberAsync::new(Immediate(Some(Ok(9)))).run();
            assert_eq!(result.unwrap(), 0);

            let result = FiberAsync::new(Never).run();
            assert!(matches!(result, Err(AsyncError::IllegalState(_))));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn run_blocking_in_fiber() {
        in_fiber(|| {
            let value = run_blocking(|| {
                thread::sleep(Duration::from_millis(10));
                21 * 2
            })
            .unwrap();
            assert_eq!(value, 42);

            let failed = run_blocking(|| -> u32 { panic!("blocking failed") });
            match failed {
                Err(AsyncError::Failed(f)) => assert_eq!(f.panic_message(), Some("blocking failed")),
                other => panic!("expected failure, got {other:?}"),
            }
        });
    }

    #[test]
    fn run_blocking_timeout_expires() {
        in_fiber(|| {
            let result = run_blocking_timeout(
                || thread::sleep(Duration::from_millis(300)),
                Duration::from_millis(20),
            );
            assert!(matches!(result, Err(AsyncError::Timeout)));
        });
    }
}
