//! The strand handle, its lifecycle and the per-thread execution context.
//!
//! # Lifecycle
//!
//! ```text
//!           start()                 body returns / panics
//!   NEW ──────────────▶ STARTED ─────────────────────────▶ TERMINATED
//!    │                                                          ▲
//!    └──────────────────────── cancel() ────────────────────────┘
//! ```
//!
//! Termination is irreversible. The outcome is published before the state
//! flips and before joiners are signalled, so a joiner that wakes always
//! finds it.
//!
//! # Parking
//!
//! Every strand owns a crossbeam [`Parker`]. The parker lives in the
//! thread-local context of whichever OS thread is running the strand (its
//! own thread, or a carrier borrowed from a [`FiberScheduler`]); the matching
//! [`Unparker`] lives in the shared handle. `parked` is raised with `SeqCst`
//! before the park and lowered after it, which is what lets a signaller tell
//! a confirmed-parked fiber from one that is still spinning.

use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use crossbeam_utils::CachePadded;
use crossbeam_utils::sync::{Parker, Unparker};
use tracing::{debug, error, trace, warn};

use crate::error::{Failure, StrandError, StrandFailure};
use crate::scheduler::FiberScheduler;
use crate::sync::ConditionSynchronizer;
use crate::{lock, registry};

/// Lowest strand priority.
pub const MIN_PRIORITY: u8 = 1;
/// Highest strand priority.
pub const MAX_PRIORITY: u8 = 10;
/// Priority of strands that don't ask for one.
pub const DEFAULT_PRIORITY: u8 = 5;

const NEW: u8 = 0;
const STARTED: u8 = 1;
const TERMINATED: u8 = 2;
/// Terminated without ever running.
const CANCELLED: u8 = 3;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

static DEFAULT_HANDLER: ArcSwapOption<UncaughtHandler> = ArcSwapOption::const_empty();

thread_local! {
    static CONTEXT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Handler invoked with a strand's uncaught failure.
pub type UncaughtHandler = Arc<dyn Fn(&Strand, &StrandFailure) + Send + Sync>;

pub(crate) type Body = Box<dyn FnOnce() -> Result<(), Failure> + Send>;

/// Process-unique strand identity. Ids are never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct StrandId(u64);

impl StrandId {
    fn next() -> Self {
        StrandId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StrandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a strand runs on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StrandKind {
    /// A dedicated OS thread.
    Thread,
    /// A carrier thread borrowed from a [`FiberScheduler`].
    Fiber,
}

/// Lifecycle state of a strand.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StrandState {
    /// Created, not yet started.
    New,
    /// Running or parked.
    Started,
    /// Finished, failed, or cancelled before start.
    Terminated,
}

enum Outcome {
    Completed,
    Failed(StrandFailure),
    Cancelled,
}

pub(crate) enum Launch {
    Thread { stack_size: Option<usize> },
    Fiber(FiberScheduler),
}

struct Inner {
    id: StrandId,
    name: String,
    kind: StrandKind,
    /// `None` for adopted threads.
    launch: Option<Launch>,
    priority: AtomicU8,
    state: AtomicU8,
    interrupted: AtomicBool,
    parked: CachePadded<AtomicBool>,
    blocker: Mutex<Option<&'static str>>,
    unparker: Unparker,
    /// Moved into the running context at start.
    parker: Mutex<Option<Parker>>,
    body: Mutex<Option<Body>>,
    outcome: OnceLock<Outcome>,
    joiners: ConditionSynchronizer,
    handler: ArcSwapOption<UncaughtHandler>,
}

/// A handle to a thread- or fiber-backed execution context.
///
/// Handles are cheap to clone and compare by id.
///
/// # Example
///
/// ```
/// use skein_strand::StrandBuilder;
///
/// let strand = StrandBuilder::new()
///     .name("worker")
///     .fiber()
///     .spawn(|| {
///         // runs on a carrier thread
///     })
///     .unwrap();
///
/// strand.join().unwrap();
/// assert!(strand.is_terminated());
/// ```
#[derive(Clone)]
pub struct Strand {
    inner: Arc<Inner>,
}

pub(crate) struct Spawn {
    pub(crate) name: Option<String>,
    pub(crate) priority: u8,
    pub(crate) launch: Launch,
    pub(crate) handler: Option<UncaughtHandler>,
    pub(crate) body: Body,
}

impl Strand {
    pub(crate) fn new(spawn: Spawn) -> Strand {
        let Spawn {
            name,
            priority,
            launch,
            handler,
            body,
        } = spawn;

        let id = StrandId::next();
        let kind = match launch {
            Launch::Thread { .. } => StrandKind::Thread,
            Launch::Fiber(_) => StrandKind::Fiber,
        };
        let name = name.unwrap_or_else(|| match kind {
            StrandKind::Thread => format!("strand-{id}"),
            StrandKind::Fiber => format!("fiber-{id}"),
        });
        let parker = Parker::new();

        Strand {
            inner: Arc::new(Inner {
                id,
                name,
                kind,
                launch: Some(launch),
                priority: AtomicU8::new(priority),
                state: AtomicU8::new(NEW),
                interrupted: AtomicBool::new(false),
                parked: CachePadded::new(AtomicBool::new(false)),
                blocker: Mutex::new(None),
                unparker: parker.unparker().clone(),
                parker: Mutex::new(Some(parker)),
                body: Mutex::new(Some(body)),
                outcome: OnceLock::new(),
                joiners: ConditionSynchronizer::new("join"),
                handler: ArcSwapOption::new(handler.map(Arc::new)),
            }),
        }
    }

    /// Wraps the calling OS thread, which was not started through this crate.
    fn adopt(parker: &Parker) -> Strand {
        let id = StrandId::next();
        let name = thread::current()
            .name()
            .map_or_else(|| format!("thread-{id}"), str::to_owned);

        Strand {
            inner: Arc::new(Inner {
                id,
                name,
                kind: StrandKind::Thread,
                launch: None,
                priority: AtomicU8::new(DEFAULT_PRIORITY),
                state: AtomicU8::new(STARTED),
                interrupted: AtomicBool::new(false),
                parked: CachePadded::new(AtomicBool::new(false)),
                blocker: Mutex::new(None),
                unparker: parker.unparker().clone(),
                parker: Mutex::new(None),
                body: Mutex::new(None),
                outcome: OnceLock::new(),
                joiners: ConditionSynchronizer::new("join"),
                handler: ArcSwapOption::empty(),
            }),
        }
    }

    /// Returns the strand running on the calling thread.
    ///
    /// A plain OS thread is adopted on first call: it gets an id, becomes a
    /// thread-backed strand and stays in the registry until it exits.
    pub fn current() -> Strand {
        with_context(|ctx| ctx.strand.clone())
    }

    /// Looks up a live strand by id.
    pub fn of(id: StrandId) -> Option<Strand> {
        registry::lookup(id)
    }

    /// The strand's id.
    #[inline]
    pub fn id(&self) -> StrandId {
        self.inner.id
    }

    /// The strand's name, fixed at creation.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the strand runs on its own thread or on a carrier.
    #[inline]
    pub fn kind(&self) -> StrandKind {
        self.inner.kind
    }

    /// Returns `true` for fiber-backed strands.
    #[inline]
    pub fn is_fiber(&self) -> bool {
        self.inner.kind == StrandKind::Fiber
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StrandState {
        match self.inner.state.load(Ordering::SeqCst) {
            NEW => StrandState::New,
            STARTED => StrandState::Started,
            _ => StrandState::Terminated,
        }
    }

    /// Returns `true` once the strand has started and until it terminates.
    pub fn is_alive(&self) -> bool {
        self.state() == StrandState::Started
    }

    /// Returns `true` once the strand has terminated.
    pub fn is_terminated(&self) -> bool {
        self.state() == StrandState::Terminated
    }

    /// The strand's priority, between [`MIN_PRIORITY`] and [`MAX_PRIORITY`].
    pub fn priority(&self) -> u8 {
        self.inner.priority.load(Ordering::Relaxed)
    }

    /// Changes the strand's priority.
    ///
    /// # Errors
    ///
    /// Returns [`StrandError::InvalidArgument`] if `priority` is out of range.
    pub fn set_priority(&self, priority: u8) -> Result<(), StrandError> {
        check_priority(priority)?;
        self.inner.priority.store(priority, Ordering::Relaxed);
        Ok(())
    }

    /// Starts the strand.
    ///
    /// Starting a strand that was cancelled before it started does nothing.
    ///
    /// # Errors
    ///
    /// - [`StrandError::IllegalState`] if the strand was already started.
    /// - [`StrandError::Spawn`] if no thread could be created for it. The
    ///   strand is then terminated as cancelled.
    pub fn start(&self) -> Result<(), StrandError> {
        match self
            .inner
            .state
            .compare_exchange(NEW, STARTED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {}
            Err(CANCELLED) => return Ok(()),
            Err(_) => return Err(StrandError::IllegalState("strand already started")),
        }

        let body = lock(&self.inner.body).take();
        let parker = lock(&self.inner.parker).take();
        let (Some(body), Some(parker), Some(launch)) = (body, parker, &self.inner.launch) else {
            return Err(StrandError::IllegalState("strand cannot be started"));
        };

        registry::insert(self);
        debug!(strand = %self, kind = ?self.kind(), "strand started");

        let task = Task {
            strand: self.clone(),
            parker,
            body,
        };
        let launched = match launch {
            Launch::Thread { stack_size } => spawn_thread(task, *stack_size),
            Launch::Fiber(scheduler) => scheduler.submit(task),
        };

        launched.map_err(|e| {
            warn!(strand = %self, error = %e, "failed to launch strand");
            self.finish(Outcome::Cancelled);
            StrandError::Spawn(e)
        })
    }

    /// Waits for the strand to terminate.
    ///
    /// # Errors
    ///
    /// - [`StrandError::Failed`] wrapping the cause if the body failed.
    /// - [`StrandError::Cancelled`] if it was cancelled before starting.
    /// - [`StrandError::Interrupted`] if the caller was interrupted.
    /// - [`StrandError::IllegalState`] if a strand joins itself.
    pub fn join(&self) -> Result<(), StrandError> {
        self.join_until(None)
    }

    /// Like [`join`](Self::join) but gives up with [`StrandError::Timeout`]
    /// once `timeout` has elapsed.
    pub fn join_timeout(&self, timeout: Duration) -> Result<(), StrandError> {
        self.join_until(Some(Instant::now() + timeout))
    }

    fn join_until(&self, deadline: Option<Instant>) -> Result<(), StrandError> {
        if self.inner.outcome.get().is_none() {
            if current_id() == self.id() {
                return Err(StrandError::IllegalState("a strand cannot join itself"));
            }
            self.inner
                .joiners
                .wait_until(|| self.inner.outcome.get().is_some(), deadline)?;
        }

        match self.inner.outcome.get() {
            Some(Outcome::Completed) => Ok(()),
            Some(Outcome::Failed(failure)) => Err(StrandError::Failed(failure.clone())),
            Some(Outcome::Cancelled) => Err(StrandError::Cancelled),
            None => Err(StrandError::Timeout),
        }
    }

    /// Cancels the strand.
    ///
    /// A strand that has not started is terminated without ever running its
    /// body and `true` is returned. A running strand is interrupted if
    /// `may_interrupt` is set; cancellation is then up to the body.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        if self
            .inner
            .state
            .compare_exchange(NEW, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            drop(lock(&self.inner.body).take());
            debug!(strand = %self, "strand cancelled before start");
            self.finish(Outcome::Cancelled);
            return true;
        }

        if may_interrupt && self.is_alive() {
            self.interrupt();
        }
        false
    }

    /// Sets the interrupt flag and wakes the strand if it is parked.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
        self.inner.unparker.unpark();
    }

    /// Returns the interrupt flag without clearing it.
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Grants the strand's single park permit.
    ///
    /// If the strand is not parked, its next park returns immediately.
    #[inline]
    pub fn unpark(&self) {
        self.inner.unparker.unpark();
    }

    /// Returns `true` while the strand is inside a park call.
    #[inline]
    pub fn is_parked(&self) -> bool {
        self.inner.parked.load(Ordering::SeqCst)
    }

    /// Description passed to the strand's most recent park.
    pub fn blocker(&self) -> Option<&'static str> {
        *lock(&self.inner.blocker)
    }

    /// The per-strand uncaught failure handler.
    pub fn uncaught_exception_handler(&self) -> Option<UncaughtHandler> {
        self.inner.handler.load_full().map(|h| UncaughtHandler::clone(&h))
    }

    /// Replaces the per-strand uncaught failure handler.
    pub fn set_uncaught_exception_handler<F>(&self, handler: F)
    where
        F: Fn(&Strand, &StrandFailure) + Send + Sync + 'static,
    {
        let handler: UncaughtHandler = Arc::new(handler);
        self.inner.handler.store(Some(Arc::new(handler)));
    }

    /// Removes the per-strand handler; failures go to the default handler.
    pub fn clear_uncaught_exception_handler(&self) {
        self.inner.handler.store(None);
    }

    /// Publishes the outcome, leaves the registry, reports an uncaught
    /// failure and wakes joiners. Runs once.
    fn finish(&self, outcome: Outcome) {
        let failure = match &outcome {
            Outcome::Failed(failure) => Some(failure.clone()),
            _ => None,
        };
        if self.inner.outcome.set(outcome).is_err() {
            return;
        }
        let _ = self.inner.state.compare_exchange(
            STARTED,
            TERMINATED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        registry::remove(self.id());

        if let Some(failure) = failure {
            self.dispatch_failure(&failure);
        }
        self.inner.joiners.signal_all();
    }

    fn dispatch_failure(&self, failure: &StrandFailure) {
        if let Some(handler) = self.inner.handler.load_full() {
            self.invoke_handler(&handler, failure);
        } else if self.inner.joiners.has_waiters() {
            trace!(strand = %self, "uncaught failure handed to joiners");
        } else if let Some(handler) = DEFAULT_HANDLER.load_full() {
            self.invoke_handler(&handler, failure);
        } else {
            error!(strand = %self, cause = %failure.cause(), "uncaught failure in strand");
        }
    }

    fn invoke_handler(&self, handler: &UncaughtHandler, failure: &StrandFailure) {
        let handler: &(dyn Fn(&Strand, &StrandFailure) + Send + Sync) = &**handler;
        if panic::catch_unwind(AssertUnwindSafe(|| handler(self, failure))).is_err() {
            warn!(strand = %self, "uncaught failure handler panicked");
        }
    }
}

/// The process-wide uncaught failure handler, if one was set.
pub fn default_uncaught_exception_handler() -> Option<UncaughtHandler> {
    DEFAULT_HANDLER
        .load_full()
        .map(|h| UncaughtHandler::clone(&h))
}

/// Sets the process-wide handler for failures that neither a per-strand
/// handler nor a waiting joiner consumes. Without one, they are logged.
pub fn set_default_uncaught_exception_handler<F>(handler: F)
where
    F: Fn(&Strand, &StrandFailure) + Send + Sync + 'static,
{
    let handler: UncaughtHandler = Arc::new(handler);
    DEFAULT_HANDLER.store(Some(Arc::new(handler)));
}

/// Restores logging as the process-wide uncaught failure handling.
pub fn clear_default_uncaught_exception_handler() {
    DEFAULT_HANDLER.store(None);
}

pub(crate) fn check_priority(priority: u8) -> Result<(), StrandError> {
    if (MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        Ok(())
    } else {
        Err(StrandError::InvalidArgument(format!(
            "priority {priority} outside {MIN_PRIORITY}..={MAX_PRIORITY}"
        )))
    }
}

impl PartialEq for Strand {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Strand {}

impl Hash for Strand {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.inner.name, self.inner.id)
    }
}

impl fmt::Debug for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strand")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Execution context
// ============================================================================

struct Context {
    strand: Strand,
    parker: Parker,
    adopted: bool,
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.adopted {
            // The thread is exiting. No logging: tracing's own thread-locals
            // may already be gone.
            if self.strand.inner.outcome.set(Outcome::Completed).is_ok() {
                self.strand.inner.state.store(TERMINATED, Ordering::SeqCst);
                registry::remove(self.strand.id());
                self.strand.inner.joiners.signal_all();
            }
        }
    }
}

fn with_context<R>(f: impl FnOnce(&Context) -> R) -> R {
    CONTEXT.with(|cell| {
        {
            let slot = cell.borrow();
            if let Some(ctx) = slot.as_ref() {
                return f(ctx);
            }
        }

        let parker = Parker::new();
        let strand = Strand::adopt(&parker);
        registry::insert(&strand);
        trace!(strand = %strand, "adopted thread");

        let ctx = Context {
            strand,
            parker,
            adopted: true,
        };
        let result = f(&ctx);
        *cell.borrow_mut() = Some(ctx);
        result
    })
}

/// A started strand's body, ready to run on a thread or carrier.
pub(crate) struct Task {
    strand: Strand,
    parker: Parker,
    body: Body,
}

impl Task {
    pub(crate) fn strand(&self) -> &Strand {
        &self.strand
    }

    /// Runs the body on the calling thread with the strand's context
    /// installed, then terminates the strand.
    pub(crate) fn run(self) {
        let Task {
            strand,
            parker,
            body,
        } = self;

        CONTEXT.with(|cell| {
            *cell.borrow_mut() = Some(Context {
                strand: strand.clone(),
                parker,
                adopted: false,
            });
        });

        let outcome = match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(Ok(())) => Outcome::Completed,
            Ok(Err(cause)) => Outcome::Failed(StrandFailure::new(strand.name().to_owned(), cause)),
            Err(payload) => Outcome::Failed(StrandFailure::new(
                strand.name().to_owned(),
                Failure::from_panic(payload),
            )),
        };

        debug!(
            strand = %strand,
            failed = matches!(outcome, Outcome::Failed(_)),
            "strand terminated"
        );
        strand.finish(outcome);

        CONTEXT.with(|cell| drop(cell.borrow_mut().take()));
    }
}

fn spawn_thread(task: Task, stack_size: Option<usize>) -> io::Result<()> {
    let mut builder = thread::Builder::new().name(task.strand.name().to_owned());
    if let Some(size) = stack_size {
        builder = builder.stack_size(size);
    }
    builder.spawn(move || task.run()).map(drop)
}

// ============================================================================
// Operations on the current strand
// ============================================================================

fn park_internal(blocker: &'static str, deadline: Option<Instant>) {
    with_context(|ctx| {
        let inner = &ctx.strand.inner;
        *lock(&inner.blocker) = Some(blocker);

        inner.parked.store(true, Ordering::SeqCst);
        if !inner.interrupted.load(Ordering::SeqCst) {
            match deadline {
                Some(deadline) => ctx.parker.park_deadline(deadline),
                None => ctx.parker.park(),
            }
        }
        inner.parked.store(false, Ordering::SeqCst);
    });
}

/// Parks the current strand until it is unparked or interrupted.
///
/// Wakeups may be spurious; callers re-check their condition in a loop.
pub fn park(blocker: &'static str) {
    park_internal(blocker, None);
}

/// Parks the current strand for at most `timeout`.
pub fn park_timeout(blocker: &'static str, timeout: Duration) {
    park_internal(blocker, Some(Instant::now() + timeout));
}

/// Parks the current strand until `deadline` at the latest.
pub fn park_until(blocker: &'static str, deadline: Instant) {
    park_internal(blocker, Some(deadline));
}

/// Grants `strand` its park permit.
#[inline]
pub fn unpark(strand: &Strand) {
    strand.unpark();
}

/// Sleeps the current strand for `duration`.
///
/// # Errors
///
/// Returns [`StrandError::Interrupted`] (clearing the flag) if the strand is
/// interrupted before the time is up.
pub fn sleep(duration: Duration) -> Result<(), StrandError> {
    let deadline = Instant::now() + duration;
    loop {
        if interrupted() {
            return Err(StrandError::Interrupted);
        }
        if Instant::now() >= deadline {
            return Ok(());
        }
        park_internal("sleep", Some(deadline));
    }
}

/// Offers the rest of the current time slice to other threads.
#[inline]
pub fn yield_now() {
    thread::yield_now();
}

/// Tests and clears the current strand's interrupt flag.
pub fn interrupted() -> bool {
    with_context(|ctx| ctx.strand.inner.interrupted.swap(false, Ordering::SeqCst))
}

/// Id of the current strand, adopting the calling thread if needed.
pub fn current_id() -> StrandId {
    with_context(|ctx| ctx.strand.id())
}

/// Returns `true` when called from a body started through this crate, as
/// opposed to an adopted thread or no strand at all.
pub fn in_strand_context() -> bool {
    CONTEXT.with(|cell| cell.borrow().as_ref().is_some_and(|ctx| !ctx.adopted))
}
