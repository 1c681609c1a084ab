use std::error::Error;
use std::fmt;
use std::sync::Arc;

use crate::error::{Failure, StrandError, StrandFailure};
use crate::factory::StrandFactory;
use crate::scheduler::FiberScheduler;
use crate::strand::{self, DEFAULT_PRIORITY, Launch, Spawn, Strand, UncaughtHandler};

/// Configures and creates a [`Strand`].
///
/// Strands are thread-backed unless [`fiber`](Self::fiber) or
/// [`scheduler`](Self::scheduler) is called.
///
/// # Example
///
/// ```
/// use skein_strand::StrandBuilder;
///
/// let strand = StrandBuilder::new()
///     .name("parser")
///     .priority(7)
///     .build_fallible(|| -> Result<(), std::num::ParseIntError> {
///         "42".parse::<u32>()?;
///         Ok(())
///     })
///     .unwrap();
///
/// strand.start().unwrap();
/// strand.join().unwrap();
/// ```
#[derive(Clone)]
pub struct StrandBuilder {
    name: Option<String>,
    priority: u8,
    scheduler: Option<FiberScheduler>,
    stack_size: Option<usize>,
    handler: Option<UncaughtHandler>,
}

impl Default for StrandBuilder {
    fn default() -> Self {
        Self {
            name: None,
            priority: DEFAULT_PRIORITY,
            scheduler: None,
            stack_size: None,
            handler: None,
        }
    }
}

impl StrandBuilder {
    /// Returns a builder for a thread-backed strand with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the strand. Thread-backed strands also name their OS thread.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the priority, checked at build time.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Runs the strand on its own OS thread.
    pub fn thread(mut self) -> Self {
        self.scheduler = None;
        self
    }

    /// Runs the strand as a fiber on the global scheduler.
    pub fn fiber(self) -> Self {
        self.scheduler(&FiberScheduler::global())
    }

    /// Runs the strand as a fiber on `scheduler`.
    pub fn scheduler(mut self, scheduler: &FiberScheduler) -> Self {
        self.scheduler = Some(scheduler.clone());
        self
    }

    /// Stack size for a thread-backed strand. Fibers use their carrier's.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Handler for the strand's uncaught failure.
    pub fn uncaught_exception_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Strand, &StrandFailure) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Creates an unstarted strand running `body`.
    ///
    /// # Errors
    ///
    /// Returns [`StrandError::InvalidArgument`] for an out-of-range priority.
    pub fn build<F>(self, body: F) -> Result<Strand, StrandError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.build_fallible(move || -> Result<(), Failure> {
            body();
            Ok(())
        })
    }

    /// Creates an unstarted strand whose body may fail. An `Err` is handled
    /// exactly like a panic: it becomes the strand's uncaught failure.
    pub fn build_fallible<F, E>(self, body: F) -> Result<Strand, StrandError>
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        strand::check_priority(self.priority)?;

        let launch = match self.scheduler {
            Some(scheduler) => Launch::Fiber(scheduler),
            None => Launch::Thread {
                stack_size: self.stack_size,
            },
        };

        Ok(Strand::new(Spawn {
            name: self.name,
            priority: self.priority,
            launch,
            handler: self.handler,
            body: Box::new(move || body().map_err(|e| into_failure(e.into()))),
        }))
    }

    /// Creates and starts a strand running `body`.
    pub fn spawn<F>(self, body: F) -> Result<Strand, StrandError>
    where
        F: FnOnce() + Send + 'static,
    {
        let strand = self.build(body)?;
        strand.start()?;
        Ok(strand)
    }
}

fn into_failure(error: Box<dyn Error + Send + Sync>) -> Failure {
    // A body that forwards another strand's failure keeps the original cause
    match error.downcast::<Failure>() {
        Ok(failure) => *failure,
        Err(error) => Failure::Error(error),
    }
}

impl StrandFactory for StrandBuilder {
    fn new_strand(&self, body: Box<dyn FnOnce() + Send>) -> Result<Strand, StrandError> {
        self.clone().build(body)
    }
}

impl fmt::Debug for StrandBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrandBuilder")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("fiber", &self.scheduler.is_some())
            .field("stack_size", &self.stack_size)
            .finish_non_exhaustive()
    }
}

/// Starts a thread-backed strand.
pub fn spawn<F>(body: F) -> Result<Strand, StrandError>
where
    F: FnOnce() + Send + 'static,
{
    StrandBuilder::new().spawn(body)
}

/// Starts a fiber on the global scheduler.
pub fn spawn_fiber<F>(body: F) -> Result<Strand, StrandError>
where
    F: FnOnce() + Send + 'static,
{
    StrandBuilder::new().fiber().spawn(body)
}
