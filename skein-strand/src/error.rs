use std::any::Any;
use std::error::Error;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// The original cause of a strand failure.
#[derive(Debug, Error)]
pub enum Failure {
    /// The body panicked. Holds the panic message when it was a string.
    #[error("panicked: {0}")]
    Panicked(String),

    /// The body returned an error.
    #[error(transparent)]
    Error(Box<dyn Error + Send + Sync>),
}

impl Failure {
    /// Builds a failure from a payload caught by `catch_unwind`.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Failure::Panicked(panic_message(&*payload))
    }

    /// Returns the panic message if the body panicked.
    pub fn panic_message(&self) -> Option<&str> {
        match self {
            Failure::Panicked(msg) => Some(msg),
            Failure::Error(_) => None,
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// An uncaught failure of a strand body, wrapping the original cause.
///
/// Cloning is cheap; every joiner receives the same cause.
#[derive(Debug, Clone, Error)]
#[error("strand {strand} failed")]
pub struct StrandFailure {
    strand: String,
    #[source]
    cause: Arc<Failure>,
}

impl StrandFailure {
    pub(crate) fn new(strand: String, cause: Failure) -> Self {
        Self {
            strand,
            cause: Arc::new(cause),
        }
    }

    /// Name of the strand that failed.
    pub fn strand_name(&self) -> &str {
        &self.strand
    }

    /// The original cause.
    pub fn cause(&self) -> &Failure {
        &self.cause
    }
}

/// Errors returned by strand operations.
#[derive(Debug, Error)]
pub enum StrandError {
    /// Reentrant misuse, such as starting a strand twice or joining oneself.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// An argument was out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The deadline passed before the operation completed.
    #[error("timed out")]
    Timeout,

    /// The calling strand was interrupted while parked.
    #[error("interrupted")]
    Interrupted,

    /// The strand was cancelled before it started.
    #[error("strand was cancelled")]
    Cancelled,

    /// The strand terminated with an uncaught failure.
    #[error(transparent)]
    Failed(#[from] StrandFailure),

    /// The OS refused to create a thread.
    #[error("failed to spawn strand")]
    Spawn(#[source] io::Error),
}

impl StrandError {
    /// Returns `true` for [`StrandError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, StrandError::Timeout)
    }

    /// Returns `true` for [`StrandError::Interrupted`].
    pub fn is_interrupted(&self) -> bool {
        matches!(self, StrandError::Interrupted)
    }
}

/// Why a wait on a [`ConditionSynchronizer`](crate::ConditionSynchronizer)
/// gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    /// The deadline passed.
    #[error("timed out")]
    Timeout,

    /// The waiting strand was interrupted. The interrupt flag is cleared.
    #[error("interrupted")]
    Interrupted,
}

impl From<WaitError> for StrandError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::Timeout => StrandError::Timeout,
            WaitError::Interrupted => StrandError::Interrupted,
        }
    }
}

/// Errors returned by [`FiberAsync`](crate::FiberAsync).
#[derive(Debug, Error)]
pub enum AsyncError<E> {
    /// The async operation reported a failure.
    #[error("async operation failed: {0}")]
    Failed(E),

    /// No completion arrived before the deadline.
    #[error("timed out")]
    Timeout,

    /// The waiting strand was interrupted.
    #[error("interrupted")]
    Interrupted,

    /// The request was reused or cannot run in this context.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// `request_async` panicked.
    #[error("request panicked: {0}")]
    Panicked(String),
}

impl<E> AsyncError<E> {
    /// Returns the failure reported by the async operation, if any.
    pub fn into_failure(self) -> Option<E> {
        match self {
            AsyncError::Failed(e) => Some(e),
            _ => None,
        }
    }
}
