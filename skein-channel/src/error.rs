use std::error::Error;
use std::fmt;
use std::sync::Arc;

use skein_strand::StrandError;
use thiserror::Error;

/// Terminal error a channel was closed with.
pub type Cause = Arc<dyn Error + Send + Sync>;

/// Error returned by a blocking send. Every variant hands the message back.
#[derive(Error)]
pub enum SendError<T> {
    /// The channel is closed.
    #[error("sending on a closed channel")]
    Closed(T),

    /// The channel is full and its policy is [`Throw`](crate::OverflowPolicy::Throw).
    #[error("channel capacity exceeded")]
    CapacityExceeded(T),

    /// No space freed up before the deadline.
    #[error("send timed out")]
    Timeout(T),

    /// The sending strand was interrupted while parked.
    #[error("send interrupted")]
    Interrupted(T),
}

impl<T> SendError<T> {
    /// Returns the message that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            SendError::Closed(v)
            | SendError::CapacityExceeded(v)
            | SendError::Timeout(v)
            | SendError::Interrupted(v) => v,
        }
    }

    /// Returns `true` for [`SendError::Closed`].
    pub fn is_closed(&self) -> bool {
        matches!(self, SendError::Closed(_))
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed(_) => f.write_str("Closed(..)"),
            SendError::CapacityExceeded(_) => f.write_str("CapacityExceeded(..)"),
            SendError::Timeout(_) => f.write_str("Timeout(..)"),
            SendError::Interrupted(_) => f.write_str("Interrupted(..)"),
        }
    }
}

/// Error returned by [`Channel::try_send`](crate::Channel::try_send).
#[derive(Error)]
pub enum TrySendError<T> {
    /// The channel is full.
    #[error("channel is full")]
    Full(T),

    /// The channel is closed.
    #[error("sending on a closed channel")]
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Returns the message that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(v) => v,
        }
    }

    /// Returns `true` for [`TrySendError::Full`].
    pub fn is_full(&self) -> bool {
        matches!(self, TrySendError::Full(_))
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("Full(..)"),
            TrySendError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

/// Error returned by a blocking receive.
#[derive(Debug, Clone, Error)]
pub enum RecvError {
    /// The channel is closed and drained.
    #[error("receiving on a closed channel")]
    Closed,

    /// The channel was closed with an error and is drained.
    #[error("channel closed exceptionally: {0}")]
    ClosedExceptionally(Cause),

    /// Nothing arrived before the deadline.
    #[error("receive timed out")]
    Timeout,

    /// The receiving strand was interrupted while parked.
    #[error("receive interrupted")]
    Interrupted,
}

impl RecvError {
    /// Returns `true` if the channel is closed, normally or exceptionally.
    pub fn is_closed(&self) -> bool {
        matches!(self, RecvError::Closed | RecvError::ClosedExceptionally(_))
    }
}

/// Error returned by [`Channel::try_receive`](crate::Channel::try_receive).
#[derive(Debug, Clone, Error)]
pub enum TryRecvError {
    /// Nothing is buffered right now.
    #[error("channel is empty")]
    Empty,

    /// The channel is closed and drained.
    #[error("receiving on a closed channel")]
    Closed,

    /// The channel was closed with an error and is drained.
    #[error("channel closed exceptionally: {0}")]
    ClosedExceptionally(Cause),
}

/// Maps a non-blocking failure that ends a blocking receive.
pub(crate) fn terminal(e: TryRecvError) -> RecvError {
    match e {
        TryRecvError::ClosedExceptionally(cause) => RecvError::ClosedExceptionally(cause),
        TryRecvError::Closed | TryRecvError::Empty => RecvError::Closed,
    }
}

/// Error returned by [`Val::set`](crate::Val::set) on a value that is
/// already set. Hands the rejected value back.
#[derive(Error)]
#[error("value already set")]
pub struct AlreadySet<T>(pub T);

impl<T> AlreadySet<T> {
    /// Returns the rejected value.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for AlreadySet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AlreadySet(..)")
    }
}

/// Error returned by [`select`](crate::select) and its variants.
#[derive(Debug, Clone, Error)]
pub enum SelectError {
    /// A receive candidate's channel was closed with an error.
    #[error("select candidate {index} closed exceptionally: {cause}")]
    ClosedExceptionally {
        /// Position of the candidate in the action list.
        index: usize,
        /// The error the channel was closed with.
        cause: Cause,
    },

    /// The selecting strand was interrupted while parked.
    #[error("select interrupted")]
    Interrupted,

    /// The action list was empty.
    #[error("select over an empty action list")]
    Empty,
}

/// Error returned by [`Pipeline::run`](crate::Pipeline::run).
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The source channel was closed with an error.
    #[error("pipeline source closed exceptionally: {0}")]
    Source(Cause),

    /// The destination channel was closed before every result was forwarded.
    #[error("pipeline destination closed")]
    Closed,

    /// The calling strand was interrupted.
    #[error("pipeline interrupted")]
    Interrupted,

    /// A worker strand could not be created or failed.
    #[error(transparent)]
    Strand(#[from] StrandError),
}
