//! # skein-channel
//!
//! Channels for strands. A [`Channel`] is a bounded or unbounded FIFO shared
//! by any number of senders and receivers, thread- or fiber-backed. Blocking
//! operations park the calling strand through a
//! [`ConditionSynchronizer`](skein_strand::ConditionSynchronizer), so no
//! lock is ever held while a strand waits.
//!
//! ## Overflow policies
//!
//! A bounded channel fixes at construction what a send into a full buffer
//! does:
//!
//! | Policy | Full buffer |
//! |--------|-------------|
//! | [`OverflowPolicy::Block`] | park until space frees up |
//! | [`OverflowPolicy::Throw`] | fail with [`SendError::CapacityExceeded`] |
//! | [`OverflowPolicy::Drop`] | discard the new message, report success |
//! | [`OverflowPolicy::Displace`] | evict the oldest message, enqueue the new one |
//!
//! ```
//! use skein_channel::{channel, OverflowPolicy};
//!
//! let ch = channel::<u32>(2, OverflowPolicy::Displace);
//! for i in 1..=3 {
//!     ch.send(i).unwrap();
//! }
//! assert_eq!(ch.try_receive().unwrap(), 2);
//! assert_eq!(ch.try_receive().unwrap(), 3);
//! ```
//!
//! ## Closing
//!
//! [`Channel::close`] stops further sends. Buffered messages stay receivable
//! in order; after that every receive reports [`RecvError::Closed`], or
//! [`RecvError::ClosedExceptionally`] for a channel closed with
//! [`Channel::close_with`].
//!
//! ## Select
//!
//! [`select`] completes exactly one of several sends and receives across
//! channels, lowest index first when more than one is ready. A [`timeout`]
//! channel among the candidates gives a branch that fires after a duration.
//!
//! ```
//! use skein_channel::{select_timeout, timeout, unbounded, Completion, SelectAction};
//! use std::time::Duration;
//!
//! let inbox = unbounded::<u32>();
//! let timer = timeout::<u32>(Duration::from_millis(10));
//!
//! let mut actions = [SelectAction::receive(&inbox), SelectAction::receive(&timer)];
//! let selected = select_timeout(&mut actions, Duration::from_secs(5))
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(selected.index(), 1);
//! assert_eq!(selected.completion(), &Completion::Closed);
//! ```
//!
//! ## Tickers, combinators and dataflow
//!
//! A [`TickerChannel`] broadcasts to any number of [`TickerConsumer`]s and
//! keeps a bounded history that slow consumers skip through. Channels and
//! ticker consumers both implement [`ReceivePort`], whose
//! [`map`](ReceivePort::map), [`filter`](ReceivePort::filter) and
//! [`take`](ReceivePort::take) wrap a port on the receiving side. [`Val`]
//! and [`Var`] are single- and multi-assignment dataflow variables.
//!
//! ## Queues
//!
//! The buffer is the cheapest `skein-queue` specialization the channel's
//! configuration allows; see [`ChannelBuilder::single_producer`] and
//! [`ChannelBuilder::single_consumer`]. A single-producer or single-consumer
//! side binds to the first strand that uses it and panics on any other.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod buffer;
mod channel;
mod dataflow;
mod error;
mod pipeline;
mod port;
mod select;
mod ticker;

pub use channel::{
    Channel, ChannelBuilder, Iter, OverflowPolicy, channel, timeout, unbounded,
};
pub use dataflow::{DEFAULT_VAR_HISTORY, Val, Var};
pub use error::{
    AlreadySet, Cause, PipelineError, RecvError, SelectError, SendError, TryRecvError,
    TrySendError,
};
pub use pipeline::Pipeline;
pub use port::{Filter, Map, Messages, ReceivePort, Take};
pub use select::{Completion, SelectAction, Selected, select, select_timeout, try_select};
pub use ticker::{TickerChannel, TickerConsumer, ticker};
