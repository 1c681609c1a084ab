//! Atomic multi-way select over channel operations.
//!
//! ```text
//! try every action in index order ──▶ first success wins
//!        │ none ready
//!        ▼
//! register on every candidate's waiter set, all sharing one Claim
//!        │
//!        ▼
//! loop { try all in index order; wait }     deadline computed once
//!        │ success / timeout / interrupt
//!        ▼
//! claim ─▶ unregister everywhere ─▶ forward signals the losers absorbed
//! ```
//!
//! A receive candidate waits on its channel's receiver set and a send
//! candidate on the sender set. Once the claim is taken, signallers skip the
//! selector's registrations and wake someone else.

use std::sync::Arc;
use std::time::{Duration, Instant};

use skein_strand::{Claim, ConditionSynchronizer, DEFAULT_SNOOZE_ITERS, Parking, WaitError};

use crate::channel::{Channel, earliest};
use crate::error::{Cause, SelectError, TryRecvError, TrySendError};

/// One candidate operation of a select.
///
/// A send action keeps its message until it is the one that commits, so the
/// same action list can be selected over repeatedly.
pub struct SelectAction<T> {
    channel: Channel<T>,
    op: Op<T>,
}

enum Op<T> {
    /// `None` once the message has been delivered.
    Send(Option<T>),
    Receive,
}

/// How the committed action completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<T> {
    /// A receive took this message.
    Received(T),
    /// A send delivered its message.
    Sent,
    /// The channel was closed: a receive found it drained, or a send found
    /// it closed and dropped the message.
    Closed,
}

/// The action a select committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selected<T> {
    index: usize,
    send: bool,
    completion: Completion<T>,
}

enum Attempt<T> {
    Pending,
    Done(Completion<T>),
    Failed(Cause),
}

impl<T> SelectAction<T> {
    /// Sends `msg` to `channel`.
    pub fn send(channel: &Channel<T>, msg: T) -> Self {
        Self {
            channel: channel.clone(),
            op: Op::Send(Some(msg)),
        }
    }

    /// Receives from `channel`.
    pub fn receive(channel: &Channel<T>) -> Self {
        Self {
            channel: channel.clone(),
            op: Op::Receive,
        }
    }

    /// The channel this action operates on.
    pub fn channel(&self) -> &Channel<T> {
        &self.channel
    }

    /// Returns `true` for a send action.
    pub fn is_send(&self) -> bool {
        matches!(self.op, Op::Send(_))
    }

    /// Takes back the message of a send action that has not committed.
    pub fn take_message(&mut self) -> Option<T> {
        match &mut self.op {
            Op::Send(msg) => msg.take(),
            Op::Receive => None,
        }
    }

    fn attempt(&mut self) -> Attempt<T> {
        match &mut self.op {
            Op::Receive => match self.channel.try_receive() {
                Ok(msg) => Attempt::Done(Completion::Received(msg)),
                Err(TryRecvError::Empty) => Attempt::Pending,
                Err(TryRecvError::Closed) => Attempt::Done(Completion::Closed),
                Err(TryRecvError::ClosedExceptionally(cause)) => Attempt::Failed(cause),
            },
            Op::Send(slot) => {
                let Some(msg) = slot.take() else {
                    return Attempt::Pending;
                };
                match self.channel.offer(msg) {
                    Ok(()) => Attempt::Done(Completion::Sent),
                    Err(TrySendError::Full(msg)) => {
                        *slot = Some(msg);
                        Attempt::Pending
                    }
                    Err(TrySendError::Closed(_)) => Attempt::Done(Completion::Closed),
                }
            }
        }
    }

    fn synchronizer(&self) -> &ConditionSynchronizer {
        match self.op {
            Op::Send(_) => self.channel.senders(),
            Op::Receive => self.channel.receivers(),
        }
    }

    /// Passes on a wakeup the selector may have absorbed.
    fn forward(&self) {
        match self.op {
            Op::Send(_) => self.channel.forward_to_senders(),
            Op::Receive => self.channel.forward_to_receivers(),
        }
    }
}

impl<T> Selected<T> {
    /// Position of the committed action in the action list.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns `true` if a send committed.
    pub fn is_send(&self) -> bool {
        self.send
    }

    /// Returns `true` if a receive committed.
    pub fn is_receive(&self) -> bool {
        !self.send
    }

    /// How the action completed.
    pub fn completion(&self) -> &Completion<T> {
        &self.completion
    }

    /// Consumes the result, returning how the action completed.
    pub fn into_completion(self) -> Completion<T> {
        self.completion
    }

    /// The received message, if a receive took one.
    pub fn message(&self) -> Option<&T> {
        match &self.completion {
            Completion::Received(msg) => Some(msg),
            _ => None,
        }
    }

    /// Consumes the result, returning the received message if any.
    pub fn into_message(self) -> Option<T> {
        match self.completion {
            Completion::Received(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Completes exactly one of `actions`, parking until one is possible.
///
/// When several actions are ready at once the lowest index wins.
///
/// # Errors
///
/// - [`SelectError::Empty`] for an empty action list.
/// - [`SelectError::ClosedExceptionally`] if the committing candidate is a
///   receive on a channel closed with an error.
/// - [`SelectError::Interrupted`] if the strand was interrupted while parked.
///
/// # Example
///
/// ```
/// use skein_channel::{select, unbounded, SelectAction};
///
/// let a = unbounded::<u32>();
/// let b = unbounded::<u32>();
/// b.send(7).unwrap();
///
/// let mut actions = [SelectAction::receive(&a), SelectAction::receive(&b)];
/// let selected = select(&mut actions).unwrap();
/// assert_eq!(selected.index(), 1);
/// assert_eq!(selected.into_message(), Some(7));
/// ```
pub fn select<T>(actions: &mut [SelectAction<T>]) -> Result<Selected<T>, SelectError> {
    loop {
        if let Some(selected) = select_until(actions, None)? {
            return Ok(selected);
        }
    }
}

/// Like [`select`], but returns `Ok(None)` if nothing completed within
/// `timeout`. The deadline is fixed when the call starts.
pub fn select_timeout<T>(
    actions: &mut [SelectAction<T>],
    timeout: Duration,
) -> Result<Option<Selected<T>>, SelectError> {
    select_until(actions, Some(Instant::now() + timeout))
}

/// Tries every action once, in index order, without parking.
pub fn try_select<T>(actions: &mut [SelectAction<T>]) -> Result<Option<Selected<T>>, SelectError> {
    if actions.is_empty() {
        return Err(SelectError::Empty);
    }
    attempt_all(actions)
}

fn attempt_all<T>(actions: &mut [SelectAction<T>]) -> Result<Option<Selected<T>>, SelectError> {
    for (index, action) in actions.iter_mut().enumerate() {
        match action.attempt() {
            Attempt::Pending => {}
            Attempt::Done(completion) => {
                return Ok(Some(Selected {
                    index,
                    send: action.is_send(),
                    completion,
                }));
            }
            Attempt::Failed(cause) => {
                return Err(SelectError::ClosedExceptionally { index, cause });
            }
        }
    }
    Ok(None)
}

fn select_until<T>(
    actions: &mut [SelectAction<T>],
    deadline: Option<Instant>,
) -> Result<Option<Selected<T>>, SelectError> {
    if let Some(selected) = try_select(actions)? {
        return Ok(Some(selected));
    }

    let claim = Arc::new(Claim::new());
    let registrations: Vec<_> = actions
        .iter()
        .map(|action| action.synchronizer().register_claimed(Arc::clone(&claim)))
        .collect();

    let timer = actions
        .iter()
        .filter_map(|action| action.channel.fires_at())
        .min();
    let park_deadline = earliest(deadline, timer);
    let parking = Parking::new(DEFAULT_SNOOZE_ITERS, "select");

    let mut iteration = 0;
    let result = loop {
        match attempt_all(actions) {
            Ok(Some(selected)) => break Ok(Some(selected)),
            Ok(None) => {}
            Err(e) => break Err(e),
        }
        match parking.wait(iteration, park_deadline) {
            Ok(()) => {}
            // a timer candidate is due; the next round commits it
            Err(WaitError::Timeout) if deadline.is_none_or(|d| Instant::now() < d) => {}
            Err(WaitError::Timeout) => break Ok(None),
            Err(WaitError::Interrupted) => break Err(SelectError::Interrupted),
        }
        iteration += 1;
    };

    claim.try_claim();
    for (action, registration) in actions.iter().zip(registrations) {
        action.synchronizer().unregister(registration);
    }
    for action in actions.iter() {
        action.forward();
    }
    result
}
