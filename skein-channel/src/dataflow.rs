//! Dataflow variables.
//!
//! A [`Val`] is set once; readers park until it is. A [`Var`] can be set any
//! number of times and keeps a short history: each strand reading it sees
//! the values it has not seen yet, oldest first, and after that keeps seeing
//! the latest one.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use skein_strand::{ConditionSynchronizer, Strand, StrandId, WaitError, current_id};

use crate::error::{AlreadySet, RecvError};
use crate::port::ReceivePort;
use crate::ticker::{TickerChannel, TickerConsumer, ticker};

// ============================================================================
// Val
// ============================================================================

/// A value that is set exactly once and read any number of times.
pub struct Val<T> {
    value: OnceLock<T>,
    waiters: ConditionSynchronizer,
}

impl<T> Default for Val<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Val<T> {
    /// Creates an unset value.
    pub fn new() -> Self {
        Self {
            value: OnceLock::new(),
            waiters: ConditionSynchronizer::new("val"),
        }
    }

    /// Creates a value that is already set.
    pub fn with_value(value: T) -> Self {
        Self {
            value: OnceLock::from(value),
            waiters: ConditionSynchronizer::new("val"),
        }
    }

    /// Sets the value and wakes every reader.
    ///
    /// # Errors
    ///
    /// [`AlreadySet`] with `value` if the value was set before.
    pub fn set(&self, value: T) -> Result<(), AlreadySet<T>> {
        self.value.set(value).map_err(AlreadySet)?;
        if self.waiters.has_waiters() {
            self.waiters.signal_all();
        }
        Ok(())
    }

    /// Returns `true` once set.
    pub fn is_set(&self) -> bool {
        self.value.get().is_some()
    }

    /// Returns the value if it is set.
    pub fn try_get(&self) -> Option<&T> {
        self.value.get()
    }

    /// Returns the value, parking until it is set.
    ///
    /// # Errors
    ///
    /// [`WaitError::Interrupted`] if the strand is interrupted while parked.
    pub fn get(&self) -> Result<&T, WaitError> {
        self.get_until(None)
    }

    /// Like [`get`](Self::get), but gives up with [`WaitError::Timeout`]
    /// after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Result<&T, WaitError> {
        self.get_until(Some(Instant::now() + timeout))
    }

    fn get_until(&self, deadline: Option<Instant>) -> Result<&T, WaitError> {
        if let Some(value) = self.value.get() {
            return Ok(value);
        }

        let registration = self.waiters.register();
        let mut iteration = 0;
        let result = loop {
            if let Some(value) = self.value.get() {
                break Ok(value);
            }
            if let Err(e) = self.waiters.wait(&registration, iteration, deadline) {
                break Err(e);
            }
            iteration += 1;
        };
        self.waiters.unregister(registration);
        result
    }
}

impl<T: fmt::Debug> fmt::Debug for Val<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Val").field("value", &self.value.get()).finish()
    }
}

// ============================================================================
// Var
// ============================================================================

/// History a [`Var`] keeps when none is given.
pub const DEFAULT_VAR_HISTORY: usize = 1;

/// What one strand has seen of a [`Var`].
struct View<T> {
    consumer: TickerConsumer<T>,
    current: Option<T>,
}

/// A variable that can be set repeatedly and keeps its last few values.
///
/// Reads are per strand. [`get`](Self::get) returns the oldest value in the
/// history that the calling strand has not read yet; once it has read them
/// all, it returns the latest value again. Only a strand that has never seen
/// a value parks. A strand that falls more than `history` values behind
/// misses the ones that were overwritten.
pub struct Var<T> {
    history: TickerChannel<T>,
    views: DashMap<StrandId, Arc<Mutex<View<T>>>>,
}

impl<T: Clone> Default for Var<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Var<T> {
    /// Creates a variable with a history of [`DEFAULT_VAR_HISTORY`].
    pub fn new() -> Self {
        Self::with_history(DEFAULT_VAR_HISTORY)
    }

    /// Creates a variable that keeps its last `history` values.
    ///
    /// # Panics
    ///
    /// Panics if `history` is zero.
    pub fn with_history(history: usize) -> Self {
        Self {
            history: ticker(history),
            views: DashMap::new(),
        }
    }

    /// Sets a new value and wakes strands waiting for one.
    pub fn set(&self, value: T) {
        self.history.write(value);
        self.history.notify();
    }

    /// Returns the oldest value this strand has not read, or the latest if
    /// it has read them all. Parks until the first value is set.
    ///
    /// # Errors
    ///
    /// [`WaitError::Interrupted`] if the strand is interrupted while parked.
    pub fn get(&self) -> Result<T, WaitError> {
        self.read(false, None)
    }

    /// Like [`get`](Self::get), but gives up with [`WaitError::Timeout`]
    /// after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, WaitError> {
        self.read(false, Some(Instant::now() + timeout))
    }

    /// Returns a value this strand has not read yet, parking until there is
    /// one.
    ///
    /// # Errors
    ///
    /// [`WaitError::Interrupted`] if the strand is interrupted while parked.
    pub fn get_next(&self) -> Result<T, WaitError> {
        self.read(true, None)
    }

    fn read(&self, fresh: bool, deadline: Option<Instant>) -> Result<T, WaitError> {
        let view = self.view();
        // Only the owning strand locks its view
        let mut view = view.lock().unwrap_or_else(PoisonError::into_inner);

        if let Ok(value) = view.consumer.try_receive() {
            view.current = Some(value.clone());
            return Ok(value);
        }
        if !fresh {
            if let Some(value) = &view.current {
                return Ok(value.clone());
            }
        }

        match view.consumer.receive_until(deadline) {
            Ok(value) => {
                view.current = Some(value.clone());
                Ok(value)
            }
            Err(RecvError::Timeout) => Err(WaitError::Timeout),
            // The history is never closed
            Err(_) => Err(WaitError::Interrupted),
        }
    }

    fn view(&self) -> Arc<Mutex<View<T>>> {
        let id = current_id();
        if let Some(view) = self.views.get(&id) {
            return Arc::clone(&view);
        }

        // First read by this strand: forget strands that have terminated
        self.views.retain(|id, _| Strand::of(*id).is_some());
        let view = self.views.entry(id).or_insert_with(|| {
            Arc::new(Mutex::new(View {
                consumer: self.history.subscribe(),
                current: None,
            }))
        });
        Arc::clone(&view)
    }
}

impl<T> fmt::Debug for Var<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Var")
            .field("history", &self.history.capacity())
            .field("sets", &self.history.sent())
            .field("readers", &self.views.len())
            .finish()
    }
}
