//! Elastic pool of carrier threads for fiber-backed strands.
//!
//! A fiber runs to completion on one carrier. When it parks, the carrier
//! blocks with it, so the pool never lets a fiber wait for a carrier: a new
//! fiber either reserves an idle carrier or gets a freshly spawned one.
//!
//! ```text
//! submit(task)
//!   ├── idle > 0 ──▶ idle -= 1, hand the task over the job channel
//!   └── idle == 0 ─▶ spawn a carrier whose first job is the task
//!
//! carrier loop
//!   run job ─▶ idle += 1 ─▶ recv_timeout(keep_alive)
//!                              ├── job ─────────────────▶ run job
//!                              └── timeout ─┬─ idle -= 1 ok ─▶ retire
//!                                           └─ reserved ────▶ recv(), run job
//! ```
//!
//! Every idle increment is matched by exactly one decrement, either a
//! submitter's reservation or the carrier's own retirement, so a reserved
//! job always has a carrier waiting for it.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace};

use crate::error::StrandError;
use crate::factory::StrandFactory;
use crate::strand::{Strand, Task};
use crate::StrandBuilder;

/// Stack size of carrier threads unless configured.
pub const DEFAULT_FIBER_STACK_SIZE: usize = 256 * 1024;

/// How long an idle carrier waits for work before it retires.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

static DEFAULT: LazyLock<FiberScheduler> =
    LazyLock::new(|| FiberScheduler::builder().name("skein-fiber").build());

struct Shared {
    name: String,
    stack_size: usize,
    keep_alive: Duration,
    jobs_tx: Sender<Task>,
    jobs_rx: Receiver<Task>,
    /// Carriers waiting for a job and not yet reserved.
    idle: AtomicUsize,
    carriers: AtomicUsize,
    next_carrier: AtomicUsize,
}

/// Worker pool that runs fiber-backed strands.
///
/// Cloning yields another handle to the same pool.
///
/// # Example
///
/// ```
/// use skein_strand::FiberScheduler;
/// use std::time::Duration;
///
/// let scheduler = FiberScheduler::builder()
///     .name("io")
///     .keep_alive(Duration::from_secs(5))
///     .build();
///
/// let fiber = scheduler.spawn(|| {}).unwrap();
/// fiber.join().unwrap();
/// assert!(fiber.is_fiber());
/// ```
#[derive(Clone)]
pub struct FiberScheduler {
    shared: Arc<Shared>,
}

/// Configures a [`FiberScheduler`].
#[derive(Clone, Debug)]
pub struct FiberSchedulerBuilder {
    name: String,
    stack_size: usize,
    keep_alive: Duration,
}

impl Default for FiberSchedulerBuilder {
    fn default() -> Self {
        Self {
            name: "fiber".to_string(),
            stack_size: DEFAULT_FIBER_STACK_SIZE,
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }
}

impl FiberSchedulerBuilder {
    /// Prefix for carrier thread names.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Stack size of each carrier thread.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Idle time after which a carrier retires.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Creates the scheduler. Carriers are spawned on demand.
    pub fn build(self) -> FiberScheduler {
        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();
        FiberScheduler {
            shared: Arc::new(Shared {
                name: self.name,
                stack_size: self.stack_size,
                keep_alive: self.keep_alive,
                jobs_tx,
                jobs_rx,
                idle: AtomicUsize::new(0),
                carriers: AtomicUsize::new(0),
                next_carrier: AtomicUsize::new(0),
            }),
        }
    }
}

impl FiberScheduler {
    /// Returns a builder with default settings.
    pub fn builder() -> FiberSchedulerBuilder {
        FiberSchedulerBuilder::default()
    }

    /// The process-wide scheduler, created on first use.
    pub fn global() -> FiberScheduler {
        DEFAULT.clone()
    }

    /// Creates and starts a fiber on this scheduler.
    pub fn spawn<F>(&self, body: F) -> Result<Strand, StrandError>
    where
        F: FnOnce() + Send + 'static,
    {
        StrandBuilder::new().scheduler(self).spawn(body)
    }

    /// Number of live carrier threads.
    pub fn carriers(&self) -> usize {
        self.shared.carriers.load(Ordering::SeqCst)
    }

    /// Number of carriers waiting for work.
    pub fn idle_carriers(&self) -> usize {
        self.shared.idle.load(Ordering::SeqCst)
    }

    pub(crate) fn submit(&self, task: Task) -> io::Result<()> {
        let reserved = self
            .shared
            .idle
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if reserved {
            trace!(strand = %task.strand(), "fiber handed to idle carrier");
            match self.shared.jobs_tx.send(task) {
                Ok(()) => return Ok(()),
                Err(err) => return self.spawn_carrier(err.into_inner()),
            }
        }
        self.spawn_carrier(task)
    }

    fn spawn_carrier(&self, first: Task) -> io::Result<()> {
        let shared = Arc::clone(&self.shared);
        let index = shared.next_carrier.fetch_add(1, Ordering::Relaxed);

        self.shared.carriers.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("{}-carrier-{index}", shared.name))
            .stack_size(shared.stack_size)
            .spawn(move || carrier_loop(&shared, first));
        if let Err(e) = spawned {
            self.shared.carriers.fetch_sub(1, Ordering::SeqCst);
            return Err(e);
        }

        debug!(scheduler = %self.shared.name, carrier = index, "carrier spawned");
        Ok(())
    }
}

fn carrier_loop(shared: &Shared, first: Task) {
    first.run();

    loop {
        shared.idle.fetch_add(1, Ordering::SeqCst);

        let task = match shared.jobs_rx.recv_timeout(shared.keep_alive) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => {
                let retired = shared
                    .idle
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if retired {
                    break;
                }
                // A submitter reserved us between the timeout and now
                match shared.jobs_rx.recv() {
                    Ok(task) => task,
                    Err(_) => break,
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        task.run();
    }

    shared.carriers.fetch_sub(1, Ordering::SeqCst);
    debug!(scheduler = %shared.name, "carrier retired");
}

impl StrandFactory for FiberScheduler {
    fn new_strand(&self, body: Box<dyn FnOnce() + Send>) -> Result<Strand, StrandError> {
        StrandBuilder::new().scheduler(self).build(body)
    }
}

impl fmt::Debug for FiberScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberScheduler")
            .field("name", &self.shared.name)
            .field("carriers", &self.carriers())
            .field("idle", &self.idle_carriers())
            .finish_non_exhaustive()
    }
}
