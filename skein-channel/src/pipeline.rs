//! Channel-to-channel transfer through a transformer, optionally parallel.
//!
//! Every input message gets its own result channel. The transformer sends
//! any number of results into it; the pipeline closes it when the
//! transformer returns and forwards its contents to the destination. Result
//! channels are forwarded in input order, so output order follows input
//! order however many workers run.
//!
//! ```text
//!            ┌──────── jobs ────────┐
//! from ──▶ feed ──▶ worker 1..n ──▶ result channels
//!            └──── results (order) ─┴──▶ collector ──▶ to
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use skein_strand::{Strand, StrandBuilder, StrandError, StrandFactory};
use tracing::debug;

use crate::channel::{Channel, OverflowPolicy, channel, unbounded};
use crate::error::{PipelineError, RecvError, SendError};

type Transformer<S, T> = Arc<dyn Fn(S, &Channel<T>) + Send + Sync>;

/// Moves messages from one channel to another through a transformer.
///
/// # Example
///
/// ```
/// use skein_channel::{unbounded, Pipeline};
///
/// let from = unbounded::<u32>();
/// let to = unbounded::<String>();
/// for i in 1..=3 {
///     from.send(i).unwrap();
/// }
/// from.close();
///
/// let pipeline = Pipeline::new(from, to.clone(), |n, out| {
///     for _ in 0..n {
///         out.send(n.to_string()).unwrap();
///     }
/// })
/// .parallelism(2);
///
/// assert_eq!(pipeline.run().unwrap(), 6);
/// let results: Vec<_> = to.iter().collect();
/// assert_eq!(results, ["1", "2", "2", "3", "3", "3"]);
/// ```
pub struct Pipeline<S, T> {
    from: Channel<S>,
    to: Channel<T>,
    transformer: Transformer<S, T>,
    parallelism: usize,
    close_to: bool,
    factory: Arc<dyn StrandFactory + Send + Sync>,
    transferred: Arc<AtomicU64>,
}

/// Closes a result channel even if the transformer panics.
struct CloseOnDrop<'a, T>(&'a Channel<T>);

impl<T> Drop for CloseOnDrop<'_, T> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Shuts a parallel pipeline down when a worker dies mid-transform.
///
/// Closing `jobs` and `order` stops the feeder. Jobs nobody will run get
/// their result channels closed so the collector does not wait on them.
struct AbortOnPanic<S, T> {
    jobs: Channel<(S, Channel<T>)>,
    order: Channel<Channel<T>>,
}

impl<S, T> Drop for AbortOnPanic<S, T> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        debug!("pipeline worker panicked, aborting");
        self.jobs.close();
        self.order.close();
        for (_, results) in self.jobs.iter() {
            results.close();
        }
    }
}

impl<S, T> Pipeline<S, T>
where
    S: Send + 'static,
    T: Send + 'static,
{
    /// Creates a sequential pipeline that closes `to` when `from` is drained.
    pub fn new<F>(from: Channel<S>, to: Channel<T>, transformer: F) -> Self
    where
        F: Fn(S, &Channel<T>) + Send + Sync + 'static,
    {
        Self {
            from,
            to,
            transformer: Arc::new(transformer),
            parallelism: 0,
            close_to: true,
            factory: Arc::new(StrandBuilder::new().fiber()),
            transferred: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of worker strands. 0 runs the transformer in the calling
    /// strand.
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Whether to close the destination once the source is drained.
    pub fn close_to(mut self, close_to: bool) -> Self {
        self.close_to = close_to;
        self
    }

    /// Factory for worker and collector strands. Defaults to fibers on the
    /// global scheduler.
    pub fn strand_factory<F>(mut self, factory: F) -> Self
    where
        F: StrandFactory + Send + Sync + 'static,
    {
        self.factory = Arc::new(factory);
        self
    }

    /// Results forwarded so far. May be read while [`run`](Self::run) is in
    /// progress.
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    /// Transfers until the source is closed and drained, returning the
    /// number of results forwarded.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Source`] if the source was closed with an error.
    ///   The destination is closed with the same error when `close_to` is set.
    /// - [`PipelineError::Closed`] if the destination was closed early.
    /// - [`PipelineError::Interrupted`] if the calling strand was interrupted.
    /// - [`PipelineError::Strand`] if a worker could not start or panicked.
    pub fn run(&self) -> Result<u64, PipelineError> {
        let result = if self.parallelism == 0 {
            self.run_sequential()
        } else {
            self.run_parallel()
        };

        if self.close_to {
            match &result {
                Err(PipelineError::Source(cause)) => self.to.close_with(Arc::clone(cause)),
                _ => self.to.close(),
            }
        }
        let transferred = self.transferred();
        debug!(
            transferred,
            parallelism = self.parallelism,
            ok = result.is_ok(),
            "pipeline finished"
        );
        result.map(|()| transferred)
    }

    fn run_sequential(&self) -> Result<(), PipelineError> {
        loop {
            let msg = match self.from.receive() {
                Ok(msg) => msg,
                Err(e) => return source_end(e),
            };

            let results = unbounded();
            {
                let _close = CloseOnDrop(&results);
                (self.transformer)(msg, &results);
            }
            forward(&results, &self.to, &self.transferred)?;
        }
    }

    fn run_parallel(&self) -> Result<(), PipelineError> {
        let n = self.parallelism;
        let jobs = channel::<(S, Channel<T>)>(n, OverflowPolicy::Block);
        let order = channel::<Channel<T>>(n, OverflowPolicy::Block);
        let failure: Arc<Mutex<Option<PipelineError>>> = Arc::new(Mutex::new(None));

        let mut strands = Vec::with_capacity(n + 1);
        for _ in 0..n {
            let abort = AbortOnPanic {
                jobs: jobs.clone(),
                order: order.clone(),
            };
            let transformer = Arc::clone(&self.transformer);
            let worker = self.start(Box::new(move || {
                let abort = abort;
                for (msg, results) in abort.jobs.iter() {
                    let _close = CloseOnDrop(&results);
                    transformer(msg, &results);
                }
            }));
            match worker {
                Ok(worker) => strands.push(worker),
                Err(e) => {
                    jobs.close();
                    order.close();
                    let _ = join_all(&strands);
                    return Err(e.into());
                }
            }
        }

        let collector = {
            let (jobs, order, to) = (jobs.clone(), order.clone(), self.to.clone());
            let (transferred, failure) = (Arc::clone(&self.transferred), Arc::clone(&failure));
            self.start(Box::new(move || {
                for results in order.iter() {
                    if let Err(e) = forward(&results, &to, &transferred) {
                        *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
                        // unblock the feeder and let workers drain
                        jobs.close();
                        order.close();
                        return;
                    }
                }
            }))
        };
        match collector {
            Ok(collector) => strands.push(collector),
            Err(e) => {
                jobs.close();
                order.close();
                let _ = join_all(&strands);
                return Err(e.into());
            }
        }

        let fed = self.feed(&jobs, &order);
        jobs.close();
        order.close();

        let joined = join_all(&strands);
        if let Some(e) = failure.lock().unwrap_or_else(PoisonError::into_inner).take() {
            return Err(e);
        }
        fed?;
        joined.map_err(PipelineError::from)
    }

    /// Hands every source message to the workers and its result channel to
    /// the collector, in source order.
    fn feed(
        &self,
        jobs: &Channel<(S, Channel<T>)>,
        order: &Channel<Channel<T>>,
    ) -> Result<(), PipelineError> {
        loop {
            let msg = match self.from.receive() {
                Ok(msg) => msg,
                Err(e) => return source_end(e),
            };

            let results = unbounded();
            if order.send(results.clone()).is_err() {
                // the collector gave up; its error wins
                return Ok(());
            }
            if jobs.send((msg, results.clone())).is_err() {
                results.close();
                return Ok(());
            }
        }
    }

    fn start(&self, body: Box<dyn FnOnce() + Send>) -> Result<Strand, StrandError> {
        let strand = self.factory.new_strand(body)?;
        strand.start()?;
        Ok(strand)
    }
}

fn source_end(e: RecvError) -> Result<(), PipelineError> {
    match e {
        RecvError::Closed => Ok(()),
        RecvError::ClosedExceptionally(cause) => Err(PipelineError::Source(cause)),
        RecvError::Interrupted | RecvError::Timeout => Err(PipelineError::Interrupted),
    }
}

/// Drains a result channel into the destination.
fn forward<T>(
    results: &Channel<T>,
    to: &Channel<T>,
    transferred: &AtomicU64,
) -> Result<(), PipelineError> {
    loop {
        let out = match results.receive() {
            Ok(out) => out,
            Err(RecvError::Interrupted) => return Err(PipelineError::Interrupted),
            Err(_) => return Ok(()),
        };
        match to.send(out) {
            Ok(()) => {
                transferred.fetch_add(1, Ordering::Relaxed);
            }
            Err(SendError::Interrupted(_)) => return Err(PipelineError::Interrupted),
            Err(_) => return Err(PipelineError::Closed),
        }
    }
}

/// Joins every strand, returning the first failure.
fn join_all(strands: &[Strand]) -> Result<(), StrandError> {
    let mut first = Ok(());
    for strand in strands {
        if let Err(e) = strand.join() {
            if first.is_ok() {
                first = Err(e);
            }
        }
    }
    first
}

impl<S, T> fmt::Debug for Pipeline<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("parallelism", &self.parallelism)
            .field("close_to", &self.close_to)
            .field("transferred", &self.transferred.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    fn source(values: impl IntoIterator<Item = u32>) -> Channel<u32> {
        let from = unbounded();
        for v in values {
            from.send(v).unwrap();
        }
        from.close();
        from
    }

    #[test]
    fn sequential_preserves_order() {
        let to = unbounded();
        let pipeline = Pipeline::new(source(1..=4), to.clone(), |n, out| {
            out.send(n + 1).unwrap();
        });
        assert_eq!(pipeline.run().unwrap(), 4);
        assert_eq!(pipeline.transferred(), 4);
        assert_eq!(to.iter().collect::<Vec<_>>(), vec![2, 3, 4, 5]);
        assert!(to.is_drained());
    }

    #[test]
    fn parallel_preserves_order() {
        let to = unbounded();
        let pipeline = Pipeline::new(source(0..200), to.clone(), |n, out| {
            // later inputs finish first
            if n % 7 == 0 {
                skein_strand::sleep(Duration::from_millis(1)).unwrap();
            }
            out.send(n * 2).unwrap();
            out.close();
        })
        .parallelism(4);

        assert_eq!(pipeline.run().unwrap(), 200);
        let got: Vec<_> = to.iter().collect();
        assert_eq!(got, (0..200).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn close_to_can_be_disabled() {
        let to = unbounded::<u32>();
        let pipeline = Pipeline::new(source([1]), to.clone(), |n, out| {
            out.send(n).unwrap();
        })
        .close_to(false);
        pipeline.run().unwrap();
        assert!(!to.is_closed());
        assert_eq!(to.try_receive().unwrap(), 1);
    }

    #[test]
    fn source_failure_propagates() {
        let from = unbounded::<u32>();
        from.send(1).unwrap();
        from.close_with(Arc::new(io::Error::other("upstream")));
        let to = unbounded();

        let pipeline = Pipeline::new(from, to.clone(), |n, out| out.send(n).unwrap());
        assert!(matches!(pipeline.run(), Err(PipelineError::Source(_))));
        assert_eq!(to.receive().unwrap(), 1);
        assert!(matches!(to.receive(), Err(RecvError::ClosedExceptionally(_))));
    }

    #[test]
    fn closed_destination_stops_parallel_pipeline() {
        let to = unbounded::<u32>();
        to.close();
        let pipeline = Pipeline::new(source(0..50), to, |n, out| out.send(n).unwrap())
            .parallelism(3);
        assert!(matches!(pipeline.run(), Err(PipelineError::Closed)));
    }

    #[test]
    fn lone_worker_panic_fails_instead_of_hanging() {
        let to = unbounded::<u32>();
        let pipeline = Pipeline::new(source(0..10), to.clone(), |n, out| {
            if n == 0 {
                panic!("first input rejected");
            }
            out.send(n).unwrap();
        })
        .parallelism(1)
        .strand_factory(StrandBuilder::new().fiber().uncaught_exception_handler(|_, _| {}));

        let runner = StrandBuilder::new()
            .spawn(move || match pipeline.run() {
                Err(PipelineError::Strand(StrandError::Failed(failure))) => {
                    assert_eq!(failure.cause().panic_message(), Some("first input rejected"));
                }
                other => panic!("expected worker failure, got {other:?}"),
            })
            .unwrap();
        runner.join_timeout(Duration::from_secs(10)).unwrap();
        assert!(to.is_closed());
    }

    #[test]
    fn worker_panic_is_reported() {
        let to = unbounded::<u32>();
        let pipeline = Pipeline::new(source(0..4), to, |n, out| {
            if n == 2 {
                panic!("bad input");
            }
            out.send(n).unwrap();
        })
        .parallelism(2)
        .strand_factory(StrandBuilder::new().fiber().uncaught_exception_handler(|_, _| {}));

        match pipeline.run() {
            Err(PipelineError::Strand(StrandError::Failed(failure))) => {
                assert_eq!(failure.cause().panic_message(), Some("bad input"));
            }
            other => panic!("expected worker failure, got {other:?}"),
        }
    }
}
