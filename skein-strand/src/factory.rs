use crate::error::StrandError;
use crate::strand::Strand;

/// Creates unstarted strands.
///
/// Lets code that spawns workers (such as a pipeline) stay agnostic of
/// whether they run as threads or fibers, and on which scheduler.
pub trait StrandFactory {
    /// Creates a strand running `body`. The caller starts it.
    fn new_strand(&self, body: Box<dyn FnOnce() + Send>) -> Result<Strand, StrandError>;
}
