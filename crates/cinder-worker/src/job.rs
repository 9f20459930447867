//! Job definitions.

use crate::queue::JobQueue;

/// A unit of work.
///
/// A job runs exactly once, on whichever thread takes it. It receives the
/// queue of that thread so follow-up work stays local unless stolen.
pub trait Job: Send {
    /// Runs the job.
    fn execute(self: Box<Self>, queue: &JobQueue);
}

impl<F> Job for F
where
    F: FnOnce(&JobQueue) + Send,
{
    fn execute(self: Box<Self>, queue: &JobQueue) {
        (*self)(queue)
    }
}
