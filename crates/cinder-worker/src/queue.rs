//! Per-thread job queues.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cinder_base::{Error, Result};
use cinder_lockfree::Stack;
use parking_lot::{Condvar, Mutex};

use crate::job::Job;

/// Counters and the idle lot shared by every queue of one scheduler.
#[derive(Debug, Default)]
pub(crate) struct Signals {
    /// Jobs given and not yet finished executing.
    pub(crate) in_flight: AtomicUsize,
    /// Jobs sitting in some queue.
    pub(crate) queued: AtomicUsize,
    /// Set once the scheduler stops accepting work.
    pub(crate) closed: AtomicBool,
    /// Takers currently holding or looking for work.
    pub(crate) awake: AtomicUsize,
    /// Workers blocked in [`Signals::park`].
    pub(crate) parked: AtomicUsize,
    /// Worker threads that may park.
    workers: usize,
    idle: Mutex<()>,
    wake: Condvar,
}

impl Signals {
    pub(crate) fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    fn admit(&self, count: usize) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        // Counted before publication, so a barrier never sees zero while
        // the jobs are still on their way in.
        self.in_flight.fetch_add(count, Ordering::SeqCst);
        self.queued.fetch_add(count, Ordering::SeqCst);
        Ok(())
    }

    /// Wakes parked workers after a publication, unless every taker is
    /// already awake.
    fn published(&self) {
        // The main-queue owner is a taker too.
        if self.workers > 0 && self.awake.load(Ordering::SeqCst) <= self.workers {
            self.wake_all();
        }
    }

    pub(crate) fn finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn wake_all(&self) {
        let _idle = self.idle.lock();
        self.wake.notify_all();
    }

    /// Blocks for at most `timeout` if `still_idle` holds under the idle
    /// lock. Anything that can end idleness calls [`Signals::wake_all`]
    /// after changing the state `still_idle` reads.
    pub(crate) fn park(&self, still_idle: impl FnOnce() -> bool, timeout: Duration) {
        let mut idle = self.idle.lock();
        if !still_idle() {
            return;
        }
        self.parked.fetch_add(1, Ordering::SeqCst);
        self.wake.wait_for(&mut idle, timeout);
        self.parked.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An unbounded lock-free queue of jobs, owned by one worker (or by the
/// caller, for the main queue) and stolen from by the others.
///
/// Jobs are taken newest first.
pub struct JobQueue {
    jobs: Stack<Box<dyn Job>>,
    signals: Arc<Signals>,
}

impl JobQueue {
    pub(crate) fn new(signals: Arc<Signals>) -> Self {
        Self {
            jobs: Stack::new(),
            signals,
        }
    }

    /// Gives one job to this queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] if the scheduler no longer accepts
    /// work; the job is dropped without running.
    pub fn give_one<J: Job + 'static>(&self, job: J) -> Result<()> {
        self.give_boxed(Box::new(job))
    }

    /// Gives an already boxed job to this queue.
    ///
    /// # Errors
    ///
    /// Same as [`JobQueue::give_one`].
    pub fn give_boxed(&self, job: Box<dyn Job>) -> Result<()> {
        self.signals.admit(1)?;
        self.jobs.push(job);
        self.signals.published();
        Ok(())
    }

    /// Gives every job of `jobs` to this queue. Takers see either none or
    /// all of them. Returns the number of jobs given.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] if the scheduler no longer accepts
    /// work; none of the jobs is given.
    pub fn give_many<I>(&self, jobs: I) -> Result<usize>
    where
        I: IntoIterator<Item = Box<dyn Job>>,
    {
        if self.signals.closed.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let batch: Vec<_> = jobs.into_iter().collect();
        if batch.is_empty() {
            return Ok(0);
        }
        self.signals.admit(batch.len())?;
        let given = self.jobs.push_batch(batch);
        self.signals.published();
        Ok(given)
    }

    /// Takes the newest job, if any.
    pub(crate) fn take(&self) -> Option<Box<dyn Job>> {
        let job = self.jobs.pop()?;
        self.signals.queued.fetch_sub(1, Ordering::SeqCst);
        Some(job)
    }

    /// Returns whether this queue holds any job.
    pub fn has_jobs(&self) -> bool {
        !self.jobs.is_empty()
    }

    /// Returns the number of jobs in this queue.
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

/// A job taken with [`Scheduler::try_take_one`](crate::Scheduler::try_take_one).
///
/// The job counts as in flight until this handle is executed or dropped,
/// so barriers wait for it either way.
pub struct TakenJob {
    job: Option<Box<dyn Job>>,
    signals: Arc<Signals>,
}

impl TakenJob {
    pub(crate) fn new(job: Box<dyn Job>, signals: Arc<Signals>) -> Self {
        Self {
            job: Some(job),
            signals,
        }
    }

    /// Runs the job, handing it `queue` for any follow-up work.
    pub fn execute(mut self, queue: &JobQueue) {
        if let Some(job) = self.job.take() {
            job.execute(queue);
        }
    }
}

impl Drop for TakenJob {
    fn drop(&mut self) {
        self.signals.finished();
    }
}

impl fmt::Debug for TakenJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TakenJob")
            .field("executed", &self.job.is_none())
            .finish()
    }
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("jobs", &self.job_count())
            .finish()
    }
}
