//! Work-stealing scheduler.

use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cinder_base::strategy::ACTIVE;
use cinder_base::utils::XorShift64;
use cinder_base::{Error, Result};
use cinder_reclaim::collect;
use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::job::Job;
use crate::queue::{JobQueue, Signals, TakenJob};

/// Environment variable that overrides the worker count.
pub const WORKERS_ENV: &str = "CINDER_WORKERS";

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads. The single-threaded strategy ignores this
    /// and spawns none.
    pub workers: usize,
    /// Prefix for worker thread names.
    pub thread_name: String,
    /// Longest time an idle worker stays parked before looking for work
    /// again on its own.
    pub park_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus(),
            thread_name: "cinder-worker".to_string(),
            park_timeout: Duration::from_millis(100),
        }
    }
}

impl SchedulerConfig {
    /// Default configuration with the worker count taken from
    /// `CINDER_WORKERS` when it is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the variable is set but is not a
    /// worker count.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(WORKERS_ENV) {
            config.workers = raw.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("{WORKERS_ENV}={raw:?} is not a worker count"))
            })?;
        }
        Ok(config)
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

/// Scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Jobs executed, including ones that panicked.
    pub executed: u64,
    /// Jobs taken from a queue other than the taker's own.
    pub stolen: u64,
    /// Jobs that panicked.
    pub panicked: u64,
    /// Reclamation rounds completed.
    pub reclamation_rounds: u64,
}

#[derive(Default)]
struct Counters {
    executed: AtomicU64,
    stolen: AtomicU64,
    panicked: AtomicU64,
    reclamation_rounds: AtomicU64,
}

/// State of the reclamation barrier that closes each `finish_jobs` call.
#[derive(Default)]
struct Round {
    /// Bumped to open a round.
    generation: AtomicU64,
    /// Workers that have joined the current round.
    ready: AtomicUsize,
    /// Workers that have collected in the current round.
    done: AtomicUsize,
}

struct Shared {
    /// One queue per worker, then the main queue.
    queues: Box<[JobQueue]>,
    signals: Arc<Signals>,
    stop: AtomicBool,
    park_timeout: Duration,
    round: Round,
    counters: Counters,
}

thread_local! {
    static RNG: RefCell<XorShift64> = RefCell::new(XorShift64::new(seed()));
}

fn seed() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);
    NEXT.fetch_add(0x9E37_79B9, Ordering::Relaxed)
}

impl Shared {
    fn workers(&self) -> usize {
        self.queues.len() - 1
    }

    fn try_take_one(&self, index: usize, already_awake: bool) -> Option<Box<dyn Job>> {
        let found = self.scan(index);
        match (&found, already_awake) {
            (Some(_), false) => {
                self.signals.awake.fetch_add(1, Ordering::SeqCst);
            }
            (None, true) => {
                self.signals.awake.fetch_sub(1, Ordering::SeqCst);
            }
            _ => {}
        }
        found
    }

    fn scan(&self, index: usize) -> Option<Box<dyn Job>> {
        if let Some(job) = self.queues.get(index).and_then(JobQueue::take) {
            return Some(job);
        }
        if self.signals.queued.load(Ordering::SeqCst) == 0 {
            return None;
        }

        let count = self.queues.len();
        let start = RNG
            .try_with(|rng| rng.borrow_mut().next_below(count))
            .unwrap_or(0);
        (0..count)
            .map(|offset| (start + offset) % count)
            .filter(|&victim| victim != index)
            .find_map(|victim| self.queues[victim].take())
            .inspect(|_| {
                self.counters.stolen.fetch_add(1, Ordering::Relaxed);
            })
    }

    fn run(&self, job: Box<dyn Job>, index: usize) {
        let queue = &self.queues[index];
        if panic::catch_unwind(AssertUnwindSafe(|| job.execute(queue))).is_err() {
            self.counters.panicked.fetch_add(1, Ordering::Relaxed);
            warn!(queue = index, "job panicked");
        }
        self.counters.executed.fetch_add(1, Ordering::Relaxed);
        self.signals.finished();
    }

    /// Checks a worker in to the open reclamation round, then collects once
    /// every worker has.
    fn join_round(&self, index: usize) {
        let workers = self.workers();
        self.round.ready.fetch_add(1, Ordering::SeqCst);
        let backoff = Backoff::new();
        while self.round.ready.load(Ordering::SeqCst) < workers {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            backoff.snooze();
        }
        let freed = collect();
        trace!(worker = index, freed, "collected in reclamation round");
        self.round.done.fetch_add(1, Ordering::SeqCst);
    }

    /// Parks an idle worker until work is published, a round opens or the
    /// scheduler stops.
    fn park(&self, seen_round: u64) {
        self.signals.park(
            || {
                self.signals.queued.load(Ordering::SeqCst) == 0
                    && !self.stop.load(Ordering::SeqCst)
                    && self.round.generation.load(Ordering::SeqCst) == seen_round
            },
            self.park_timeout,
        );
    }
}

fn worker_loop(shared: Arc<Shared>, index: usize) {
    debug!(worker = index, "worker started");
    let mut awake = false;
    // Rounds opened before this thread got scheduled still wait for it.
    let mut seen_round = 0;
    let backoff = Backoff::new();

    loop {
        let round = shared.round.generation.load(Ordering::SeqCst);
        if round != seen_round {
            seen_round = round;
            shared.join_round(index);
        }

        if let Some(job) = shared.try_take_one(index, awake) {
            awake = true;
            shared.run(job, index);
            backoff.reset();
            continue;
        }
        awake = false;

        if shared.stop.load(Ordering::SeqCst) {
            break;
        }
        if backoff.is_completed() {
            shared.park(seen_round);
            backoff.reset();
        } else {
            // No work, yield
            backoff.snooze();
        }
    }

    // Anything this thread retired is adopted by the next collector.
    collect();
    debug!(worker = index, "worker stopped");
}

/// Work-stealing job scheduler.
///
/// Each worker owns a queue and steals from the others when its own runs
/// dry. The thread that owns the scheduler has a queue of its own, the main
/// queue, which it drains while waiting in [`Scheduler::finish_jobs`].
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    /// Serializes barrier rounds.
    barrier: Mutex<()>,
    stopped: bool,
}

impl Scheduler {
    /// Starts a scheduler with `config.workers` worker threads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Spawn`] if a worker thread cannot be started. Any
    /// workers already started are stopped again.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let workers = if ACTIVE.is_concurrent() {
            config.workers
        } else {
            0
        };
        let signals = Arc::new(Signals::new(workers));
        let queues = (0..=workers)
            .map(|_| JobQueue::new(signals.clone()))
            .collect();
        let shared = Arc::new(Shared {
            queues,
            signals,
            stop: AtomicBool::new(false),
            park_timeout: config.park_timeout,
            round: Round::default(),
            counters: Counters::default(),
        });

        let mut scheduler = Self {
            shared,
            workers: Vec::with_capacity(workers),
            barrier: Mutex::new(()),
            stopped: false,
        };
        for index in 0..workers {
            let shared = scheduler.shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, index))
                .spawn(move || worker_loop(shared, index));
            match spawned {
                Ok(handle) => scheduler.workers.push(handle),
                Err(e) => {
                    scheduler.stop_workers();
                    return Err(Error::Spawn {
                        index,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(workers, strategy = %ACTIVE, "scheduler started");
        Ok(scheduler)
    }

    /// Starts a scheduler configured from the environment.
    ///
    /// # Errors
    ///
    /// See [`SchedulerConfig::from_env`] and [`Scheduler::new`].
    pub fn from_env() -> Result<Self> {
        Self::new(SchedulerConfig::from_env()?)
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.shared.workers()
    }

    /// Index of the main queue for [`Scheduler::try_take_one`].
    pub fn main_index(&self) -> usize {
        self.shared.workers()
    }

    /// The queue owned by the scheduler's caller.
    pub fn get_main_queue(&self) -> &JobQueue {
        &self.shared.queues[self.main_index()]
    }

    /// Gives one job to the main queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] once shutdown has begun.
    pub fn give_one<J: Job + 'static>(&self, job: J) -> Result<()> {
        self.get_main_queue().give_one(job)
    }

    /// Gives a batch of jobs to the main queue in one publication.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] once shutdown has begun.
    pub fn give_many<I>(&self, jobs: I) -> Result<usize>
    where
        I: IntoIterator<Item = Box<dyn Job>>,
    {
        self.get_main_queue().give_many(jobs)
    }

    /// Takes a job for the thread that owns queue `index`: its own queue
    /// first, then the others starting from a random one.
    ///
    /// `already_awake` says whether the caller is counted as awake; the
    /// count is raised when a sleeping taker finds work and lowered when an
    /// awake one finds none. Parked workers are only woken for new work
    /// while some taker is not awake.
    ///
    /// The job stays in flight until the returned handle is executed or
    /// dropped, so do not hold it across [`Scheduler::finish_jobs`].
    pub fn try_take_one(&self, index: usize, already_awake: bool) -> Option<TakenJob> {
        self.shared
            .try_take_one(index, already_awake)
            .map(|job| TakenJob::new(job, self.shared.signals.clone()))
    }

    /// Number of takers currently counted as awake.
    pub fn awake_workers(&self) -> usize {
        self.shared.signals.awake.load(Ordering::SeqCst)
    }

    /// Number of workers blocked waiting for work.
    pub fn parked_workers(&self) -> usize {
        self.shared.signals.parked.load(Ordering::SeqCst)
    }

    /// Whether any queue holds a job.
    pub fn has_jobs(&self) -> bool {
        self.shared.signals.queued.load(Ordering::SeqCst) > 0
    }

    /// Jobs given and not yet finished, queued or running.
    pub fn job_count(&self) -> usize {
        self.shared.signals.in_flight.load(Ordering::SeqCst)
    }

    /// Runs jobs on the calling thread until every job given so far, and
    /// every job those give in turn, has finished. Then runs a reclamation
    /// round: once every worker has checked in, each one and the caller
    /// collect their deferred stacks.
    pub fn finish_jobs(&self) {
        let _barrier = self.barrier.lock();
        let shared = &self.shared;
        let main = self.main_index();
        let backoff = Backoff::new();
        while shared.signals.in_flight.load(Ordering::SeqCst) > 0 {
            match shared.scan(main) {
                Some(job) => {
                    shared.run(job, main);
                    backoff.reset();
                }
                None => backoff.snooze(),
            }
        }

        self.reclamation_round();
    }

    fn reclamation_round(&self) {
        let shared = &self.shared;
        let workers = shared.workers();
        shared.round.ready.store(0, Ordering::SeqCst);
        shared.round.done.store(0, Ordering::SeqCst);
        let generation = shared.round.generation.fetch_add(1, Ordering::SeqCst) + 1;
        shared.signals.wake_all();

        let backoff = Backoff::new();
        while shared.round.ready.load(Ordering::SeqCst) < workers {
            backoff.snooze();
        }
        let freed = collect();
        while shared.round.done.load(Ordering::SeqCst) < workers {
            backoff.snooze();
        }

        shared
            .counters
            .reclamation_rounds
            .fetch_add(1, Ordering::Relaxed);
        debug!(generation, workers, freed, "reclamation round complete");
    }

    /// Snapshot of the scheduler counters.
    pub fn stats(&self) -> SchedulerStats {
        let counters = &self.shared.counters;
        SchedulerStats {
            executed: counters.executed.load(Ordering::Relaxed),
            stolen: counters.stolen.load(Ordering::Relaxed),
            panicked: counters.panicked.load(Ordering::Relaxed),
            reclamation_rounds: counters.reclamation_rounds.load(Ordering::Relaxed),
        }
    }

    /// Drains every queue, stops accepting work, and joins the workers.
    ///
    /// Jobs that try to give work after this point get
    /// [`Error::ShuttingDown`]. Calling it again does nothing.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.finish_jobs();
        self.shared.signals.closed.store(true, Ordering::SeqCst);
        // Jobs admitted while the flag went up still run.
        self.finish_jobs();

        self.stop_workers();
        info!(stats = ?self.stats(), "scheduler stopped");
    }

    /// Stops and joins the workers without draining.
    fn stop_workers(&mut self) {
        self.stopped = true;
        self.shared.signals.closed.store(true, Ordering::SeqCst);
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.signals.wake_all();
        for (index, worker) in self.workers.drain(..).enumerate() {
            if worker.join().is_err() {
                warn!(worker = index, "worker thread panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.worker_count())
            .field("in_flight", &self.job_count())
            .field("stopped", &self.stopped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn config(workers: usize) -> SchedulerConfig {
        SchedulerConfig {
            workers,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn test_jobs_run_once() {
        let scheduler = Scheduler::new(config(4)).unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        for _ in 0..100 {
            let h = hits.clone();
            scheduler
                .give_one(move |_: &JobQueue| {
                    h.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        scheduler.finish_jobs();
        assert_eq!(hits.load(Ordering::SeqCst), 100);
        assert_eq!(scheduler.job_count(), 0);
        assert_eq!(scheduler.stats().executed, 100);
        assert_eq!(scheduler.stats().reclamation_rounds, 1);
    }

    #[test]
    fn test_zero_workers_runs_on_caller() {
        let scheduler = Scheduler::new(config(0)).unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        scheduler
            .give_one(move |_: &JobQueue| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(scheduler.job_count(), 1);
        scheduler.finish_jobs();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_try_take_one_tracks_awake() {
        let scheduler = Scheduler::new(config(0)).unwrap();
        let main = scheduler.main_index();
        scheduler.give_one(|_: &JobQueue| {}).unwrap();

        let job = scheduler.try_take_one(main, false).unwrap();
        assert_eq!(scheduler.awake_workers(), 1);
        assert!(scheduler.try_take_one(main, true).is_none());
        assert_eq!(scheduler.awake_workers(), 0);
        assert_eq!(scheduler.job_count(), 1);
        job.execute(scheduler.get_main_queue());
        assert_eq!(scheduler.job_count(), 0);
        scheduler.finish_jobs();
    }

    #[test]
    fn test_dropped_taken_job_does_not_block_barrier() {
        let scheduler = Scheduler::new(config(0)).unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        scheduler
            .give_one(move |_: &JobQueue| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        drop(scheduler.try_take_one(scheduler.main_index(), false));
        scheduler.finish_jobs();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.job_count(), 0);
    }

    #[test]
    fn test_idle_workers_park() {
        let scheduler = Scheduler::new(SchedulerConfig {
            park_timeout: Duration::from_secs(60),
            ..config(2)
        })
        .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while scheduler.parked_workers() < scheduler.worker_count() {
            assert!(std::time::Instant::now() < deadline, "workers never parked");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(scheduler.awake_workers(), 0);
    }

    #[test]
    fn test_panicking_job_is_contained() {
        let scheduler = Scheduler::new(config(2)).unwrap();
        scheduler
            .give_one(|_: &JobQueue| panic!("job failure"))
            .unwrap();
        scheduler.finish_jobs();
        assert_eq!(scheduler.stats().panicked, 1);
        assert_eq!(scheduler.job_count(), 0);
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let mut scheduler = Scheduler::new(config(2)).unwrap();
        scheduler.shutdown();
        assert_eq!(scheduler.give_one(|_: &JobQueue| {}), Err(Error::ShuttingDown));
        scheduler.shutdown();
    }
}
