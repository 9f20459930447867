//! # cinder-worker
//!
//! Work-stealing job scheduler.
//!
//! - Every worker thread owns a lock-free job queue and steals from the
//!   others when it runs dry
//! - The caller owns a main queue and helps drain it in `finish_jobs`
//! - Each `finish_jobs` ends with a reclamation round in which every worker
//!   frees what it has retired
//! - Idle workers park until new work is published

pub mod job;
pub mod pool;
pub mod queue;

pub use job::Job;
pub use pool::{Scheduler, SchedulerConfig, SchedulerStats, WORKERS_ENV};
pub use queue::{JobQueue, TakenJob};
