//! Unified error types for cinder.
//!
//! Transient contention never shows up here: it is absorbed by optimistic
//! retry inside each structure. Contract violations (iterating at an unpinned
//! epoch, for example) panic instead of returning an error.

use thiserror::Error;

/// The main error type for cinder operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A node or buffer allocation failed. No part of the operation is visible.
    #[error("Out of memory: failed to allocate {bytes} bytes")]
    OutOfMemory {
        /// Size of the rejected allocation.
        bytes: usize,
    },

    /// Work was given to a scheduler that is draining or stopped.
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    /// A configuration value was rejected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operating system refused to start a worker thread.
    #[error("Failed to spawn worker {index}: {reason}")]
    Spawn {
        /// Index of the worker that could not start.
        index: usize,
        /// Error reported by the operating system.
        reason: String,
    },
}

impl Error {
    /// Returns whether this error is the allocation-failure condition.
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
