//! Build-time concurrency strategy selection.
//!
//! Every structure in cinder runs the same algorithm under all three
//! strategies. What changes is how mutating operations are admitted:
//!
//! - [`Strategy::LockFree`]: no admission control, contention is resolved by
//!   compare-and-swap retry.
//! - [`Strategy::Locking`]: each structure owns a short mutex that serializes
//!   its mutating operations. Readers stay lock-free.
//! - [`Strategy::SingleThreaded`]: no locking at all, and the scheduler runs
//!   every job on the calling thread.
//!
//! The selection comes from cargo features on this crate. `single-threaded`
//! wins over `locking`, so enabling both never fails to build.

use std::fmt;
use std::marker::PhantomData;

/// The concurrency strategy compiled into this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// One thread only; the scheduler spawns no workers.
    SingleThreaded,
    /// Mutating operations take a per-structure mutex.
    Locking,
    /// Lock-free algorithms throughout.
    LockFree,
}

/// The strategy selected by the enabled cargo features.
pub const ACTIVE: Strategy = if cfg!(feature = "single-threaded") {
    Strategy::SingleThreaded
} else if cfg!(feature = "locking") {
    Strategy::Locking
} else {
    Strategy::LockFree
};

impl Strategy {
    /// Returns whether worker threads may run concurrently under this strategy.
    #[must_use]
    pub const fn is_concurrent(self) -> bool {
        !matches!(self, Self::SingleThreaded)
    }

    /// Short lowercase name, used in log fields.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::SingleThreaded => "single-threaded",
            Self::Locking => "locking",
            Self::LockFree => "lock-free",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Admission control for the mutating operations of one structure.
///
/// Under the locking strategy this wraps a mutex; otherwise it is zero-sized
/// and [`Serializer::enter`] compiles to nothing.
#[derive(Default)]
pub struct Serializer {
    #[cfg(all(feature = "locking", not(feature = "single-threaded")))]
    lock: parking_lot::Mutex<()>,
}

impl Serializer {
    /// Creates a new serializer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters a critical section that lasts until the returned value drops.
    #[inline]
    pub fn enter(&self) -> Section<'_> {
        Section {
            #[cfg(all(feature = "locking", not(feature = "single-threaded")))]
            _guard: self.lock.lock(),
            _marker: PhantomData,
        }
    }
}

impl fmt::Debug for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serializer")
            .field("strategy", &ACTIVE)
            .finish()
    }
}

/// An open critical section. Pinned to the thread that entered it.
#[must_use = "the section ends as soon as it is dropped"]
pub struct Section<'a> {
    #[cfg(all(feature = "locking", not(feature = "single-threaded")))]
    _guard: parking_lot::MutexGuard<'a, ()>,
    _marker: PhantomData<(&'a Serializer, *const ())>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_strategy_matches_features() {
        if cfg!(feature = "single-threaded") {
            assert_eq!(ACTIVE, Strategy::SingleThreaded);
            assert!(!ACTIVE.is_concurrent());
        } else if cfg!(feature = "locking") {
            assert_eq!(ACTIVE, Strategy::Locking);
        } else {
            assert_eq!(ACTIVE, Strategy::LockFree);
            assert_eq!(ACTIVE.to_string(), "lock-free");
        }
    }

    #[test]
    fn test_sections_nest_across_serializers() {
        let a = Serializer::new();
        let b = Serializer::new();
        let _outer = a.enter();
        let _inner = b.enter();
    }

    #[test]
    fn test_section_reentry_after_drop() {
        let s = Serializer::new();
        drop(s.enter());
        drop(s.enter());
    }
}
