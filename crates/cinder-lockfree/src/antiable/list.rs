//! Antiable list: a single hash-ordered chain.

use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::slice;

use cinder_base::utils::hash_one;
use cinder_base::{Result, Serializer};
use cinder_reclaim::{pin, EpochCoordinator};
use tracing::trace;

use super::chain::{Chain, Outcome};
use super::{Iter, Source};

/// An antiable multiset kept in a single hash-ordered lock-free list.
///
/// Best for small sets; every access walks the list up to the value's hash.
pub struct AntiableList<T, S = RandomState> {
    chain: Chain<T>,
    hasher: S,
    serializer: Serializer,
}

impl<T> AntiableList<T, RandomState> {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }
}

impl<T, S> AntiableList<T, S> {
    /// Creates an empty list ordered by `hasher`.
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            chain: Chain::new(),
            hasher,
            serializer: Serializer::new(),
        }
    }
}

impl<T, S> AntiableList<T, S>
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
    S: BuildHasher,
{
    /// Adds one instance of `value`. Returns `true` if the value became
    /// present.
    ///
    /// # Errors
    ///
    /// Returns [`cinder_base::Error::OutOfMemory`] if a new element cannot
    /// be allocated.
    pub fn insert(&self, coordinator: &EpochCoordinator, value: T) -> Result<bool> {
        Ok(self.access(coordinator, &value, 1)?.became_present())
    }

    /// Removes one instance of `value`, possibly driving its count
    /// negative. Returns `true` if the value stopped being present.
    ///
    /// # Errors
    ///
    /// Returns [`cinder_base::Error::OutOfMemory`] if a new element cannot
    /// be allocated.
    pub fn erase(&self, coordinator: &EpochCoordinator, value: T) -> Result<bool> {
        Ok(self.access(coordinator, &value, -1)?.became_absent())
    }

    fn access(&self, coordinator: &EpochCoordinator, value: &T, delta: i64) -> Result<Outcome> {
        let hash = hash_one(&self.hasher, value);
        let guard = pin();
        let _section = self.serializer.enter();
        let front = coordinator.front();
        self.chain.access(coordinator, front, hash, value, delta, &guard)
    }

    /// Signed instance count of `value`; zero when it has no live element.
    pub fn count_of(&self, value: &T) -> i64 {
        let guard = pin();
        self.chain.count_of(hash_one(&self.hasher, value), value, &guard)
    }

    /// Iterates over the values present at `epoch`.
    ///
    /// # Panics
    ///
    /// Panics if `epoch` is not held by an unreleased token of `coordinator`.
    pub fn iter<'a>(&'a self, coordinator: &'a EpochCoordinator, epoch: u64) -> Iter<'a, T> {
        Iter::new(
            Source::Chains(slice::from_ref(&self.chain).iter()),
            coordinator,
            epoch,
        )
    }

    /// Number of values present at `epoch`.
    ///
    /// # Panics
    ///
    /// Panics under the same condition as [`AntiableList::iter`].
    pub fn len_at(&self, coordinator: &EpochCoordinator, epoch: u64) -> usize {
        self.iter(coordinator, epoch).count()
    }

    /// Unlinks every dead element no pinned epoch can still see. Returns the
    /// number unlinked.
    pub fn purge(&self, coordinator: &EpochCoordinator) -> usize {
        let guard = pin();
        let _section = self.serializer.enter();
        let sweep = self.chain.sweep(coordinator, coordinator.front(), &guard);
        trace!(unlinked = sweep.unlinked, waiting = sweep.waiting, "purged antiable list");
        sweep.unlinked
    }
}

impl<T> Default for AntiableList<T, RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, S> fmt::Debug for AntiableList<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AntiableList").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_erase_presence() {
        let coordinator = EpochCoordinator::new();
        let list = AntiableList::new();

        assert!(list.insert(&coordinator, "alice").unwrap());
        assert!(!list.insert(&coordinator, "alice").unwrap());
        assert_eq!(list.count_of(&"alice"), 2);
        assert!(!list.erase(&coordinator, "alice").unwrap());
        assert!(list.erase(&coordinator, "alice").unwrap());
        assert_eq!(list.count_of(&"alice"), 0);
    }

    #[test]
    fn test_anti_insert_cancels() {
        let coordinator = EpochCoordinator::new();
        let list = AntiableList::new();

        assert!(!list.erase(&coordinator, 3u32).unwrap());
        assert_eq!(list.count_of(&3u32), -1);
        assert!(!list.insert(&coordinator, 3u32).unwrap());
        assert_eq!(list.count_of(&3u32), 0);

        let reader = coordinator.acquire();
        assert_eq!(list.len_at(&coordinator, reader.epoch()), 0);
        // The cancelled value is present again only after a fresh insert.
        assert!(list.insert(&coordinator, 3u32).unwrap());
    }

    #[test]
    fn test_iteration_is_fixed_per_epoch() {
        let coordinator = EpochCoordinator::new();
        let list = AntiableList::new();
        list.insert(&coordinator, 1u64).unwrap();
        list.insert(&coordinator, 2u64).unwrap();

        let reader = coordinator.acquire();
        list.erase(&coordinator, 1u64).unwrap();
        list.insert(&coordinator, 3u64).unwrap();

        let mut seen: Vec<u64> = list.iter(&coordinator, reader.epoch()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);

        let later = coordinator.acquire();
        let mut now: Vec<u64> = list.iter(&coordinator, later.epoch()).collect();
        now.sort_unstable();
        assert_eq!(now, vec![2, 3]);
    }

    #[test]
    fn test_purge_waits_for_readers() {
        let coordinator = EpochCoordinator::new();
        let list = AntiableList::new();
        list.insert(&coordinator, "gone").unwrap();
        let reader = coordinator.acquire();
        list.erase(&coordinator, "gone").unwrap();

        assert_eq!(list.purge(&coordinator), 0);
        assert_eq!(list.len_at(&coordinator, reader.epoch()), 1);
        reader.release();
        assert_eq!(list.purge(&coordinator), 1);
    }

    #[test]
    #[should_panic(expected = "holds no live token")]
    fn test_iter_at_unpinned_epoch_panics() {
        let coordinator = EpochCoordinator::new();
        let list: AntiableList<u8> = AntiableList::new();
        let token = coordinator.acquire();
        let epoch = token.epoch();
        token.release();
        let _ = list.iter(&coordinator, epoch);
    }
}
