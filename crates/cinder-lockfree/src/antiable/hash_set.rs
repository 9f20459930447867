//! Antiable hash-set.
//!
//! A fixed, power-of-two array of chains chosen at construction. Buckets are
//! never resized, so a dead element only ever waits for its own chain's sweep.

use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};

use cinder_base::utils::{hash_one, next_power_of_two};
use cinder_base::{Error, Result, Serializer};
use cinder_reclaim::{pin, EpochCoordinator};
use tracing::{debug, trace};

use super::chain::{Chain, Outcome, Sweep};
use super::{Iter, Source};

/// Configuration for [`AntiableHashSet`].
#[derive(Debug, Clone)]
pub struct AntiableHashSetConfig {
    /// Bucket count, rounded up to a power of two. The array never grows.
    pub buckets: usize,
}

impl Default for AntiableHashSetConfig {
    fn default() -> Self {
        Self { buckets: 64 }
    }
}

/// An antiable multiset spread over a fixed array of lock-free lists.
pub struct AntiableHashSet<T, S = RandomState> {
    buckets: Box<[Chain<T>]>,
    mask: usize,
    hasher: S,
    serializer: Serializer,
}

impl<T> AntiableHashSet<T, RandomState> {
    /// Creates an empty set with the default bucket count.
    #[must_use]
    pub fn new() -> Self {
        Self::build(AntiableHashSetConfig::default().buckets, RandomState::new())
    }

    /// Creates an empty set from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config.buckets` is zero, and
    /// [`Error::OutOfMemory`] if the bucket array cannot be allocated.
    pub fn with_config(config: AntiableHashSetConfig) -> Result<Self> {
        Self::with_config_and_hasher(config, RandomState::new())
    }
}

impl<T, S> AntiableHashSet<T, S> {
    /// Creates an empty set from `config`, hashing with `hasher`.
    ///
    /// # Errors
    ///
    /// Same as [`AntiableHashSet::with_config`].
    pub fn with_config_and_hasher(config: AntiableHashSetConfig, hasher: S) -> Result<Self> {
        if config.buckets == 0 {
            return Err(Error::InvalidConfig(
                "antiable hash set needs at least one bucket".to_string(),
            ));
        }
        let count = next_power_of_two(config.buckets);
        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(count)
            .map_err(|_| Error::OutOfMemory {
                bytes: count * std::mem::size_of::<Chain<T>>(),
            })?;
        buckets.extend((0..count).map(|_| Chain::new()));
        debug!(buckets = count, "created antiable hash set");
        Ok(Self {
            buckets: buckets.into_boxed_slice(),
            mask: count - 1,
            hasher,
            serializer: Serializer::new(),
        })
    }

    fn build(count: usize, hasher: S) -> Self {
        Self {
            buckets: (0..count).map(|_| Chain::new()).collect(),
            mask: count - 1,
            hasher,
            serializer: Serializer::new(),
        }
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl<T, S> AntiableHashSet<T, S>
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
    S: BuildHasher,
{
    /// Adds one instance of `value`. Returns `true` if the value became
    /// present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if a new element cannot be allocated.
    pub fn insert(&self, coordinator: &EpochCoordinator, value: T) -> Result<bool> {
        Ok(self.access(coordinator, &value, 1)?.became_present())
    }

    /// Removes one instance of `value`. Returns `true` if the value stopped
    /// being present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if a new element cannot be allocated.
    pub fn erase(&self, coordinator: &EpochCoordinator, value: T) -> Result<bool> {
        Ok(self.access(coordinator, &value, -1)?.became_absent())
    }

    fn bucket_for(&self, hash: u64) -> &Chain<T> {
        &self.buckets[hash as usize & self.mask]
    }

    fn access(&self, coordinator: &EpochCoordinator, value: &T, delta: i64) -> Result<Outcome> {
        let hash = hash_one(&self.hasher, value);
        let guard = pin();
        let _section = self.serializer.enter();
        let front = coordinator.front();
        self.bucket_for(hash)
            .access(coordinator, front, hash, value, delta, &guard)
    }

    /// Signed instance count of `value`; zero when it has no live element.
    pub fn count_of(&self, value: &T) -> i64 {
        let hash = hash_one(&self.hasher, value);
        let guard = pin();
        self.bucket_for(hash).count_of(hash, value, &guard)
    }

    /// Iterates over the values present at `epoch`, bucket by bucket.
    ///
    /// # Panics
    ///
    /// Panics if `epoch` is not held by an unreleased token of `coordinator`.
    pub fn iter<'a>(&'a self, coordinator: &'a EpochCoordinator, epoch: u64) -> Iter<'a, T> {
        Iter::new(Source::Chains(self.buckets.iter()), coordinator, epoch)
    }

    /// Number of values present at `epoch`.
    ///
    /// # Panics
    ///
    /// Panics under the same condition as [`AntiableHashSet::iter`].
    pub fn len_at(&self, coordinator: &EpochCoordinator, epoch: u64) -> usize {
        self.iter(coordinator, epoch).count()
    }

    /// Unlinks every dead element no pinned epoch can still see, in every
    /// bucket. Returns the number unlinked.
    pub fn purge(&self, coordinator: &EpochCoordinator) -> usize {
        let guard = pin();
        let _section = self.serializer.enter();
        let front = coordinator.front();
        let total = self
            .buckets
            .iter()
            .map(|bucket| bucket.sweep(coordinator, front, &guard))
            .fold(Sweep::default(), |acc, sweep| Sweep {
                unlinked: acc.unlinked + sweep.unlinked,
                waiting: acc.waiting + sweep.waiting,
            });
        trace!(
            unlinked = total.unlinked,
            waiting = total.waiting,
            "purged antiable hash set"
        );
        total.unlinked
    }
}

impl<T> Default for AntiableHashSet<T, RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, S> fmt::Debug for AntiableHashSet<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AntiableHashSet")
            .field("buckets", &self.buckets.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_count_rounds_up() {
        let set: AntiableHashSet<u32> =
            AntiableHashSet::with_config(AntiableHashSetConfig { buckets: 5 }).unwrap();
        assert_eq!(set.bucket_count(), 8);
        assert_eq!(AntiableHashSet::<u32>::new().bucket_count(), 64);
    }

    #[test]
    fn test_zero_buckets_rejected() {
        let result = AntiableHashSet::<u32>::with_config(AntiableHashSetConfig { buckets: 0 });
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_counts_across_buckets() {
        let coordinator = EpochCoordinator::new();
        let set = AntiableHashSet::with_config(AntiableHashSetConfig { buckets: 4 }).unwrap();
        for i in 0..100u32 {
            assert!(set.insert(&coordinator, i).unwrap());
        }
        let reader = coordinator.acquire();
        for i in (0..100u32).step_by(2) {
            assert!(set.erase(&coordinator, i).unwrap());
        }
        assert_eq!(set.len_at(&coordinator, reader.epoch()), 100);

        let later = coordinator.acquire();
        assert_eq!(set.len_at(&coordinator, later.epoch()), 50);
        assert!(set.iter(&coordinator, later.epoch()).all(|v| v % 2 == 1));
        drop((reader, later));

        assert_eq!(set.purge(&coordinator), 50);
        assert_eq!(set.count_of(&7), 1);
        assert_eq!(set.count_of(&8), 0);
    }
}
