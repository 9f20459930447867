//! Antiable hash-trie.
//!
//! One chain per distinct value hash, stored in a [`HashTrie`](crate::HashTrie).
//! A bucket whose last element died is queued for cleanup; the reaper closes
//! it once empty and removes exactly that bucket from the trie.

use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};

use cinder_base::utils::hash_one;
use cinder_base::{Result, Serializer};
use cinder_reclaim::{pin, EpochCoordinator, Guard, Ref};
use tracing::trace;

use super::chain::{Chain, Outcome};
use super::{Iter, Source};
use crate::ctrie::HashTrie;
use crate::stack::Stack;

/// Values whose bucket is checked for cleanup on each access.
const REAP_PER_ACCESS: usize = 2;

/// The elements of one value: at most one live, plus dead ones waiting for
/// the front to pass them.
pub(crate) struct Bucket<T> {
    pub(super) chain: Chain<T>,
}

/// An antiable multiset whose per-value buckets live in a [`HashTrie`].
///
/// Values whose element died are queued on a cleanup stack. Later accesses
/// (and [`AntiableHashTrie::purge`]) unlink the dead elements once no pinned
/// epoch can see them, then close the emptied bucket and remove it from the
/// trie, but only if the trie still maps the value to that same bucket.
pub struct AntiableHashTrie<T, S = RandomState>
where
    T: Send + Sync + 'static,
{
    trie: HashTrie<T, Ref<Bucket<T>>, S>,
    cleanup: Stack<T>,
    serializer: Serializer,
}

impl<T> AntiableHashTrie<T, RandomState>
where
    T: Send + Sync + 'static,
{
    /// Creates an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }
}

impl<T, S> AntiableHashTrie<T, S>
where
    T: Send + Sync + 'static,
{
    /// Creates an empty container hashing with `hasher`.
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            trie: HashTrie::with_hasher(hasher),
            cleanup: Stack::new(),
            serializer: Serializer::new(),
        }
    }

    /// Number of values with a bucket, including buckets that only hold
    /// dead or negative elements.
    pub fn bucket_count(&self) -> usize {
        self.trie.len()
    }
}

impl<T, S> AntiableHashTrie<T, S>
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
    S: BuildHasher + Clone,
{
    /// Adds one instance of `value`. Returns `true` if the value became
    /// present.
    ///
    /// # Errors
    ///
    /// Returns [`cinder_base::Error::OutOfMemory`] if a bucket, element or
    /// trie node cannot be allocated.
    pub fn insert(&self, coordinator: &EpochCoordinator, value: T) -> Result<bool> {
        Ok(self.access(coordinator, value, 1)?.became_present())
    }

    /// Removes one instance of `value`. Returns `true` if the value stopped
    /// being present.
    ///
    /// # Errors
    ///
    /// Returns [`cinder_base::Error::OutOfMemory`] if a bucket, element or
    /// trie node cannot be allocated.
    pub fn erase(&self, coordinator: &EpochCoordinator, value: T) -> Result<bool> {
        Ok(self.access(coordinator, value, -1)?.became_absent())
    }

    fn bucket(&self, value: &T) -> Result<Ref<Bucket<T>>> {
        if let Some(bucket) = self.trie.get(value) {
            return Ok(bucket);
        }
        let fresh = Ref::try_new(Bucket {
            chain: Chain::new(),
        })?;
        Ok(self
            .trie
            .insert_if_absent(value.clone(), fresh.clone())?
            .unwrap_or(fresh))
    }

    fn access(&self, coordinator: &EpochCoordinator, value: T, delta: i64) -> Result<Outcome> {
        let hash = hash_one(self.trie.hasher(), &value);
        let guard = pin();
        let _section = self.serializer.enter();
        let front = coordinator.front();
        loop {
            let bucket = self.bucket(&value)?;
            let outcome = bucket
                .chain
                .access(coordinator, front, hash, &value, delta, &guard)?;
            if outcome == Outcome::Closed {
                // Retired by a reaper that has not removed it yet.
                self.trie.erase_if(&value, |seen| Ref::ptr_eq(seen, &bucket))?;
                continue;
            }
            if outcome.killed() {
                self.cleanup.push(value);
            }
            self.reap(coordinator, front, REAP_PER_ACCESS, &guard)?;
            return Ok(outcome);
        }
    }

    /// Pops up to `limit` queued values and cleans their buckets. Values
    /// whose dead elements are still visible go back on the stack.
    fn reap(&self, coordinator: &EpochCoordinator, front: u64, limit: usize, guard: &Guard) -> Result<usize> {
        let mut unlinked = 0;
        let mut deferred = Vec::new();
        for _ in 0..limit {
            let Some(value) = self.cleanup.pop() else {
                break;
            };
            let Some(bucket) = self.trie.get(&value) else {
                continue;
            };
            let sweep = bucket.chain.sweep(coordinator, front, guard);
            unlinked += sweep.unlinked;
            if sweep.waiting > 0 {
                deferred.push(value);
            } else if bucket.chain.try_close() {
                self.trie.erase_if(&value, |seen| Ref::ptr_eq(seen, &bucket))?;
            }
        }
        self.cleanup.push_batch(deferred);
        Ok(unlinked)
    }

    /// Signed instance count of `value`; zero when it has no live element.
    pub fn count_of(&self, value: &T) -> i64 {
        let Some(bucket) = self.trie.get(value) else {
            return 0;
        };
        let guard = pin();
        bucket
            .chain
            .count_of(hash_one(self.trie.hasher(), value), value, &guard)
    }

    /// Iterates over the values present at `epoch`.
    ///
    /// The buckets are taken from the trie as it stands when this is
    /// called.
    ///
    /// # Panics
    ///
    /// Panics if `epoch` is not held by an unreleased token of `coordinator`.
    pub fn iter<'a>(&'a self, coordinator: &'a EpochCoordinator, epoch: u64) -> Iter<'a, T> {
        let view = self.trie.view();
        let buckets: Vec<_> = view.iter().map(|(_, bucket)| bucket.clone()).collect();
        Iter::new(Source::Buckets(buckets.into_iter()), coordinator, epoch)
    }

    /// Number of values present at `epoch`.
    ///
    /// # Panics
    ///
    /// Panics under the same condition as [`AntiableHashTrie::iter`].
    pub fn len_at(&self, coordinator: &EpochCoordinator, epoch: u64) -> usize {
        self.iter(coordinator, epoch).count()
    }

    /// Drains the cleanup stack: unlinks every dead element no pinned epoch
    /// can still see and removes emptied buckets. Returns the number of
    /// elements unlinked.
    ///
    /// # Errors
    ///
    /// Returns [`cinder_base::Error::OutOfMemory`] if a trie node cannot be
    /// allocated while removing a bucket.
    pub fn purge(&self, coordinator: &EpochCoordinator) -> Result<usize> {
        let guard = pin();
        let _section = self.serializer.enter();
        let queued = self.cleanup.len();
        let unlinked = self.reap(coordinator, coordinator.front(), queued, &guard)?;
        trace!(
            unlinked,
            queued,
            remaining = self.cleanup.len(),
            "purged antiable hash trie"
        );
        Ok(unlinked)
    }
}

impl<T> Default for AntiableHashTrie<T, RandomState>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, S> fmt::Debug for AntiableHashTrie<T, S>
where
    T: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AntiableHashTrie")
            .field("buckets", &self.bucket_count())
            .field("queued", &self.cleanup.len())
            .finish()
    }
}
