//! Set façade over the hash-trie.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};

use cinder_base::Result;
use cinder_reclaim::Managed;

use super::{ErasureOutcome, HashTrie, InsertionOutcome, Snapshot};

/// A lock-free hash set with constant-time snapshots.
pub struct HashTrieSet<K: Managed, S = RandomState> {
    trie: HashTrie<K, (), S>,
}

impl<K: Managed> HashTrieSet<K, RandomState> {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            trie: HashTrie::new(),
        }
    }
}

impl<K: Managed, S> HashTrieSet<K, S> {
    /// Creates an empty set using `hasher`.
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            trie: HashTrie::with_hasher(hasher),
        }
    }

    /// Returns the number of members.
    pub fn len(&self) -> usize {
        self.trie.len()
    }

    /// Returns whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }

    /// Removes every member.
    ///
    /// # Errors
    ///
    /// Returns [`cinder_base::Error::OutOfMemory`] on allocation failure.
    pub fn clear(&self) -> Result<()> {
        self.trie.clear()
    }
}

impl<K, S> HashTrieSet<K, S>
where
    K: Managed + Hash + Eq + Clone,
    S: BuildHasher + Clone,
{
    /// Adds `key`. Returns `true` if it was not already a member.
    ///
    /// # Errors
    ///
    /// Returns [`cinder_base::Error::OutOfMemory`] on allocation failure.
    pub fn insert(&self, key: K) -> Result<bool> {
        Ok(self.trie.insert(key, ())?.outcome == InsertionOutcome::FirstInsertion)
    }

    /// Removes `key`. Returns `true` if it was a member.
    ///
    /// # Errors
    ///
    /// Returns [`cinder_base::Error::OutOfMemory`] on allocation failure.
    pub fn remove<Q>(&self, key: &Q) -> Result<bool>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        Ok(self.trie.erase(key)?.outcome == ErasureOutcome::Removed)
    }

    /// Returns whether `key` is a member.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.trie.contains(key)
    }

    /// Takes an immutable snapshot; iterate it with [`Snapshot::keys`].
    ///
    /// # Errors
    ///
    /// Returns [`cinder_base::Error::OutOfMemory`] on allocation failure.
    pub fn snapshot(&self) -> Result<Snapshot<K, (), S>> {
        self.trie.snapshot()
    }
}

impl<K: Managed> Default for HashTrieSet<K, RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Managed, S> fmt::Debug for HashTrieSet<K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTrieSet").field("len", &self.len()).finish()
    }
}
