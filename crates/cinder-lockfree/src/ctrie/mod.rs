//! Persistent concurrent hash-trie.
//!
//! A Ctrie keyed by 64-bit hashes, five bits per level. The root is an
//! indirection node holding the current main node; everything below it is
//! immutable. Writers rebuild the path they touch and GCAS the new main node
//! in at the root, so every committed main node is a consistent version of
//! the whole trie and doubles as the snapshot handed back to the caller.
//!
//! Snapshots swap a fresh generation in at the root through a redirection
//! node. Writes still in flight against the old generation are aborted by
//! whoever settles them, and retry against the new root.

mod node;
mod root;
mod set;
mod snapshot;

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::AtomicPtr;

use cinder_base::utils::hash_one;
use cinder_base::{Result, Serializer};
use cinder_reclaim::{pin, Guard, Managed, Ref};
use tracing::debug;

use self::node::{
    erase_from, insert_into, lookup_in, Branch, Erased, Generation, InsertMode, Inserted, MainSlot,
    Node,
};

pub use self::set::HashTrieSet;
pub use self::snapshot::{
    Erasure, ErasureOutcome, Insertion, InsertionOutcome, Iter, Lookup, Snapshot,
};

/// Dereferences a node pointer for the lifetime of a pin.
///
/// # Safety
///
/// `ptr` must have been loaded from a live trie while `guard` was held.
unsafe fn protected<'g, T>(ptr: *const T, _guard: &'g Guard) -> &'g T {
    &*ptr
}

/// A lock-free hash map with constant-time snapshots.
pub struct HashTrie<K: Managed, V: Managed, S = RandomState> {
    /// Owns one count on the root indirection (or redirection).
    root: AtomicPtr<Node<K, V>>,
    hasher: S,
    serializer: Serializer,
}

impl<K: Managed, V: Managed> HashTrie<K, V, RandomState> {
    /// Creates an empty trie.
    #[must_use]
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }
}

impl<K: Managed, V: Managed, S> HashTrie<K, V, S> {
    /// Creates an empty trie using `hasher`.
    pub fn with_hasher(hasher: S) -> Self {
        let main = Ref::new(Node::Branch(Branch::empty()));
        Self::from_main(main, Ref::new(Generation::next()), hasher)
    }

    /// Creates an empty trie using `hasher`, reporting allocation failure.
    ///
    /// # Errors
    ///
    /// Returns [`cinder_base::Error::OutOfMemory`] if the root cannot be
    /// allocated.
    pub fn try_with_hasher(hasher: S) -> Result<Self> {
        let main = Node::Branch(Branch::empty()).alloc()?;
        let generation = Ref::try_new(Generation::next())?;
        let root = Node::Indirection {
            main: MainSlot::new(main),
            generation,
        }
        .alloc()?;
        Ok(Self::from_root(root, hasher))
    }

    fn from_main(main: Ref<Node<K, V>>, generation: Ref<Generation>, hasher: S) -> Self {
        let root = Ref::new(Node::Indirection {
            main: MainSlot::new(main),
            generation,
        });
        Self::from_root(root, hasher)
    }

    fn from_root(root: Ref<Node<K, V>>, hasher: S) -> Self {
        Self {
            root: AtomicPtr::new(Ref::into_raw(root).cast_mut()),
            hasher,
            serializer: Serializer::new(),
        }
    }

    /// The hasher used for keys.
    pub fn hasher(&self) -> &S {
        &self.hasher
    }

    /// Reads the current main node.
    fn current_main<'g>(&self, guard: &'g Guard) -> &'g Node<K, V> {
        let inode = self.read_root(false, guard);
        self.gcas_read(inode, guard)
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        let guard = pin();
        self.current_main(&guard).size()
    }

    /// Returns whether the trie is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry.
    ///
    /// # Errors
    ///
    /// Returns [`cinder_base::Error::OutOfMemory`] if the empty main node
    /// cannot be allocated; the trie is then unchanged.
    pub fn clear(&self) -> Result<()> {
        let guard = pin();
        let _section = self.serializer.enter();
        loop {
            let inode = self.read_root(false, &guard);
            let main = self.gcas_read(inode, &guard);
            let empty = Node::Branch(Branch::empty()).alloc()?;
            if self.gcas(inode, main, empty, &guard) {
                return Ok(());
            }
        }
    }
}

impl<K, V, S> HashTrie<K, V, S>
where
    K: Managed + Hash + Eq + Clone,
    V: Managed + Clone,
    S: BuildHasher + Clone,
{
    fn upsert(&self, key: K, value: V, mode: InsertMode) -> Result<Inserted<K, V>> {
        let hash = hash_one(&self.hasher, &key);
        let guard = pin();
        let _section = self.serializer.enter();
        loop {
            let inode = self.read_root(false, &guard);
            let main = self.gcas_read(inode, &guard);
            match insert_into(main.as_branch(), 0, hash, key.clone(), value.clone(), mode)? {
                Inserted::Present(existing) => return Ok(Inserted::Present(existing)),
                Inserted::Rebuilt { node, prior } => {
                    if self.gcas(inode, main, node.clone(), &guard) {
                        return Ok(Inserted::Rebuilt { node, prior });
                    }
                }
            }
        }
    }

    fn remove_where<Q, F>(&self, key: &Q, remove: F) -> Result<(Ref<Node<K, V>>, Option<V>)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        F: Fn(&V) -> bool,
    {
        let hash = hash_one(&self.hasher, key);
        let guard = pin();
        let _section = self.serializer.enter();
        loop {
            let inode = self.read_root(false, &guard);
            let main = self.gcas_read(inode, &guard);
            match erase_from(main.as_branch(), 0, hash, key, &remove, true)? {
                Erased::Unchanged => {
                    // Safety: read from the trie under `guard`.
                    if let Some(seen) = unsafe { Ref::try_acquire(main) } {
                        return Ok((seen, None));
                    }
                }
                Erased::Rebuilt { node, removed } => {
                    let Some(node) = node else {
                        unreachable!("the root branch never contracts");
                    };
                    if self.gcas(inode, main, node.clone(), &guard) {
                        return Ok((node, Some(removed)));
                    }
                }
            }
        }
    }

    /// Binds `key` to `value`, replacing any previous binding.
    ///
    /// # Errors
    ///
    /// Returns [`cinder_base::Error::OutOfMemory`] if a node cannot be
    /// allocated; the trie is then unchanged.
    pub fn insert(&self, key: K, value: V) -> Result<Insertion<K, V, S>> {
        match self.upsert(key, value, InsertMode::Overwrite)? {
            Inserted::Rebuilt { node, prior } => Ok(Insertion {
                outcome: if prior.is_some() {
                    InsertionOutcome::ReplacingInsertion
                } else {
                    InsertionOutcome::FirstInsertion
                },
                snapshot: Snapshot::new(node, self.hasher.clone()),
                prior,
            }),
            Inserted::Present(_) => unreachable!("overwrite never keeps a binding"),
        }
    }

    /// Binds `key` to `value` unless it is already bound.
    ///
    /// Returns the existing value if there was one; `None` means the new
    /// binding was inserted.
    ///
    /// # Errors
    ///
    /// Returns [`cinder_base::Error::OutOfMemory`] if a node cannot be
    /// allocated.
    pub fn insert_if_absent(&self, key: K, value: V) -> Result<Option<V>> {
        match self.upsert(key, value, InsertMode::IfAbsent)? {
            Inserted::Present(existing) => Ok(Some(existing)),
            Inserted::Rebuilt { .. } => Ok(None),
        }
    }

    /// Removes the binding for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`cinder_base::Error::OutOfMemory`] if a node cannot be
    /// allocated; the trie is then unchanged.
    pub fn erase<Q>(&self, key: &Q) -> Result<Erasure<K, V, S>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let (main, removed) = self.remove_where(key, |_| true)?;
        Ok(Erasure {
            outcome: if removed.is_some() {
                ErasureOutcome::Removed
            } else {
                ErasureOutcome::NotFound
            },
            snapshot: Snapshot::new(main, self.hasher.clone()),
            removed,
        })
    }

    /// Removes the binding for `key` only if `remove` accepts its value.
    /// Returns the removed value.
    ///
    /// # Errors
    ///
    /// Returns [`cinder_base::Error::OutOfMemory`] if a node cannot be
    /// allocated.
    pub fn erase_if<Q, F>(&self, key: &Q, remove: F) -> Result<Option<V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        F: Fn(&V) -> bool,
    {
        Ok(self.remove_where(key, remove)?.1)
    }

    /// Looks up `key`, returning the value together with the version of the
    /// trie that was read.
    pub fn lookup<Q>(&self, key: &Q) -> Lookup<K, V, S>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = hash_one(&self.hasher, key);
        let guard = pin();
        loop {
            let main = self.current_main(&guard);
            // Safety: read from the trie under `guard`.
            if let Some(seen) = unsafe { Ref::try_acquire(main) } {
                let found = lookup_in(&seen, hash, key).cloned();
                return Lookup {
                    found,
                    snapshot: Snapshot::new(seen, self.hasher.clone()),
                };
            }
        }
    }

    /// Returns the trie as last committed, without starting a new
    /// generation. Cheaper than [`HashTrie::snapshot`]; the view is just as
    /// immutable, but writers racing with this call may or may not be in it.
    pub fn view(&self) -> Snapshot<K, V, S> {
        let guard = pin();
        loop {
            let main = self.current_main(&guard);
            // Safety: read from the trie under `guard`.
            if let Some(seen) = unsafe { Ref::try_acquire(main) } {
                return Snapshot::new(seen, self.hasher.clone());
            }
        }
    }

    /// Returns a clone of the value bound to `key`.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = hash_one(&self.hasher, key);
        let guard = pin();
        lookup_in(self.current_main(&guard), hash, key).cloned()
    }

    /// Returns whether `key` is bound.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = hash_one(&self.hasher, key);
        let guard = pin();
        lookup_in(self.current_main(&guard), hash, key).is_some()
    }

    /// Takes an immutable snapshot. Later writes do not affect it.
    ///
    /// # Errors
    ///
    /// Returns [`cinder_base::Error::OutOfMemory`] if the new generation
    /// cannot be allocated.
    pub fn snapshot(&self) -> Result<Snapshot<K, V, S>> {
        let guard = pin();
        let _section = self.serializer.enter();
        let main = self.renew_generation(&guard)?;
        Ok(Snapshot::new(main, self.hasher.clone()))
    }

    /// Creates an independent writable trie starting from the current
    /// contents. The two share structure but never see each other's writes.
    ///
    /// # Errors
    ///
    /// Returns [`cinder_base::Error::OutOfMemory`] if the new root cannot be
    /// allocated.
    pub fn fork(&self) -> Result<Self> {
        let snapshot = self.snapshot()?;
        let generation = Ref::try_new(Generation::next())?;
        let root = Node::Indirection {
            main: MainSlot::new(snapshot.main().clone()),
            generation,
        }
        .alloc()?;
        debug!(entries = snapshot.len(), "forked trie");
        Ok(Self::from_root(root, self.hasher.clone()))
    }
}

impl<K: Managed, V: Managed> Default for HashTrie<K, V, RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Managed, V: Managed, S> fmt::Debug for HashTrie<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTrie")
            .field("len", &self.len())
            .field("serializer", &self.serializer)
            .finish()
    }
}

impl<K: Managed, V: Managed, S> Drop for HashTrie<K, V, S> {
    fn drop(&mut self) {
        let root = *self.root.get_mut();
        // Safety: the trie owns one count on its root.
        drop(unsafe { Ref::from_raw(root.cast_const()) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_lookup_erase() {
        let trie = HashTrie::new();
        let first = trie.insert("alice", 1).unwrap();
        assert_eq!(first.outcome, InsertionOutcome::FirstInsertion);
        assert_eq!(first.prior, None);

        let second = trie.insert("alice", 2).unwrap();
        assert_eq!(second.outcome, InsertionOutcome::ReplacingInsertion);
        assert_eq!(second.prior, Some(1));

        let lookup = trie.lookup("alice");
        assert_eq!(lookup.found, Some(2));
        assert_eq!(lookup.snapshot.len(), 1);

        let erased = trie.erase("alice").unwrap();
        assert_eq!(erased.outcome, ErasureOutcome::Removed);
        assert_eq!(erased.removed, Some(2));
        assert!(erased.snapshot.is_empty());

        let missing = trie.erase("alice").unwrap();
        assert_eq!(missing.outcome, ErasureOutcome::NotFound);
        assert!(trie.is_empty());
    }

    #[test]
    fn test_operation_snapshots_are_exact() {
        let trie = HashTrie::new();
        let after_one = trie.insert(1u32, "one").unwrap().snapshot;
        let after_two = trie.insert(2u32, "two").unwrap().snapshot;
        trie.erase(&1u32).unwrap();

        assert_eq!(after_one.len(), 1);
        assert_eq!(after_one.get(&1u32), Some(&"one"));
        assert!(!after_one.contains(&2u32));
        assert_eq!(after_two.len(), 2);
        assert_eq!(trie.len(), 1);
    }

    #[test]
    fn test_snapshot_isolated_from_later_writes() {
        let trie = HashTrie::new();
        for i in 0..100u64 {
            trie.insert(i, i).unwrap();
        }
        let frozen = trie.snapshot().unwrap();
        for i in 0..50u64 {
            trie.erase(&i).unwrap();
        }
        trie.insert(500, 500).unwrap();

        assert_eq!(frozen.len(), 100);
        assert!(frozen.contains(&10u64));
        assert!(!frozen.contains(&500u64));
        assert_eq!(frozen.iter().count(), 100);
        assert_eq!(trie.len(), 51);
    }

    #[test]
    fn test_insert_if_absent_and_erase_if() {
        let trie = HashTrie::new();
        assert_eq!(trie.insert_if_absent("k", 1).unwrap(), None);
        assert_eq!(trie.insert_if_absent("k", 2).unwrap(), Some(1));
        assert_eq!(trie.erase_if("k", |v| *v == 2).unwrap(), None);
        assert_eq!(trie.get("k"), Some(1));
        assert_eq!(trie.erase_if("k", |v| *v == 1).unwrap(), Some(1));
        assert!(!trie.contains("k"));
    }

    #[test]
    fn test_clear() {
        let trie = HashTrie::new();
        for i in 0..10 {
            trie.insert(i, i * 2).unwrap();
        }
        let before = trie.snapshot().unwrap();
        trie.clear().unwrap();
        assert!(trie.is_empty());
        assert_eq!(before.len(), 10);
    }

    #[test]
    fn test_fork_is_independent() {
        let trie = HashTrie::new();
        trie.insert("shared", 1).unwrap();
        let fork = trie.fork().unwrap();
        fork.insert("forked", 2).unwrap();
        trie.insert("original", 3).unwrap();

        assert!(fork.contains("shared"));
        assert!(fork.contains("forked"));
        assert!(!fork.contains("original"));
        assert!(!trie.contains("forked"));
    }

    #[test]
    fn test_iteration_visits_every_entry_once() {
        let trie = HashTrie::new();
        for i in 0..1000u32 {
            trie.insert(i, i + 1).unwrap();
        }
        let snapshot = trie.snapshot().unwrap();
        let iter = snapshot.iter();
        assert_eq!(iter.len(), 1000);
        let mut keys: Vec<u32> = snapshot.keys().copied().collect();
        keys.sort_unstable();
        assert_eq!(keys, (0..1000).collect::<Vec<_>>());
        assert!(snapshot.iter().all(|(k, v)| *v == k + 1));
    }

    #[test]
    fn test_erase_everything_restores_empty_root() {
        let trie = HashTrie::new();
        for i in 0..500u64 {
            trie.insert(i, ()).unwrap();
        }
        for i in 0..500u64 {
            assert_eq!(trie.erase(&i).unwrap().outcome, ErasureOutcome::Removed);
        }
        let snapshot = trie.snapshot().unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.iter().count(), 0);
    }
}
