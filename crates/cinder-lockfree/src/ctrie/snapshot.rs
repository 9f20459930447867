//! Immutable trie views and the results of trie operations.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::iter::FusedIterator;

use cinder_base::utils::hash_one;
use cinder_reclaim::{Managed, Ref};

use super::node::{lookup_in, Node};

/// A frozen view of a trie.
///
/// Holds the main node a trie operation committed or observed. Nothing in
/// it changes afterwards, and reading it needs no pin: every node below the
/// root is kept alive by the counts of its parents.
pub struct Snapshot<K: Managed, V: Managed, S = RandomState> {
    root: Ref<Node<K, V>>,
    hasher: S,
}

impl<K: Managed, V: Managed, S> Snapshot<K, V, S> {
    pub(crate) fn new(root: Ref<Node<K, V>>, hasher: S) -> Self {
        Self { root, hasher }
    }

    pub(crate) fn main(&self) -> &Ref<Node<K, V>> {
        &self.root
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.root.size()
    }

    /// Returns whether the view is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the entries in hash order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            stack: vec![(&*self.root.as_branch().children, 0)],
            entries: None,
            remaining: self.len(),
        }
    }

    /// Iterates over the keys in hash order.
    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.iter().map(|(key, _)| key)
    }

    /// Returns whether two views share the same root node.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Ref::ptr_eq(&a.root, &b.root)
    }
}

impl<K, V, S> Snapshot<K, V, S>
where
    K: Managed + Hash + Eq,
    V: Managed,
    S: BuildHasher,
{
    /// Returns the value bound to `key` in this view.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        lookup_in(&self.root, hash_one(&self.hasher, key), key)
    }

    /// Returns whether `key` is bound in this view.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.get(key).is_some()
    }
}

impl<K: Managed, V: Managed, S: Clone> Clone for Snapshot<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            hasher: self.hasher.clone(),
        }
    }
}

impl<K, V, S> fmt::Debug for Snapshot<K, V, S>
where
    K: Managed + fmt::Debug,
    V: Managed + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<'a, K: Managed, V: Managed, S> IntoIterator for &'a Snapshot<K, V, S> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the entries of a [`Snapshot`].
pub struct Iter<'a, K: Managed, V: Managed> {
    stack: Vec<(&'a [Ref<Node<K, V>>], usize)>,
    entries: Option<(&'a [(K, V)], usize)>,
    remaining: usize,
}

impl<'a, K: Managed, V: Managed> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((entries, index)) = self.entries.as_mut() {
                let entries: &'a [(K, V)] = *entries;
                if let Some((key, value)) = entries.get(*index) {
                    *index += 1;
                    self.remaining -= 1;
                    return Some((key, value));
                }
                self.entries = None;
            }

            let (children, index) = self.stack.last_mut()?;
            let children: &'a [Ref<Node<K, V>>] = *children;
            let Some(child) = children.get(*index) else {
                self.stack.pop();
                continue;
            };
            *index += 1;

            match &**child {
                Node::Branch(branch) => self.stack.push((&*branch.children, 0)),
                Node::Singleton { key, value, .. } => {
                    self.remaining -= 1;
                    return Some((key, value));
                }
                Node::Collision { entries, .. } => self.entries = Some((&**entries, 0)),
                Node::Tombstone(entombed) => {
                    if let Node::Singleton { key, value, .. } = &**entombed {
                        self.remaining -= 1;
                        return Some((key, value));
                    }
                }
                Node::Indirection { .. } | Node::Redirection(_) => {}
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K: Managed, V: Managed> ExactSizeIterator for Iter<'_, K, V> {}

impl<K: Managed, V: Managed> FusedIterator for Iter<'_, K, V> {}

/// How an insert changed the trie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InsertionOutcome {
    /// The key was not bound before.
    FirstInsertion,
    /// The key was bound and its value was replaced.
    ReplacingInsertion,
}

/// How an erase changed the trie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErasureOutcome {
    /// The key was bound and is now gone.
    Removed,
    /// The key was not bound; nothing changed.
    NotFound,
}

/// Result of [`HashTrie::insert`](super::HashTrie::insert).
#[derive(Debug)]
pub struct Insertion<K: Managed, V: Managed, S = RandomState> {
    pub outcome: InsertionOutcome,
    /// The trie exactly as the insert left it.
    pub snapshot: Snapshot<K, V, S>,
    /// The value the insert replaced.
    pub prior: Option<V>,
}

/// Result of [`HashTrie::erase`](super::HashTrie::erase).
#[derive(Debug)]
pub struct Erasure<K: Managed, V: Managed, S = RandomState> {
    pub outcome: ErasureOutcome,
    /// The trie exactly as the erase left (or found) it.
    pub snapshot: Snapshot<K, V, S>,
    pub removed: Option<V>,
}

/// Result of [`HashTrie::lookup`](super::HashTrie::lookup).
#[derive(Debug)]
pub struct Lookup<K: Managed, V: Managed, S = RandomState> {
    pub found: Option<V>,
    /// The trie the lookup read.
    pub snapshot: Snapshot<K, V, S>,
}
