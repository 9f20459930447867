//! Trie nodes and the path-copying rebuilds over them.
//!
//! Everything below the root indirection is immutable once published. An
//! insert or erase builds a fresh branch for every level it passes through
//! and shares every untouched subtree with the previous version.

use std::borrow::Borrow;
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use cinder_base::{Error, Result};
use cinder_reclaim::{Managed, Ref};

/// Hash bits consumed per level.
pub(crate) const LEVEL_BITS: u32 = 5;
const LEVEL_MASK: u64 = (1 << LEVEL_BITS) - 1;
const HASH_BITS: u32 = u64::BITS;

/// Slot index of `hash` at the level starting at bit `shift`.
#[inline]
pub(crate) fn slot_bit(hash: u64, shift: u32) -> u32 {
    debug_assert!(shift < HASH_BITS);
    1 << ((hash >> shift) & LEVEL_MASK)
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Version token stamped on a root indirection. Compared by identity.
#[derive(Debug)]
pub(crate) struct Generation {
    id: u64,
}

impl Generation {
    pub(crate) fn next() -> Self {
        Self {
            id: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

/// The main-node pointer of an indirection. Holds one count on its target.
pub(crate) struct MainSlot<K: Managed, V: Managed>(AtomicPtr<Node<K, V>>);

impl<K: Managed, V: Managed> MainSlot<K, V> {
    pub(crate) fn new(main: Ref<Node<K, V>>) -> Self {
        Self(AtomicPtr::new(Ref::into_raw(main).cast_mut()))
    }

    pub(crate) fn load(&self) -> *const Node<K, V> {
        self.0.load(Ordering::SeqCst)
    }

    /// Swaps `current` for `new`. On success the slot owns the count carried
    /// by `new` and the caller owns the count the slot held on `current`.
    pub(crate) fn compare_exchange(
        &self,
        current: *const Node<K, V>,
        new: *const Node<K, V>,
    ) -> std::result::Result<(), *const Node<K, V>> {
        self.0
            .compare_exchange(
                current.cast_mut(),
                new.cast_mut(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(drop)
            .map_err(|actual| actual.cast_const())
    }
}

impl<K: Managed, V: Managed> Drop for MainSlot<K, V> {
    fn drop(&mut self) {
        let main = *self.0.get_mut();
        if !main.is_null() {
            // Safety: the slot owns one count on its target.
            drop(unsafe { Ref::from_raw(main.cast_const()) });
        }
    }
}

/// Decoded state of a main node's GCAS transition.
pub(crate) enum Transition<K: Managed, V: Managed> {
    /// The node is the settled main node of its indirection.
    Committed,
    /// The node was swapped in over `prev` and awaits the generation check.
    Pending(*const Node<K, V>),
    /// The generation check failed; the indirection must revert to `prev`.
    Aborted(*const Node<K, V>),
}

const COMMITTED: usize = 0;
const ABORTED_TAG: usize = 1;

/// GCAS link from a main node to the node it replaced.
///
/// Encoded in one word: zero when committed, otherwise a pointer to the
/// previous main node with the low bit set once aborted. While non-zero the
/// link owns one count on the previous node.
pub(crate) struct TransitionLink<K: Managed, V: Managed> {
    prev: AtomicUsize,
    _marker: PhantomData<fn() -> Node<K, V>>,
}

impl<K: Managed, V: Managed> TransitionLink<K, V> {
    pub(crate) const fn committed() -> Self {
        Self {
            prev: AtomicUsize::new(COMMITTED),
            _marker: PhantomData,
        }
    }

    pub(crate) fn load(&self) -> Transition<K, V> {
        let raw = self.prev.load(Ordering::SeqCst);
        if raw == COMMITTED {
            Transition::Committed
        } else if raw & ABORTED_TAG == 0 {
            Transition::Pending(raw as *const Node<K, V>)
        } else {
            Transition::Aborted((raw & !ABORTED_TAG) as *const Node<K, V>)
        }
    }

    /// Arms the link before the node is published.
    pub(crate) fn set_pending(&self, prev: Ref<Node<K, V>>) {
        let raw = Ref::into_raw(prev) as usize;
        debug_assert_eq!(raw & ABORTED_TAG, 0);
        let old = self.prev.swap(raw, Ordering::SeqCst);
        debug_assert_eq!(old, COMMITTED, "transition armed twice");
    }

    /// Settles a pending transition as committed, releasing the previous node.
    pub(crate) fn commit(&self, prev: *const Node<K, V>) -> bool {
        let raw = prev as usize;
        if self
            .prev
            .compare_exchange(raw, COMMITTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // Safety: the link owned one count on `prev` until this swap.
            drop(unsafe { Ref::from_raw(prev) });
            true
        } else {
            false
        }
    }

    /// Marks a pending transition as aborted. The count on `prev` stays.
    pub(crate) fn abort(&self, prev: *const Node<K, V>) -> bool {
        let raw = prev as usize;
        self.prev
            .compare_exchange(raw, raw | ABORTED_TAG, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl<K: Managed, V: Managed> Drop for TransitionLink<K, V> {
    fn drop(&mut self) {
        let raw = *self.prev.get_mut() & !ABORTED_TAG;
        if raw != COMMITTED {
            // Safety: a non-zero link owns one count on the previous node.
            drop(unsafe { Ref::from_raw(raw as *const Node<K, V>) });
        }
    }
}

pub(crate) const RDCSS_PENDING: u8 = 0;
pub(crate) const RDCSS_COMMITTED: u8 = 1;
pub(crate) const RDCSS_ABORTED: u8 = 2;

/// Root descriptor installed while a snapshot swaps in a new generation.
pub(crate) struct Redirection<K: Managed, V: Managed> {
    /// The indirection being replaced.
    pub(crate) old: Ref<Node<K, V>>,
    /// Main node `old` must still hold for the swap to commit.
    pub(crate) expected: Ref<Node<K, V>>,
    /// The indirection stamped with the new generation.
    pub(crate) new: Ref<Node<K, V>>,
    pub(crate) state: AtomicU8,
}

/// An inner node: a bitmap of populated slots and one child per set bit.
pub(crate) struct Branch<K: Managed, V: Managed> {
    pub(crate) bitmap: u32,
    pub(crate) children: Box<[Ref<Node<K, V>>]>,
    /// Entries stored in this subtree.
    pub(crate) size: usize,
    pub(crate) transition: TransitionLink<K, V>,
}

impl<K: Managed, V: Managed> Branch<K, V> {
    pub(crate) fn empty() -> Self {
        Self {
            bitmap: 0,
            children: Box::default(),
            size: 0,
            transition: TransitionLink::committed(),
        }
    }

    fn from_children(bitmap: u32, children: Vec<Ref<Node<K, V>>>) -> Self {
        debug_assert_eq!(bitmap.count_ones() as usize, children.len());
        let size = children.iter().map(|child| child.size()).sum();
        Self {
            bitmap,
            children: children.into_boxed_slice(),
            size,
            transition: TransitionLink::committed(),
        }
    }

    /// Compact position of the child for `bit`, if that slot is populated.
    #[inline]
    pub(crate) fn position(&self, bit: u32) -> Option<usize> {
        if self.bitmap & bit == 0 {
            None
        } else {
            Some((self.bitmap & (bit - 1)).count_ones() as usize)
        }
    }

    fn with_inserted(&self, bit: u32, child: Ref<Node<K, V>>) -> Result<Self> {
        let pos = (self.bitmap & (bit - 1)).count_ones() as usize;
        let mut children = try_vec(self.children.len() + 1)?;
        children.extend_from_slice(&self.children[..pos]);
        children.push(child);
        children.extend_from_slice(&self.children[pos..]);
        Ok(Self::from_children(self.bitmap | bit, children))
    }

    fn with_replaced(&self, pos: usize, child: Ref<Node<K, V>>) -> Result<Self> {
        let mut children = try_vec(self.children.len())?;
        children.extend_from_slice(&self.children);
        children[pos] = child;
        Ok(Self::from_children(self.bitmap, children))
    }

    fn with_removed(&self, bit: u32, pos: usize) -> Result<Self> {
        let mut children = try_vec(self.children.len() - 1)?;
        children.extend_from_slice(&self.children[..pos]);
        children.extend_from_slice(&self.children[pos + 1..]);
        Ok(Self::from_children(self.bitmap & !bit, children))
    }
}

/// A trie node.
pub(crate) enum Node<K: Managed, V: Managed> {
    /// Stable anchor holding the current main node and its generation.
    Indirection {
        main: MainSlot<K, V>,
        generation: Ref<Generation>,
    },
    /// Transient root marker while a snapshot is installed.
    Redirection(Redirection<K, V>),
    /// A contracted branch whose only content is this singleton.
    Tombstone(Ref<Node<K, V>>),
    Branch(Branch<K, V>),
    /// Entries sharing one full hash.
    Collision { hash: u64, entries: Box<[(K, V)]> },
    Singleton { hash: u64, key: K, value: V },
}

impl<K: Managed, V: Managed> Node<K, V> {
    pub(crate) fn alloc(self) -> Result<Ref<Self>> {
        Ref::try_new(self)
    }

    fn singleton(hash: u64, key: K, value: V) -> Result<Ref<Self>> {
        Self::Singleton { hash, key, value }.alloc()
    }

    fn collision(hash: u64, entries: Vec<(K, V)>) -> Result<Ref<Self>> {
        Self::Collision {
            hash,
            entries: entries.into_boxed_slice(),
        }
        .alloc()
    }

    /// Entries reachable from this node.
    pub(crate) fn size(&self) -> usize {
        match self {
            Self::Branch(branch) => branch.size,
            Self::Collision { entries, .. } => entries.len(),
            Self::Singleton { .. } | Self::Tombstone(_) => 1,
            Self::Indirection { .. } | Self::Redirection(_) => 0,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Indirection { .. } => "indirection",
            Self::Redirection(_) => "redirection",
            Self::Tombstone(_) => "tombstone",
            Self::Branch(_) => "branch",
            Self::Collision { .. } => "collision",
            Self::Singleton { .. } => "singleton",
        }
    }

    /// The branch behind a main node.
    pub(crate) fn as_branch(&self) -> &Branch<K, V> {
        match self {
            Self::Branch(branch) => branch,
            other => unreachable!("{} used as a main node", other.kind()),
        }
    }

    /// Hash of a leaf.
    fn leaf_hash(&self) -> u64 {
        match self {
            Self::Singleton { hash, .. } | Self::Collision { hash, .. } => *hash,
            other => unreachable!("{} has no leaf hash", other.kind()),
        }
    }
}

/// Allocates an empty vector with room for exactly `capacity` elements.
pub(crate) fn try_vec<T>(capacity: usize) -> Result<Vec<T>> {
    let mut vec = Vec::new();
    vec.try_reserve_exact(capacity)
        .map_err(|_| Error::OutOfMemory {
            bytes: capacity.saturating_mul(mem::size_of::<T>()),
        })?;
    Ok(vec)
}

/// How an insert treats a key that is already bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsertMode {
    Overwrite,
    IfAbsent,
}

pub(crate) enum Inserted<K: Managed, V: Managed> {
    /// A rebuilt branch, and the value it replaced.
    Rebuilt {
        node: Ref<Node<K, V>>,
        prior: Option<V>,
    },
    /// The key is already bound and the mode keeps it.
    Present(V),
}

pub(crate) enum Erased<K: Managed, V: Managed> {
    /// Key absent, or the condition refused the entry.
    Unchanged,
    /// The rebuilt node for this level. `None` when a non-root branch
    /// emptied; a tombstone when it contracted to a single singleton.
    Rebuilt {
        node: Option<Ref<Node<K, V>>>,
        removed: V,
    },
}

/// Builds the smallest branch chain separating two leaves with different
/// hashes, starting at `shift`.
fn separate<K, V>(
    a: Ref<Node<K, V>>,
    b: Ref<Node<K, V>>,
    shift: u32,
) -> Result<Ref<Node<K, V>>>
where
    K: Managed,
    V: Managed,
{
    let (ha, hb) = (a.leaf_hash(), b.leaf_hash());
    debug_assert_ne!(ha, hb);
    let (bit_a, bit_b) = (slot_bit(ha, shift), slot_bit(hb, shift));
    let branch = if bit_a == bit_b {
        let inner = separate(a, b, shift + LEVEL_BITS)?;
        let mut children = try_vec(1)?;
        children.push(inner);
        Branch::from_children(bit_a, children)
    } else {
        let mut children = try_vec(2)?;
        if bit_a < bit_b {
            children.extend([a, b]);
        } else {
            children.extend([b, a]);
        }
        Branch::from_children(bit_a | bit_b, children)
    };
    Node::Branch(branch).alloc()
}

/// Rebuilds `branch` (at depth `shift`) with `key` bound to `value`.
pub(crate) fn insert_into<K, V>(
    branch: &Branch<K, V>,
    shift: u32,
    hash: u64,
    key: K,
    value: V,
    mode: InsertMode,
) -> Result<Inserted<K, V>>
where
    K: Managed + Eq + Clone,
    V: Managed + Clone,
{
    let bit = slot_bit(hash, shift);
    let Some(pos) = branch.position(bit) else {
        let leaf = Node::singleton(hash, key, value)?;
        let node = Node::Branch(branch.with_inserted(bit, leaf)?).alloc()?;
        return Ok(Inserted::Rebuilt { node, prior: None });
    };

    let child = &branch.children[pos];
    let (replacement, prior) = match &**child {
        Node::Singleton {
            hash: child_hash,
            key: child_key,
            value: child_value,
        } => {
            if *child_key == key {
                if mode == InsertMode::IfAbsent {
                    return Ok(Inserted::Present(child_value.clone()));
                }
                (
                    Node::singleton(hash, key, value)?,
                    Some(child_value.clone()),
                )
            } else if *child_hash == hash {
                let mut entries = try_vec(2)?;
                entries.push((child_key.clone(), child_value.clone()));
                entries.push((key, value));
                (Node::collision(hash, entries)?, None)
            } else {
                let leaf = Node::singleton(hash, key, value)?;
                (separate(child.clone(), leaf, shift + LEVEL_BITS)?, None)
            }
        }
        Node::Collision {
            hash: child_hash,
            entries,
        } => {
            if *child_hash == hash {
                let found = entries.iter().position(|(k, _)| *k == key);
                if let (Some(i), InsertMode::IfAbsent) = (found, mode) {
                    return Ok(Inserted::Present(entries[i].1.clone()));
                }
                let mut copy = try_vec(entries.len() + usize::from(found.is_none()))?;
                copy.extend(entries.iter().cloned());
                let prior = match found {
                    Some(i) => Some(mem::replace(&mut copy[i].1, value)),
                    None => {
                        copy.push((key, value));
                        None
                    }
                };
                (Node::collision(hash, copy)?, prior)
            } else {
                let leaf = Node::singleton(hash, key, value)?;
                (separate(child.clone(), leaf, shift + LEVEL_BITS)?, None)
            }
        }
        Node::Branch(inner) => {
            match insert_into(inner, shift + LEVEL_BITS, hash, key, value, mode)? {
                Inserted::Present(existing) => return Ok(Inserted::Present(existing)),
                Inserted::Rebuilt { node, prior } => (node, prior),
            }
        }
        other => unreachable!("{} stored inside a branch", other.kind()),
    };

    let node = Node::Branch(branch.with_replaced(pos, replacement)?).alloc()?;
    Ok(Inserted::Rebuilt { node, prior })
}

/// Rebuilds `branch` without `key`, provided `keep` refuses its value.
///
/// Non-root branches contract: an emptied branch disappears and a branch
/// left holding a single singleton becomes a tombstone, which the parent
/// resolves back into a singleton in its own slot.
pub(crate) fn erase_from<K, V, Q, F>(
    branch: &Branch<K, V>,
    shift: u32,
    hash: u64,
    key: &Q,
    remove: &F,
    at_root: bool,
) -> Result<Erased<K, V>>
where
    K: Managed + Borrow<Q> + Clone,
    V: Managed + Clone,
    Q: ?Sized + Eq,
    F: Fn(&V) -> bool,
{
    let bit = slot_bit(hash, shift);
    let Some(pos) = branch.position(bit) else {
        return Ok(Erased::Unchanged);
    };

    let (slot, removed) = match &*branch.children[pos] {
        Node::Singleton {
            key: child_key,
            value,
            ..
        } => {
            if child_key.borrow() != key || !remove(value) {
                return Ok(Erased::Unchanged);
            }
            (None, value.clone())
        }
        Node::Collision {
            hash: child_hash,
            entries,
        } => {
            let Some(i) = entries.iter().position(|(k, _)| k.borrow() == key) else {
                return Ok(Erased::Unchanged);
            };
            if !remove(&entries[i].1) {
                return Ok(Erased::Unchanged);
            }
            let removed = entries[i].1.clone();
            let node = if entries.len() == 2 {
                let (k, v) = &entries[1 - i];
                Node::singleton(*child_hash, k.clone(), v.clone())?
            } else {
                let mut rest = try_vec(entries.len() - 1)?;
                rest.extend(
                    entries
                        .iter()
                        .enumerate()
                        .filter(|(j, _)| *j != i)
                        .map(|(_, entry)| entry.clone()),
                );
                Node::collision(*child_hash, rest)?
            };
            (Some(node), removed)
        }
        Node::Branch(inner) => {
            match erase_from(inner, shift + LEVEL_BITS, hash, key, remove, false)? {
                Erased::Unchanged => return Ok(Erased::Unchanged),
                Erased::Rebuilt { node, removed } => (node.map(resurrect), removed),
            }
        }
        other => unreachable!("{} stored inside a branch", other.kind()),
    };

    let rebuilt = match slot {
        Some(node) => branch.with_replaced(pos, node)?,
        None => branch.with_removed(bit, pos)?,
    };
    let node = if at_root {
        Some(Node::Branch(rebuilt).alloc()?)
    } else {
        contract(rebuilt)?
    };
    Ok(Erased::Rebuilt { node, removed })
}

/// Replaces a tombstone by the singleton it entombs.
fn resurrect<K: Managed, V: Managed>(node: Ref<Node<K, V>>) -> Ref<Node<K, V>> {
    if let Node::Tombstone(singleton) = &*node {
        return singleton.clone();
    }
    node
}

fn contract<K: Managed, V: Managed>(branch: Branch<K, V>) -> Result<Option<Ref<Node<K, V>>>> {
    let entombed = match &*branch.children {
        [] => return Ok(None),
        [only] if matches!(&**only, Node::Singleton { .. }) => Some(only.clone()),
        _ => None,
    };
    let node = match entombed {
        Some(singleton) => Node::Tombstone(singleton),
        None => Node::Branch(branch),
    };
    Ok(Some(node.alloc()?))
}

/// Finds the value bound to `key` below `main`.
pub(crate) fn lookup_in<'a, K, V, Q>(main: &'a Node<K, V>, hash: u64, key: &Q) -> Option<&'a V>
where
    K: Managed + Borrow<Q>,
    V: Managed,
    Q: ?Sized + Eq,
{
    let mut node = main;
    let mut shift = 0;
    loop {
        match node {
            Node::Branch(branch) => {
                let pos = branch.position(slot_bit(hash, shift))?;
                node = &*branch.children[pos];
                shift += LEVEL_BITS;
            }
            Node::Singleton {
                key: found, value, ..
            } => return (found.borrow() == key).then_some(value),
            Node::Collision { entries, .. } => {
                return entries
                    .iter()
                    .find(|(found, _)| found.borrow() == key)
                    .map(|(_, value)| value)
            }
            Node::Tombstone(singleton) => node = &**singleton,
            Node::Indirection { .. } | Node::Redirection(_) => return None,
        }
    }
}

/// Returns whether `a` and `b` point at the same node.
#[inline]
pub(crate) fn same<K: Managed, V: Managed>(a: *const Node<K, V>, b: *const Node<K, V>) -> bool {
    ptr::eq(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Branch<u64, u64> {
        Branch::empty()
    }

    fn insert(branch: &Branch<u64, u64>, hash: u64, key: u64) -> Ref<Node<u64, u64>> {
        match insert_into(branch, 0, hash, key, key * 10, InsertMode::Overwrite).unwrap() {
            Inserted::Rebuilt { node, .. } => node,
            Inserted::Present(_) => panic!("unexpected present"),
        }
    }

    #[test]
    fn test_position_is_popcount_below_bit() {
        let mut branch = root();
        branch.bitmap = 0b1011;
        assert_eq!(branch.position(0b0001), Some(0));
        assert_eq!(branch.position(0b0010), Some(1));
        assert_eq!(branch.position(0b0100), None);
        assert_eq!(branch.position(0b1000), Some(2));
    }

    #[test]
    fn test_distinct_hashes_deepen() {
        // Same low five bits, different next level.
        let a = insert(&root(), 0b00001_00011, 1);
        let b = insert(a.as_branch(), 0b00010_00011, 2);
        let top = b.as_branch();
        assert_eq!(top.children.len(), 1);
        assert_eq!(top.size, 2);
        match &*top.children[0] {
            Node::Branch(inner) => assert_eq!(inner.children.len(), 2),
            other => panic!("expected branch, got {}", other.kind()),
        }
        assert_eq!(lookup_in(&b, 0b00010_00011, &2u64), Some(&20));
        assert_eq!(lookup_in(&b, 0b00001_00011, &1u64), Some(&10));
    }

    #[test]
    fn test_equal_hashes_collide() {
        let a = insert(&root(), 42, 1);
        let b = insert(a.as_branch(), 42, 2);
        assert!(matches!(&*b.as_branch().children[0], Node::Collision { entries, .. } if entries.len() == 2));
        assert_eq!(lookup_in(&b, 42, &2u64), Some(&20));
        assert_eq!(lookup_in(&b, 42, &3u64), None);
    }

    #[test]
    fn test_erase_contracts_to_root_singleton() {
        let a = insert(&root(), 0b00001_00011, 1);
        let b = insert(a.as_branch(), 0b00010_00011, 2);
        let Erased::Rebuilt { node, removed } =
            erase_from(b.as_branch(), 0, 0b00010_00011, &2u64, &|_: &u64| true, true).unwrap()
        else {
            panic!("key was present");
        };
        assert_eq!(removed, 20);
        let node = node.unwrap();
        let top = node.as_branch();
        assert_eq!(top.size, 1);
        // The entombed singleton is resurrected directly under the root.
        assert!(matches!(&*top.children[0], Node::Singleton { key: 1, .. }));
    }

    #[test]
    fn test_erase_refused_by_condition() {
        let a = insert(&root(), 7, 1);
        let result = erase_from(a.as_branch(), 0, 7, &1u64, &|v: &u64| *v == 0, true).unwrap();
        assert!(matches!(result, Erased::Unchanged));
    }

    #[test]
    fn test_collision_shrinks_to_singleton() {
        let a = insert(&root(), 42, 1);
        let b = insert(a.as_branch(), 42, 2);
        let Erased::Rebuilt { node, .. } =
            erase_from(b.as_branch(), 0, 42, &1u64, &|_: &u64| true, true).unwrap()
        else {
            panic!("key was present");
        };
        let node = node.unwrap();
        assert!(matches!(&*node.as_branch().children[0], Node::Singleton { key: 2, .. }));
    }

    #[test]
    fn test_if_absent_keeps_existing() {
        let a = insert(&root(), 9, 1);
        match insert_into(a.as_branch(), 0, 9, 1, 99, InsertMode::IfAbsent).unwrap() {
            Inserted::Present(v) => assert_eq!(v, 10),
            Inserted::Rebuilt { .. } => panic!("existing binding overwritten"),
        }
    }
}
