//! Antiable multisets.
//!
//! An antiable container counts instances of each value with a signed
//! count, so a value can be erased before it is inserted ("anti-inserted")
//! and the two cancel out. A value is present while its count is positive.
//!
//! Every change is made visible along an epoch axis given by an
//! [`EpochCoordinator`](cinder_reclaim::EpochCoordinator): a reader holding a
//! token for epoch `E` iterates exactly the values whose element was
//! created, with a positive count, before `E` and had not died before `E`.
//! Dead elements stay linked until the coordinator's front passes their
//! death, then are unlinked by whichever access or purge comes across them.
//!
//! Three layouts share the same semantics:
//!
//! - [`AntiableList`]: one hash-ordered lock-free list
//! - [`AntiableHashSet`]: a fixed power-of-two array of such lists
//! - [`AntiableHashTrie`]: per-value buckets stored in a [`HashTrie`](crate::HashTrie)

mod chain;
mod element;
mod hash_set;
mod hash_trie;
mod list;

use std::fmt;
use std::ptr;
use std::slice;
use std::vec;

use cinder_reclaim::{pin, EpochCoordinator, Guard, Ref};

use self::chain::{successor, Chain};
use self::element::Element;
use self::hash_trie::Bucket;

pub use self::hash_set::{AntiableHashSet, AntiableHashSetConfig};
pub use self::hash_trie::AntiableHashTrie;
pub use self::list::AntiableList;

fn assert_pinned(coordinator: &EpochCoordinator, epoch: u64) {
    assert!(
        coordinator.is_pinned(epoch),
        "iterating an antiable container at epoch {epoch}, which holds no live token"
    );
}

enum Source<'a, T: Send + Sync + 'static> {
    Chains(slice::Iter<'a, Chain<T>>),
    Buckets(vec::IntoIter<Ref<Bucket<T>>>),
}

/// Iterator over the values an antiable container holds at one epoch.
///
/// Yields a clone of each visible value. The thread stays pinned until the
/// iterator is dropped.
pub struct Iter<'a, T: Send + Sync + 'static> {
    source: Source<'a, T>,
    /// Keeps the bucket being walked alive.
    held: Option<Ref<Bucket<T>>>,
    cursor: *const Element<T>,
    coordinator: &'a EpochCoordinator,
    epoch: u64,
    _guard: Guard,
}

impl<'a, T: Send + Sync + 'static> Iter<'a, T> {
    fn new(source: Source<'a, T>, coordinator: &'a EpochCoordinator, epoch: u64) -> Self {
        assert_pinned(coordinator, epoch);
        Self {
            source,
            held: None,
            cursor: ptr::null(),
            coordinator,
            epoch,
            _guard: pin(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            // Safety: elements are freed through the collector while this
            // iterator keeps the thread pinned, or with their bucket, which
            // `held` keeps alive.
            while let Some(element) = unsafe { self.cursor.as_ref() } {
                self.cursor = successor(element);
                if element.visible_at(self.coordinator, self.epoch) {
                    return Some(element.value.clone());
                }
            }

            self.cursor = match &mut self.source {
                Source::Chains(chains) => chains.next()?.first(),
                Source::Buckets(buckets) => {
                    let bucket = self.held.insert(buckets.next()?);
                    bucket.chain.first()
                }
            };
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Iter<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter").field("epoch", &self.epoch).finish()
    }
}
