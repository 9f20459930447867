//! Antiable element nodes.
//!
//! An element carries a signed instance count. It is live while the count
//! is non-zero and dead once it reaches zero; a dead element never changes
//! again, and a later access to the same value creates a fresh element.
//! Since the count moves by one and death happens at zero, the sign an
//! element is created with is the sign it keeps.
//!
//! Creation and deletion are stamped with coordinator stamps taken after
//! the fact. Whoever first needs a missing stamp (the writer itself, an
//! iterator, or a reaper) settles it with a compare-and-swap from
//! [`UNSTAMPED`], so every reader agrees on it afterwards.

use std::alloc::{alloc, Layout};
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU64, Ordering};

use cinder_base::{Error, Result};
use cinder_reclaim::EpochCoordinator;

/// Stamps are odd, so zero never collides with a real one.
const UNSTAMPED: u64 = 0;

pub(crate) struct Element<T> {
    pub(crate) value: T,
    pub(crate) hash: u64,
    count: AtomicI64,
    positive: bool,
    created: AtomicU64,
    deleted: AtomicU64,
    /// Successor link. The low bits carry the chain's tags.
    pub(crate) next: AtomicPtr<Element<T>>,
}

impl<T> Element<T> {
    /// Allocates a detached element holding `delta` (±1) instances.
    pub(crate) fn try_boxed(value: T, hash: u64, delta: i64) -> Result<Box<Self>> {
        debug_assert!(delta == 1 || delta == -1);
        let layout = Layout::new::<Self>();
        // Safety: the layout is not zero-sized.
        let raw = unsafe { alloc(layout) }.cast::<Self>();
        if raw.is_null() {
            return Err(Error::OutOfMemory {
                bytes: layout.size(),
            });
        }
        // Safety: `raw` is a fresh allocation with the layout of `Self`,
        // which is exactly what `Box` expects to free.
        unsafe {
            raw.write(Self {
                value,
                hash,
                count: AtomicI64::new(delta),
                positive: delta > 0,
                created: AtomicU64::new(UNSTAMPED),
                deleted: AtomicU64::new(UNSTAMPED),
                next: AtomicPtr::new(ptr::null_mut()),
            });
            Ok(Box::from_raw(raw))
        }
    }

    /// Current signed count; zero once dead.
    pub(crate) fn count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.count() == 0
    }

    /// Moves the count by `delta` unless the element is dead.
    ///
    /// Returns the count before and after the move.
    pub(crate) fn adjust(&self, delta: i64) -> Option<(i64, i64)> {
        let mut current = self.count.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return None;
            }
            match self.count.compare_exchange_weak(
                current,
                current + delta,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some((current, current + delta)),
                Err(seen) => current = seen,
            }
        }
    }

    pub(crate) fn settle_created(&self, coordinator: &EpochCoordinator) -> u64 {
        settle(&self.created, coordinator)
    }

    pub(crate) fn settle_deleted(&self, coordinator: &EpochCoordinator) -> u64 {
        settle(&self.deleted, coordinator)
    }

    /// Whether a reader pinned at `epoch` sees this element.
    pub(crate) fn visible_at(&self, coordinator: &EpochCoordinator, epoch: u64) -> bool {
        if !self.positive || self.settle_created(coordinator) > epoch {
            return false;
        }
        self.count() != 0 || self.settle_deleted(coordinator) > epoch
    }

    /// Whether no reader can see this element any more, given the
    /// coordinator's current `front`.
    pub(crate) fn is_reapable(&self, coordinator: &EpochCoordinator, front: u64) -> bool {
        self.is_dead() && self.settle_deleted(coordinator) < front
    }
}

fn settle(slot: &AtomicU64, coordinator: &EpochCoordinator) -> u64 {
    let stamp = slot.load(Ordering::SeqCst);
    if stamp != UNSTAMPED {
        return stamp;
    }
    let fresh = coordinator.stamp();
    match slot.compare_exchange(UNSTAMPED, fresh, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(_) => fresh,
        Err(settled) => settled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_is_fixed_until_death() {
        let element = Element::try_boxed("x", 0, -1).unwrap();
        assert_eq!(element.adjust(-1), Some((-1, -2)));
        assert_eq!(element.adjust(1), Some((-2, -1)));
        assert_eq!(element.adjust(1), Some((-1, 0)));
        assert!(element.is_dead());
        assert_eq!(element.adjust(1), None);
    }

    #[test]
    fn test_visibility_window() {
        let coordinator = EpochCoordinator::new();
        let before = coordinator.acquire();
        let element = Element::try_boxed("x", 0, 1).unwrap();
        element.settle_created(&coordinator);
        let during = coordinator.acquire();
        element.adjust(-1);
        element.settle_deleted(&coordinator);
        let after = coordinator.acquire();

        assert!(!element.visible_at(&coordinator, before.epoch()));
        assert!(element.visible_at(&coordinator, during.epoch()));
        assert!(!element.visible_at(&coordinator, after.epoch()));
    }

    #[test]
    fn test_reapable_once_readers_release() {
        let coordinator = EpochCoordinator::new();
        let element = Element::try_boxed(7u8, 0, 1).unwrap();
        element.settle_created(&coordinator);
        let reader = coordinator.acquire();
        element.adjust(-1);

        assert!(!element.is_reapable(&coordinator, coordinator.front()));
        reader.release();
        assert!(element.is_reapable(&coordinator, coordinator.front()));
    }

    #[test]
    fn test_negative_elements_are_never_visible() {
        let coordinator = EpochCoordinator::new();
        let element = Element::try_boxed(1u8, 0, -1).unwrap();
        element.settle_created(&coordinator);
        let reader = coordinator.acquire();
        assert!(!element.visible_at(&coordinator, reader.epoch()));
    }
}
