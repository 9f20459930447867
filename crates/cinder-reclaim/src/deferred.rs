//! Deferred reclamation stacks.
//!
//! A [`Retired`] entry is an unreachable allocation together with the routine
//! that destroys it and the stamp it was retired at. Entries sit in a
//! [`DeferredStack`] until the epoch front passes their stamp.

use std::fmt;
use std::mem;

/// Type-erased destructor for a retired allocation.
pub type DestroyFn = unsafe fn(*mut ());

/// One retired allocation.
pub struct Retired {
    ptr: *mut (),
    destroy: DestroyFn,
    stamp: u64,
}

// Safety: a retired allocation is unreachable from every structure, so the
// entry is its sole owner; every retired type is `Send`.
unsafe impl Send for Retired {}

impl Retired {
    /// Wraps `ptr` for deferred destruction.
    ///
    /// # Safety
    ///
    /// `ptr` must be unreachable for every thread pinned after `stamp` was
    /// taken, and `destroy(ptr)` must be sound to call exactly once.
    #[must_use]
    pub unsafe fn new(ptr: *mut (), destroy: DestroyFn, stamp: u64) -> Self {
        Self {
            ptr,
            destroy,
            stamp,
        }
    }

    /// The stamp this entry was retired at.
    #[must_use]
    pub const fn stamp(&self) -> u64 {
        self.stamp
    }

    /// Runs the destructor.
    ///
    /// # Safety
    ///
    /// No pinned thread may still reach the allocation.
    pub unsafe fn destroy(self) {
        (self.destroy)(self.ptr);
    }
}

impl fmt::Debug for Retired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retired")
            .field("ptr", &self.ptr)
            .field("stamp", &self.stamp)
            .finish()
    }
}

/// A stack of retired allocations awaiting the epoch front.
///
/// Entries still present when the stack is dropped are leaked rather than
/// freed, since nothing proves they are unreachable.
#[derive(Debug, Default)]
pub struct DeferredStack {
    entries: Vec<Retired>,
}

impl DeferredStack {
    /// Creates an empty stack.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Pushes a retired entry.
    pub fn push(&mut self, entry: Retired) {
        self.entries.push(entry);
    }

    /// Moves every entry of `other` onto this stack.
    pub fn append(&mut self, mut other: DeferredStack) {
        self.entries.append(&mut other.entries);
    }

    /// Removes and returns the entries stamped strictly below `horizon`.
    pub fn split_eligible(&mut self, horizon: u64) -> Vec<Retired> {
        let (ready, pending): (Vec<_>, Vec<_>) = mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| entry.stamp < horizon);
        self.entries = pending;
        ready
    }

    /// Returns the number of entries waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the stack is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static FREED: AtomicUsize = AtomicUsize::new(0);

    unsafe fn free_counted(ptr: *mut ()) {
        drop(Box::from_raw(ptr.cast::<u32>()));
        FREED.fetch_add(1, Ordering::SeqCst);
    }

    fn entry(stamp: u64) -> Retired {
        let ptr = Box::into_raw(Box::new(7u32)).cast::<()>();
        unsafe { Retired::new(ptr, free_counted, stamp) }
    }

    #[test]
    fn test_split_respects_horizon() {
        let mut stack = DeferredStack::new();
        stack.push(entry(1));
        stack.push(entry(5));
        stack.push(entry(3));

        let ready = stack.split_eligible(4);
        assert_eq!(ready.len(), 2);
        assert!(ready.iter().all(|e| e.stamp() < 4));
        assert_eq!(stack.len(), 1);

        let before = FREED.load(Ordering::SeqCst);
        for e in ready {
            unsafe { e.destroy() };
        }
        assert!(FREED.load(Ordering::SeqCst) >= before + 2);

        for e in stack.split_eligible(u64::MAX) {
            unsafe { e.destroy() };
        }
        assert!(stack.is_empty());
    }

    #[test]
    fn test_append_moves_entries() {
        let mut a = DeferredStack::new();
        let mut b = DeferredStack::new();
        a.push(entry(1));
        b.push(entry(2));
        b.push(entry(3));
        a.append(b);
        assert_eq!(a.len(), 3);
        for e in a.split_eligible(u64::MAX) {
            unsafe { e.destroy() };
        }
    }
}
