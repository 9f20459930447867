//! Hash-ordered Harris list of antiable elements.
//!
//! Elements are kept in ascending hash order; a new element is always linked
//! at the end of its hash run, so two writers racing to create the live
//! element for one value contend on the same link and only one wins.
//!
//! Removal is mark-then-swing: the element's own `next` link is tagged
//! [`MARK`] first, which freezes it, then its predecessor is swung past it.
//! Any traversal that meets a marked element helps finish the swing, and the
//! thread whose swing lands hands the element to the collector. Only dead
//! elements that the coordinator's front has passed are ever marked.
//!
//! A chain's head can be tagged [`CLOSED`] while the chain is empty. A closed
//! chain refuses new elements forever; the hash-trie variant uses this to
//! retire per-value buckets.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use cinder_base::Result;
use cinder_reclaim::{defer_free, EpochCoordinator, Guard};

use super::element::Element;

const MARK: usize = 0b01;
const CLOSED: usize = 0b10;
const TAGS: usize = MARK | CLOSED;

fn tag_of<T>(ptr: *mut T) -> usize {
    ptr as usize & TAGS
}

fn untagged<T>(ptr: *mut T) -> *mut T {
    (ptr as usize & !TAGS) as *mut T
}

fn with_tag<T>(ptr: *mut T, tag: usize) -> *mut T {
    (ptr as usize | tag) as *mut T
}

/// What an access did to the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// No live element existed; one was created with this sign.
    Created { positive: bool },
    /// The live element's count moved.
    Adjusted { before: i64, after: i64 },
    /// The chain is closed and took no change.
    Closed,
}

impl Outcome {
    /// A value went from absent to present.
    pub(crate) fn became_present(self) -> bool {
        matches!(self, Self::Created { positive: true })
    }

    /// A value went from present to absent.
    pub(crate) fn became_absent(self) -> bool {
        matches!(self, Self::Adjusted { before: 1, after: 0 })
    }

    /// A live element died and now waits to be unlinked.
    pub(crate) fn killed(self) -> bool {
        matches!(self, Self::Adjusted { after: 0, .. })
    }
}

/// Counters gathered while walking a chain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Sweep {
    /// Elements this walk unlinked.
    pub(crate) unlinked: usize,
    /// Dead elements still visible to some pinned epoch.
    pub(crate) waiting: usize,
}

struct Position<'g, T> {
    pred: &'g AtomicPtr<Element<T>>,
    succ: *mut Element<T>,
    live: Option<&'g Element<T>>,
}

struct Closed;

pub(crate) struct Chain<T> {
    head: AtomicPtr<Element<T>>,
    _owns: PhantomData<Box<Element<T>>>,
}

impl<T> Chain<T> {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            _owns: PhantomData,
        }
    }

    /// First element, for read-only traversal under a pin.
    pub(crate) fn first(&self) -> *const Element<T> {
        untagged(self.head.load(Ordering::Acquire))
    }

    /// Closes the chain if it holds no element at all.
    pub(crate) fn try_close(&self) -> bool {
        self.head
            .compare_exchange(
                ptr::null_mut(),
                with_tag(ptr::null_mut(), CLOSED),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl<T: Eq + Clone + Send + 'static> Chain<T> {
    /// Finds the insertion point for `target` (or the end of the chain),
    /// unlinking reapable elements on the way.
    fn walk<'g>(
        &'g self,
        target: Option<(u64, &T)>,
        coordinator: &EpochCoordinator,
        front: u64,
        sweep: &mut Sweep,
        _guard: &'g Guard,
    ) -> std::result::Result<Position<'g, T>, Closed> {
        'retry: loop {
            sweep.waiting = 0;
            let mut pred = &self.head;
            let mut curr = pred.load(Ordering::Acquire);
            if tag_of(curr) == CLOSED {
                return Err(Closed);
            }
            let mut live = None;

            loop {
                // Safety: linked and marked elements are freed only through
                // the collector, and this thread is pinned.
                let Some(node) = (unsafe { curr.as_ref() }) else {
                    return Ok(Position {
                        pred,
                        succ: curr,
                        live,
                    });
                };
                let next = node.next.load(Ordering::Acquire);

                if tag_of(next) == MARK {
                    let succ = untagged(next);
                    if pred
                        .compare_exchange(curr, succ, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        continue 'retry;
                    }
                    sweep.unlinked += 1;
                    // Safety: the swing above made `curr` unreachable, and
                    // only the thread whose swing lands retires it.
                    unsafe { defer_free(curr) };
                    curr = succ;
                    continue;
                }

                if let Some((hash, _)) = target {
                    if node.hash > hash {
                        return Ok(Position {
                            pred,
                            succ: curr,
                            live,
                        });
                    }
                }

                if node.is_dead() {
                    if node.is_reapable(coordinator, front) {
                        // Re-examined on the next pass whether or not this lands.
                        let _ = node.next.compare_exchange(
                            next,
                            with_tag(next, MARK),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        continue;
                    }
                    sweep.waiting += 1;
                } else if let Some((hash, value)) = target {
                    if node.hash == hash && node.value == *value {
                        live = Some(node);
                    }
                }

                pred = &node.next;
                curr = next;
            }
        }
    }

    /// Moves the live element for `value` by `delta`, creating it when
    /// there is none.
    pub(crate) fn access(
        &self,
        coordinator: &EpochCoordinator,
        front: u64,
        hash: u64,
        value: &T,
        delta: i64,
        guard: &Guard,
    ) -> Result<Outcome> {
        let mut spare: Option<Box<Element<T>>> = None;
        let mut sweep = Sweep::default();
        loop {
            let Ok(position) =
                self.walk(Some((hash, value)), coordinator, front, &mut sweep, guard)
            else {
                return Ok(Outcome::Closed);
            };

            if let Some(live) = position.live {
                match live.adjust(delta) {
                    Some((before, after)) => {
                        if after == 0 {
                            live.settle_deleted(coordinator);
                        }
                        return Ok(Outcome::Adjusted { before, after });
                    }
                    // Died under us; the next walk will not report it.
                    None => continue,
                }
            }

            let fresh = match spare.take() {
                Some(fresh) => fresh,
                None => Element::try_boxed(value.clone(), hash, delta)?,
            };
            fresh.next.store(position.succ, Ordering::Relaxed);
            let raw = Box::into_raw(fresh);
            match position.pred.compare_exchange(
                position.succ,
                raw,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // Safety: published under `guard`.
                    unsafe { (*raw).settle_created(coordinator) };
                    return Ok(Outcome::Created {
                        positive: delta > 0,
                    });
                }
                // Safety: the element was never published.
                Err(_) => spare = Some(unsafe { Box::from_raw(raw) }),
            }
        }
    }

    /// Unlinks every reapable element.
    ///
    /// A closed chain is empty, so it reports nothing.
    pub(crate) fn sweep(&self, coordinator: &EpochCoordinator, front: u64, guard: &Guard) -> Sweep {
        let mut sweep = Sweep::default();
        let _ = self.walk(None, coordinator, front, &mut sweep, guard);
        sweep
    }

    /// Signed count of the live element for `value`, or zero.
    pub(crate) fn count_of(&self, hash: u64, value: &T, _guard: &Guard) -> i64 {
        let mut cursor = self.first();
        // Safety: this thread is pinned.
        while let Some(node) = unsafe { cursor.as_ref() } {
            if node.hash > hash {
                break;
            }
            if node.hash == hash && node.value == *value {
                let count = node.count();
                if count != 0 {
                    return count;
                }
            }
            cursor = untagged(node.next.load(Ordering::Acquire));
        }
        0
    }
}

/// Successor of `element` for read-only traversal.
pub(crate) fn successor<T>(element: &Element<T>) -> *const Element<T> {
    untagged(element.next.load(Ordering::Acquire))
}

impl<T> Drop for Chain<T> {
    fn drop(&mut self) {
        let mut cursor = untagged(*self.head.get_mut());
        while !cursor.is_null() {
            // Safety: exclusive access; unlinked elements are no longer
            // reachable from here, so each linked one is freed exactly once.
            let mut element = unsafe { Box::from_raw(cursor) };
            cursor = untagged(*element.next.get_mut());
        }
    }
}
