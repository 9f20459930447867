//! Process-wide deferred reclamation.
//!
//! Every thread that touches a shared structure first [`pin`]s itself, which
//! claims an epoch token from the global coordinator. Allocations that become
//! unreachable are retired onto the calling thread's deferred stack, stamped
//! with the current epoch. [`collect`] frees entries whose stamp the epoch
//! front has passed.
//!
//! Destroying an entry can retire further allocations (a node releasing its
//! children), so collection repeats until a pass frees nothing.
//!
//! Retiring never frees anything by itself. Entries wait on their stack
//! until a quiescent point calls [`collect`]: the scheduler's reclamation
//! rounds, a worker's exit, or an owner that knows it is idle.
//!
//! Stacks left behind by exiting threads are pushed onto a global orphan list
//! and adopted by the next thread that collects.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use tracing::{debug, trace};

use crate::deferred::{DeferredStack, Retired};
use crate::epoch::{EpochCoordinator, EpochToken};

static COLLECTOR: Lazy<Collector> = Lazy::new(Collector::new);

/// Returns the global collector.
pub fn collector() -> &'static Collector {
    &COLLECTOR
}

struct Orphan {
    stack: DeferredStack,
    next: *mut Orphan,
}

/// Shared state of the reclamation scheme.
pub struct Collector {
    epochs: EpochCoordinator,
    orphans: AtomicPtr<Orphan>,
    orphaned: AtomicUsize,
}

impl Collector {
    fn new() -> Self {
        debug!(strategy = %cinder_base::strategy::ACTIVE, "initializing collector");
        Self {
            epochs: EpochCoordinator::new(),
            orphans: AtomicPtr::new(ptr::null_mut()),
            orphaned: AtomicUsize::new(0),
        }
    }

    /// The coordinator that issues pin epochs.
    pub fn epochs(&self) -> &EpochCoordinator {
        &self.epochs
    }

    /// Number of entries currently parked on the orphan list.
    #[must_use]
    pub fn orphaned(&self) -> usize {
        self.orphaned.load(Ordering::Relaxed)
    }

    fn push_orphan(&self, stack: DeferredStack) {
        if stack.is_empty() {
            return;
        }
        let count = stack.len();
        let node = Box::into_raw(Box::new(Orphan {
            stack,
            next: ptr::null_mut(),
        }));
        let mut head = self.orphans.load(Ordering::Acquire);
        loop {
            // Safety: the node is not yet published.
            unsafe { (*node).next = head };
            match self
                .orphans
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        self.orphaned.fetch_add(count, Ordering::Relaxed);
        trace!(entries = count, "orphaned deferred stack");
    }

    fn take_orphans(&self) -> DeferredStack {
        let mut adopted = DeferredStack::new();
        let mut cursor = self.orphans.swap(ptr::null_mut(), Ordering::AcqRel);
        while !cursor.is_null() {
            // Safety: the swap made this chain exclusively ours.
            let orphan = unsafe { Box::from_raw(cursor) };
            cursor = orphan.next;
            self.orphaned.fetch_sub(orphan.stack.len(), Ordering::Relaxed);
            adopted.append(orphan.stack);
        }
        adopted
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("epochs", &self.epochs)
            .field("orphaned", &self.orphaned())
            .finish()
    }
}

struct Local {
    pins: Cell<usize>,
    token: RefCell<Option<EpochToken<'static>>>,
    stack: RefCell<DeferredStack>,
    collecting: Cell<bool>,
}

impl Local {
    const fn new() -> Self {
        Self {
            pins: Cell::new(0),
            token: RefCell::new(None),
            stack: RefCell::new(DeferredStack::new()),
            collecting: Cell::new(false),
        }
    }
}

impl Drop for Local {
    fn drop(&mut self) {
        self.token.get_mut().take();
        let stack = std::mem::take(self.stack.get_mut());
        collector().push_orphan(stack);
    }
}

thread_local! {
    static LOCAL: Local = const { Local::new() };
}

/// Pins the current thread.
///
/// Pins nest: only the outermost pin claims an epoch, and the thread stays
/// pinned until every guard is dropped.
pub fn pin() -> Guard {
    let pinned = LOCAL.try_with(|local| {
        let pins = local.pins.get();
        if pins == 0 {
            let token = collector().epochs.acquire();
            *local.token.borrow_mut() = Some(token);
        }
        local.pins.set(pins + 1);
    });
    // Loads after the pin must not be reordered before the token is visible
    // to `front`.
    fence(Ordering::SeqCst);

    match pinned {
        Ok(()) => Guard {
            own: None,
            _not_send: PhantomData,
        },
        // Thread-local storage is gone; the guard carries its own token.
        Err(_) => Guard {
            own: Some(collector().epochs.acquire()),
            _not_send: PhantomData,
        },
    }
}

/// Keeps the current thread pinned while alive.
///
/// A guard is tied to the thread that created it.
#[must_use = "the thread is unpinned as soon as the guard is dropped"]
pub struct Guard {
    own: Option<EpochToken<'static>>,
    _not_send: PhantomData<*const ()>,
}

impl Guard {
    /// The epoch this thread is pinned at.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        if let Some(token) = &self.own {
            return token.epoch();
        }
        LOCAL
            .try_with(|local| local.token.borrow().as_ref().map(EpochToken::epoch))
            .ok()
            .flatten()
            .unwrap_or_default()
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard").field("epoch", &self.epoch()).finish()
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if self.own.take().is_some() {
            return;
        }
        let _ = LOCAL.try_with(|local| {
            let pins = local.pins.get().saturating_sub(1);
            local.pins.set(pins);
            if pins == 0 {
                let token = local.token.borrow_mut().take();
                drop(token);
            }
        });
    }
}

/// Hands an unreachable allocation to the collector.
///
/// The entry is stamped with the current epoch and freed by the first
/// [`collect`] on this thread after every thread pinned before that point
/// has unpinned.
pub(crate) fn retire(ptr: *mut (), destroy: crate::deferred::DestroyFn) {
    // The unlink (or final decrement) must be ordered before the stamp read.
    fence(Ordering::SeqCst);
    let stamp = collector().epochs.stamp();
    // Safety: the caller gives up the allocation; the stamp is taken after it
    // became unreachable.
    let mut slot = Some(unsafe { Retired::new(ptr, destroy, stamp) });

    let pushed = LOCAL.try_with(|local| {
        if let Some(entry) = slot.take() {
            local.stack.borrow_mut().push(entry);
        }
    });
    if pushed.is_err() {
        if let Some(entry) = slot {
            let mut stack = DeferredStack::new();
            stack.push(entry);
            collector().push_orphan(stack);
        }
    }
}

unsafe fn free_box<T>(ptr: *mut ()) {
    drop(Box::from_raw(ptr.cast::<T>()));
}

/// Defers freeing a boxed allocation until no pinned thread can reach it.
///
/// # Safety
///
/// `ptr` must come from `Box::into_raw`, must already be unreachable from
/// every shared structure, and must not be freed by anyone else.
pub unsafe fn defer_free<T: Send + 'static>(ptr: *mut T) {
    retire(ptr.cast::<()>(), free_box::<T>);
}

struct Collecting<'a>(&'a Cell<bool>);

impl Drop for Collecting<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Frees every retired entry on this thread (and any adopted orphans) that
/// the epoch front has passed. Returns the number of entries freed.
///
/// Re-entrant calls made while destroying entries return immediately.
pub fn collect() -> usize {
    LOCAL
        .try_with(|local| {
            if local.collecting.replace(true) {
                return 0;
            }
            let _collecting = Collecting(&local.collecting);
            let collector = collector();

            let adopted = collector.take_orphans();
            if !adopted.is_empty() {
                trace!(entries = adopted.len(), "adopted orphaned entries");
                local.stack.borrow_mut().append(adopted);
            }

            let mut freed = 0;
            loop {
                let horizon = collector.epochs.front();
                let ready = local.stack.borrow_mut().split_eligible(horizon);
                if ready.is_empty() {
                    break;
                }
                freed += ready.len();
                for entry in ready {
                    // Safety: the entry's stamp is below every pinned epoch.
                    unsafe { entry.destroy() };
                }
            }

            if freed > 0 {
                trace!(freed, pending = local.stack.borrow().len(), "collected");
            }
            freed
        })
        .unwrap_or(0)
}

/// Returns the number of entries waiting on this thread's deferred stack.
#[must_use]
pub fn pending() -> usize {
    LOCAL
        .try_with(|local| local.stack.borrow().len())
        .unwrap_or(0)
}
