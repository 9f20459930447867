//! Epoch coordinator.
//!
//! Tracks the ordered set of in-flight epoch tokens as a Michael-Scott queue
//! with a sentinel head. Tokens are issued in strictly increasing even
//! epochs; released tokens are unlinked from the front. [`EpochCoordinator::front`]
//! returns the earliest epoch any unreleased token can still observe, which
//! is the horizon used to decide whether a retired allocation is unreachable.
//!
//! Unlinked token nodes may still be read by concurrent traversals, so they
//! are parked on a private retired chain and freed once the traversal count
//! drops to zero.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use cinder_base::Serializer;
use crossbeam_utils::Backoff;

/// Epoch carried by the initial sentinel.
const SENTINEL_EPOCH: u64 = 0;

/// Distance between consecutive token epochs. Odd values are reserved for
/// retirement stamps, so a stamp never equals an epoch.
const EPOCH_STEP: u64 = 2;

struct TokenNode {
    epoch: u64,
    released: AtomicBool,
    next: AtomicPtr<TokenNode>,
    retired_next: AtomicPtr<TokenNode>,
}

impl TokenNode {
    fn boxed(epoch: u64) -> *mut Self {
        Box::into_raw(Box::new(Self {
            epoch,
            released: AtomicBool::new(false),
            next: AtomicPtr::new(ptr::null_mut()),
            retired_next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// Ordered set of in-flight epochs.
pub struct EpochCoordinator {
    head: AtomicPtr<TokenNode>,
    tail: AtomicPtr<TokenNode>,
    /// Threads currently dereferencing queue nodes.
    traversals: AtomicUsize,
    /// Unlinked nodes waiting for a quiescent moment.
    retired: AtomicPtr<TokenNode>,
    in_flight: AtomicUsize,
    serializer: Serializer,
}

impl EpochCoordinator {
    /// Creates a coordinator with no tokens in flight.
    #[must_use]
    pub fn new() -> Self {
        let sentinel = TokenNode::boxed(SENTINEL_EPOCH);
        Self {
            head: AtomicPtr::new(sentinel),
            tail: AtomicPtr::new(sentinel),
            traversals: AtomicUsize::new(0),
            retired: AtomicPtr::new(ptr::null_mut()),
            in_flight: AtomicUsize::new(0),
            serializer: Serializer::new(),
        }
    }

    /// Issues a token for the next epoch, appended at the tail.
    ///
    /// Epochs are strictly increasing in issue order. The token releases
    /// itself when dropped.
    pub fn acquire(&self) -> EpochToken<'_> {
        let _section = self.serializer.enter();
        let _traversal = self.traverse();
        let node = TokenNode::boxed(SENTINEL_EPOCH);
        self.in_flight.fetch_add(1, Ordering::Relaxed);

        let backoff = Backoff::new();
        let epoch = loop {
            let tail = self.tail.load(Ordering::SeqCst);
            // Safety: reachable nodes are not freed while a traversal is open.
            let tail_ref = unsafe { &*tail };
            let next = tail_ref.next.load(Ordering::SeqCst);
            if !next.is_null() {
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::SeqCst, Ordering::SeqCst);
                continue;
            }

            let epoch = tail_ref.epoch + EPOCH_STEP;
            // Safety: the node is not yet published.
            unsafe { (*node).epoch = epoch };
            if tail_ref
                .next
                .compare_exchange(ptr::null_mut(), node, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let _ = self
                    .tail
                    .compare_exchange(tail, node, Ordering::SeqCst, Ordering::SeqCst);
                break epoch;
            }
            backoff.spin();
        };

        EpochToken {
            coordinator: self,
            node,
            epoch,
        }
    }

    /// Releases `token` and advances the front past any released prefix.
    ///
    /// Returns `false` if the token was already released.
    ///
    /// # Panics
    ///
    /// Panics if `token` was issued by a different coordinator.
    pub fn try_release(&self, token: &mut EpochToken<'_>) -> bool {
        assert!(
            ptr::eq(token.coordinator, self),
            "epoch token released on a coordinator that did not issue it"
        );
        if token.node.is_null() {
            return false;
        }

        let _section = self.serializer.enter();
        let _traversal = self.traverse();
        // Safety: the token keeps its node linked until `released` is set.
        let was_released = unsafe { (*token.node).released.swap(true, Ordering::SeqCst) };
        token.node = ptr::null_mut();
        if was_released {
            return false;
        }
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.advance();
        true
    }

    /// Returns the earliest epoch any unreleased token can observe.
    ///
    /// With nothing in flight this is the epoch the next token would get,
    /// so every stamp issued so far is below it.
    pub fn front(&self) -> u64 {
        let _section = self.serializer.enter();
        let _traversal = self.traverse();
        self.advance()
    }

    /// Returns the most recently issued epoch.
    pub fn current(&self) -> u64 {
        let _traversal = self.traverse();
        loop {
            let tail = self.tail.load(Ordering::SeqCst);
            // Safety: traversal is open.
            let next = unsafe { (*tail).next.load(Ordering::SeqCst) };
            if next.is_null() {
                // Safety: traversal is open.
                return unsafe { (*tail).epoch };
            }
            let _ = self
                .tail
                .compare_exchange(tail, next, Ordering::SeqCst, Ordering::SeqCst);
        }
    }

    /// Returns a retirement stamp: above every epoch issued so far and below
    /// every epoch issued later.
    pub fn stamp(&self) -> u64 {
        self.current() + 1
    }

    /// Returns whether a token for `epoch` is issued and not yet released.
    pub fn is_pinned(&self, epoch: u64) -> bool {
        let _traversal = self.traverse();
        let head = self.head.load(Ordering::SeqCst);
        // Safety: traversal is open.
        let mut cursor = unsafe { (*head).next.load(Ordering::SeqCst) };
        while !cursor.is_null() {
            // Safety: traversal is open.
            let node = unsafe { &*cursor };
            if node.epoch == epoch {
                return !node.released.load(Ordering::SeqCst);
            }
            if node.epoch > epoch {
                return false;
            }
            cursor = node.next.load(Ordering::SeqCst);
        }
        false
    }

    /// Returns the number of tokens issued and not yet released.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Swings the head past released tokens and returns the front epoch.
    fn advance(&self) -> u64 {
        loop {
            let head = self.head.load(Ordering::SeqCst);
            // Safety: the caller holds a traversal.
            let next = unsafe { (*head).next.load(Ordering::SeqCst) };
            if next.is_null() {
                // Safety: the caller holds a traversal.
                return unsafe { (*head).epoch } + EPOCH_STEP;
            }
            // Safety: the caller holds a traversal.
            let next_ref = unsafe { &*next };
            if !next_ref.released.load(Ordering::SeqCst) {
                return next_ref.epoch;
            }

            // The head never overtakes the tail.
            let tail = self.tail.load(Ordering::SeqCst);
            if tail == head {
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::SeqCst, Ordering::SeqCst);
            }
            if self
                .head
                .compare_exchange(head, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.park(head, head);
            }
        }
    }

    fn traverse(&self) -> Traversal<'_> {
        self.traversals.fetch_add(1, Ordering::SeqCst);
        Traversal { coordinator: self }
    }

    /// Pushes the chain `first..=last` (linked by `retired_next`) onto the
    /// retired list.
    fn park(&self, first: *mut TokenNode, last: *mut TokenNode) {
        let mut current = self.retired.load(Ordering::SeqCst);
        loop {
            // Safety: parked nodes are owned by the retired list.
            unsafe { (*last).retired_next.store(current, Ordering::Relaxed) };
            match self
                .retired
                .compare_exchange_weak(current, first, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for EpochCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EpochCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochCoordinator")
            .field("current", &self.current())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Drop for EpochCoordinator {
    fn drop(&mut self) {
        let mut cursor = *self.head.get_mut();
        while !cursor.is_null() {
            // Safety: exclusive access; every linked node is owned by the queue.
            let node = unsafe { Box::from_raw(cursor) };
            cursor = node.next.load(Ordering::Relaxed);
        }
        // Safety: exclusive access.
        unsafe { free_chain(*self.retired.get_mut()) };
    }
}

/// Frees a chain of parked nodes.
///
/// # Safety
///
/// No thread may still reference any node of the chain.
unsafe fn free_chain(mut cursor: *mut TokenNode) {
    while !cursor.is_null() {
        let node = Box::from_raw(cursor);
        cursor = node.retired_next.load(Ordering::Relaxed);
    }
}

/// An open traversal. Nodes unlinked while any traversal is open stay
/// allocated until the last one closes.
struct Traversal<'a> {
    coordinator: &'a EpochCoordinator,
}

impl Drop for Traversal<'_> {
    fn drop(&mut self) {
        let coordinator = self.coordinator;
        // Take the batch while still counted, so every node in it was parked
        // before this traversal ended.
        let batch = coordinator.retired.swap(ptr::null_mut(), Ordering::SeqCst);
        if coordinator.traversals.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Safety: no traversal was open when the count reached zero, and
            // every node in the batch was unlinked before it was taken.
            unsafe { free_chain(batch) };
        } else if !batch.is_null() {
            let mut last = batch;
            loop {
                // Safety: the batch is exclusively ours until re-parked.
                let next = unsafe { (*last).retired_next.load(Ordering::Relaxed) };
                if next.is_null() {
                    break;
                }
                last = next;
            }
            coordinator.park(batch, last);
        }
    }
}

/// A claim on one in-flight epoch.
///
/// While the token is held, [`EpochCoordinator::front`] never moves past its
/// epoch. Dropping the token releases it.
#[must_use = "the epoch is released as soon as the token is dropped"]
pub struct EpochToken<'a> {
    coordinator: &'a EpochCoordinator,
    node: *mut TokenNode,
    epoch: u64,
}

// Safety: the node is only touched through the coordinator's atomic protocol.
unsafe impl Send for EpochToken<'_> {}
unsafe impl Sync for EpochToken<'_> {}

impl EpochToken<'_> {
    /// The epoch this token claims.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns whether the token is still in flight.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.node.is_null()
    }

    /// Releases the token now.
    pub fn release(mut self) {
        let coordinator = self.coordinator;
        coordinator.try_release(&mut self);
    }
}

impl fmt::Debug for EpochToken<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochToken")
            .field("epoch", &self.epoch)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Drop for EpochToken<'_> {
    fn drop(&mut self) {
        if !self.node.is_null() {
            let coordinator = self.coordinator;
            coordinator.try_release(self);
        }
    }
}
