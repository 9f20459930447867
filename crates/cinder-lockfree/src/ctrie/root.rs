//! Root maintenance: GCAS on the root indirection and the RDCSS-style
//! redirection used to swap in a new generation.
//!
//! A writer never mutates the trie in place. It builds a new main node and
//! GCASes it into the root indirection, leaving a pending link to the main
//! node it replaced. The link is committed only if the indirection's
//! generation is still the trie's current generation when checked, and
//! aborted (with the indirection reverted) otherwise. Any thread that reads
//! a pending main node settles it before using it.

use std::sync::atomic::{AtomicU8, Ordering};

use cinder_base::Result;
use cinder_reclaim::{Guard, Managed, Ref};
use tracing::trace;

use super::node::{
    same, Generation, MainSlot, Node, Redirection, Transition, RDCSS_ABORTED, RDCSS_COMMITTED,
    RDCSS_PENDING,
};
use super::{protected, HashTrie};

fn indirection<K: Managed, V: Managed>(node: &Node<K, V>) -> (&MainSlot<K, V>, &Ref<Generation>) {
    match node {
        Node::Indirection { main, generation } => (main, generation),
        other => unreachable!("{} found at the root", other.kind()),
    }
}

impl<K, V, S> HashTrie<K, V, S>
where
    K: Managed,
    V: Managed,
{
    /// Returns the root indirection, completing any redirection found there.
    ///
    /// With `abort` set, a pending redirection is rolled back instead of
    /// checked; GCAS commits use this so they never recurse into a main
    /// node read.
    pub(super) fn read_root<'g>(&self, abort: bool, guard: &'g Guard) -> &'g Node<K, V> {
        loop {
            let raw = self.root.load(Ordering::SeqCst);
            // Safety: loaded from the trie under `guard`.
            let node = unsafe { protected(raw, guard) };
            let Node::Redirection(redirect) = node else {
                return node;
            };

            let mut state = redirect.state.load(Ordering::SeqCst);
            if state == RDCSS_PENDING {
                let decision = if abort {
                    RDCSS_ABORTED
                } else {
                    let main = self.gcas_read(&redirect.old, guard);
                    if same(main, Ref::as_ptr(&redirect.expected)) {
                        RDCSS_COMMITTED
                    } else {
                        RDCSS_ABORTED
                    }
                };
                state = match redirect.state.compare_exchange(
                    RDCSS_PENDING,
                    decision,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => decision,
                    Err(settled) => settled,
                };
            }

            let target = if state == RDCSS_COMMITTED {
                &redirect.new
            } else {
                &redirect.old
            };
            let replacement = Ref::into_raw(target.clone()).cast_mut();
            match self
                .root
                .compare_exchange(raw, replacement, Ordering::SeqCst, Ordering::SeqCst)
            {
                // Safety: the root owned one count on the descriptor.
                Ok(_) => drop(unsafe { Ref::from_raw(raw.cast_const()) }),
                // Safety: the clone was leaked just above and never published.
                Err(_) => drop(unsafe { Ref::from_raw(replacement.cast_const()) }),
            }
        }
    }

    /// Returns the settled main node of `inode`.
    pub(super) fn gcas_read<'g>(&self, inode: &'g Node<K, V>, guard: &'g Guard) -> &'g Node<K, V> {
        let (slot, _) = indirection(inode);
        // Safety: loaded from the trie under `guard`.
        let main = unsafe { protected(slot.load(), guard) };
        match main.as_branch().transition.load() {
            Transition::Committed => main,
            Transition::Pending(_) | Transition::Aborted(_) => self.gcas_commit(inode, main, guard),
        }
    }

    /// Settles the transition of `main`, then of whatever main node ends up
    /// in `inode`, and returns the settled one.
    fn gcas_commit<'g>(
        &self,
        inode: &'g Node<K, V>,
        mut main: &'g Node<K, V>,
        guard: &'g Guard,
    ) -> &'g Node<K, V> {
        let (slot, generation) = indirection(inode);
        loop {
            let link = &main.as_branch().transition;
            match link.load() {
                Transition::Committed => return main,
                Transition::Aborted(prev) => {
                    // Safety: an aborted link keeps its count on `prev` for as
                    // long as `main` is alive.
                    if let Some(prev_ref) = unsafe { Ref::try_acquire(prev) } {
                        let raw = Ref::into_raw(prev_ref);
                        match slot.compare_exchange(main, raw) {
                            Ok(()) => {
                                // Safety: the slot owned one count on `main`.
                                drop(unsafe { Ref::from_raw(main) });
                                trace!("reverted aborted main node");
                                // Safety: `prev` is reachable from `main`.
                                return unsafe { protected(prev, guard) };
                            }
                            // Safety: never published.
                            Err(_) => drop(unsafe { Ref::from_raw(raw) }),
                        }
                    }
                    // Safety: loaded from the trie under `guard`.
                    main = unsafe { protected(slot.load(), guard) };
                }
                Transition::Pending(prev) => {
                    let (_, current) = indirection(self.read_root(true, guard));
                    if Ref::ptr_eq(current, generation) {
                        if link.commit(prev) {
                            return main;
                        }
                    } else if link.abort(prev) {
                        trace!(
                            stale = generation.id(),
                            current = current.id(),
                            "aborted transition from a stale generation"
                        );
                    }
                }
            }
        }
    }

    /// GCASes `new` in place of `old` as the main node of `inode`.
    ///
    /// Returns whether the transition committed. On failure the trie is
    /// unchanged and the caller restarts from the root.
    pub(super) fn gcas(&self, inode: &Node<K, V>, old: &Node<K, V>, new: Ref<Node<K, V>>, guard: &Guard) -> bool {
        let (slot, _) = indirection(inode);
        // Safety: `old` was read from the trie under `guard`.
        let Some(prev) = (unsafe { Ref::try_acquire(old) }) else {
            return false;
        };
        new.as_branch().transition.set_pending(prev);

        let raw = Ref::into_raw(new);
        match slot.compare_exchange(old, raw) {
            Ok(()) => {
                // Safety: the slot owned one count on `old`.
                drop(unsafe { Ref::from_raw(old) });
                // Safety: just published under `guard`.
                let node = unsafe { protected(raw, guard) };
                self.gcas_commit(inode, node, guard);
                matches!(node.as_branch().transition.load(), Transition::Committed)
            }
            Err(_) => {
                // Safety: never published; dropping it also releases `prev`.
                drop(unsafe { Ref::from_raw(raw) });
                false
            }
        }
    }

    /// Swaps a fresh-generation indirection in at the root, keeping the
    /// current main node. Returns the main node the new generation starts
    /// from.
    pub(super) fn renew_generation(&self, guard: &Guard) -> Result<Ref<Node<K, V>>> {
        loop {
            let inode = self.read_root(false, guard);
            let main = self.gcas_read(inode, guard);
            // Safety: both were read from the trie under `guard`.
            let (Some(old), Some(expected)) =
                (unsafe { (Ref::try_acquire(inode), Ref::try_acquire(main)) })
            else {
                continue;
            };

            let generation = Ref::try_new(Generation::next())?;
            let generation_id = generation.id();
            let new = Node::Indirection {
                main: MainSlot::new(expected.clone()),
                generation,
            }
            .alloc()?;
            let descriptor = Node::Redirection(Redirection {
                old,
                expected: expected.clone(),
                new,
                state: AtomicU8::new(RDCSS_PENDING),
            })
            .alloc()?;

            let raw = Ref::into_raw(descriptor.clone()).cast_mut();
            let current = (inode as *const Node<K, V>).cast_mut();
            if self
                .root
                .compare_exchange(current, raw, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                // Safety: never published.
                drop(unsafe { Ref::from_raw(raw.cast_const()) });
                continue;
            }
            // Safety: the root owned one count on the old indirection; the
            // descriptor holds its own.
            drop(unsafe { Ref::from_raw(current.cast_const()) });

            self.read_root(false, guard);
            let Node::Redirection(redirect) = &*descriptor else {
                unreachable!("descriptor is a redirection");
            };
            if redirect.state.load(Ordering::SeqCst) == RDCSS_COMMITTED {
                trace!(generation = generation_id, "installed new generation");
                return Ok(expected);
            }
        }
    }
}
