//! Lock-free Treiber stack with whole-batch publication.
//!
//! Popped node shells are handed to the collector instead of being freed on
//! the spot, so a concurrent pop that still reads a shell's `next` link never
//! touches freed memory.

use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use cinder_reclaim::{defer_free, pin};
use crossbeam_utils::Backoff;

/// A node in the stack.
struct Node<T> {
    data: ManuallyDrop<T>,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn boxed(data: T) -> *mut Self {
        Box::into_raw(Box::new(Self {
            data: ManuallyDrop::new(data),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// A lock-free LIFO stack.
pub struct Stack<T> {
    head: AtomicPtr<Node<T>>,
    len: AtomicUsize,
}

impl<T: Send + 'static> Stack<T> {
    /// Creates an empty stack.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    /// Pushes one item.
    pub fn push(&self, data: T) {
        let node = Node::boxed(data);
        self.publish(node, node, 1);
    }

    /// Pushes every item of `batch` with a single publication: other threads
    /// see either none or all of them.
    ///
    /// Returns the number of items pushed.
    pub fn push_batch<I>(&self, batch: I) -> usize
    where
        I: IntoIterator<Item = T>,
    {
        let mut first: *mut Node<T> = ptr::null_mut();
        let mut last: *mut Node<T> = ptr::null_mut();
        let mut count = 0;
        for data in batch {
            let node = Node::boxed(data);
            if last.is_null() {
                first = node;
            } else {
                // Safety: `last` is private to this call until published.
                unsafe { (*last).next.store(node, Ordering::Relaxed) };
            }
            last = node;
            count += 1;
        }
        if count > 0 {
            self.publish(first, last, count);
        }
        count
    }

    /// Links the private chain `first..=last` in front of the head.
    fn publish(&self, first: *mut Node<T>, last: *mut Node<T>, count: usize) {
        // Counted before publication so `len` never underflows under a racing pop.
        self.len.fetch_add(count, Ordering::Relaxed);
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            // Safety: `last` is still private.
            unsafe { (*last).next.store(head, Ordering::Relaxed) };

            if self
                .head
                .compare_exchange_weak(head, first, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }

    /// Pops the most recently pushed item.
    pub fn pop(&self) -> Option<T> {
        let _guard = pin();
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }

            // Safety: `head` cannot be freed while this thread is pinned.
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };

            if self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.len.fetch_sub(1, Ordering::Relaxed);
                // Safety: the successful swap made this thread the only owner
                // of the payload; the shell is retired, never dropped twice.
                unsafe {
                    let data = ptr::read(&*(*head).data);
                    defer_free(head);
                    return Some(data);
                }
            }
            backoff.spin();
        }
    }

    /// Returns the number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns whether the stack is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T: Send + 'static> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        let mut cursor = *self.head.get_mut();
        while !cursor.is_null() {
            // Safety: exclusive access; every linked node is owned by the stack.
            let mut node = unsafe { Box::from_raw(cursor) };
            cursor = *node.next.get_mut();
            // Safety: linked nodes still own their payload.
            unsafe { ManuallyDrop::drop(&mut node.data) };
        }
    }
}

// Safety: payloads move between threads through the atomic head only.
unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_basic_push_pop() {
        let stack = Stack::new();
        stack.push(1);
        stack.push(2);

        assert_eq!(stack.len(), 2);
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_batch_is_contiguous() {
        let stack = Stack::new();
        stack.push(0);
        assert_eq!(stack.push_batch(vec![1, 2, 3]), 3);
        assert_eq!(stack.push_batch(Vec::new()), 0);
        assert_eq!(stack.len(), 4);
        let drained: Vec<_> = std::iter::from_fn(|| stack.pop()).collect();
        assert_eq!(drained, vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_drop_releases_payloads() {
        let payload = Arc::new(());
        let stack = Stack::new();
        for _ in 0..10 {
            stack.push(Arc::clone(&payload));
        }
        drop(stack);
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn test_concurrent_access() {
        let stack = Arc::new(Stack::new());
        let mut handles = vec![];

        // Spawn producers
        for i in 0..4 {
            let s = stack.clone();
            handles.push(thread::spawn(move || {
                for j in 0..100 {
                    s.push(i * 100 + j);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stack.len(), 400);

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let s = stack.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(v) = s.pop() {
                        seen.push(v);
                    }
                    seen
                })
            })
            .collect();
        let mut all: Vec<i32> = consumers
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..400).collect::<Vec<_>>());
    }
}
