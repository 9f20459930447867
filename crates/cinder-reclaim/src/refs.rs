//! Intrusive reference counting with deferred destruction.
//!
//! A [`Ref`] owns one count on a heap cell that stores the counter next to
//! the value. When the last count is dropped the cell is not freed: it is
//! retired to the collector, and the value (and with it any `Ref`s it holds)
//! is dropped only once no pinned thread can still reach it.
//!
//! Readers that find a raw pointer in a shared slot use
//! [`Ref::try_acquire`], which refuses to resurrect a cell whose count has
//! already reached zero.

use std::alloc::{self, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use cinder_base::{Error, Result};

use crate::collector;

/// Values that can live in shared, reference-counted cells.
///
/// Thread safety is not part of the bound: a cell type may hold `Ref`s to
/// itself, and `Ref<T>` is `Send` and `Sync` exactly when `T` is both.
pub trait Managed: 'static {}

impl<T: 'static> Managed for T {}

/// Atomic reference counter embedded in a managed cell.
#[derive(Debug)]
pub struct RefCount {
    refs: AtomicUsize,
}

impl RefCount {
    /// A counter holding the creator's reference.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            refs: AtomicUsize::new(1),
        }
    }

    /// Adds a reference unless the count already reached zero.
    pub fn increment_refs(&self) -> bool {
        let mut current = self.refs.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drops a reference. Returns `true` if it was the last one.
    pub fn decrement_refs(&self) -> bool {
        if self.refs.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }

    /// Returns the current count.
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

#[repr(C)]
struct RefBox<T> {
    count: RefCount,
    value: T,
}

/// A counted reference to a managed value.
pub struct Ref<T: Managed> {
    cell: NonNull<RefBox<T>>,
    _owns: PhantomData<RefBox<T>>,
}

// Safety: the count is atomic and `T: Send + Sync`.
unsafe impl<T: Send + Sync + 'static> Send for Ref<T> {}
unsafe impl<T: Send + Sync + 'static> Sync for Ref<T> {}

impl<T: Managed> Ref<T> {
    /// Allocates a cell holding `value` with a count of one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the allocator refuses the cell.
    pub fn try_new(value: T) -> Result<Self> {
        let layout = Layout::new::<RefBox<T>>();
        // Safety: the layout is never zero-sized, the counter alone is a word.
        let raw = unsafe { alloc::alloc(layout) }.cast::<RefBox<T>>();
        let Some(cell) = NonNull::new(raw) else {
            return Err(Error::OutOfMemory {
                bytes: layout.size(),
            });
        };
        // Safety: freshly allocated with the layout of `RefBox<T>`.
        unsafe {
            cell.as_ptr().write(RefBox {
                count: RefCount::new(),
                value,
            });
        }
        Ok(Self {
            cell,
            _owns: PhantomData,
        })
    }

    /// Allocates a cell, aborting through the global allocation error
    /// handler if memory is exhausted.
    pub fn new(value: T) -> Self {
        match Self::try_new(value) {
            Ok(this) => this,
            Err(_) => alloc::handle_alloc_error(Layout::new::<RefBox<T>>()),
        }
    }

    /// Offset of the value inside the `repr(C)` cell.
    const fn value_offset() -> usize {
        let count = mem::size_of::<RefCount>();
        let align = mem::align_of::<T>();
        (count + align - 1) & !(align - 1)
    }

    /// Recovers the cell pointer from a value pointer.
    fn cell_of(value: *const T) -> *mut RefBox<T> {
        value
            .cast::<u8>()
            .wrapping_sub(Self::value_offset())
            .cast::<RefBox<T>>()
            .cast_mut()
    }

    /// Returns a pointer to the value.
    #[must_use]
    pub fn as_ptr(this: &Self) -> *const T {
        // Safety: the cell is live while `this` holds a count.
        unsafe { ptr::addr_of!((*this.cell.as_ptr()).value) }
    }

    /// Gives up this handle without touching the count.
    #[must_use]
    pub fn into_raw(this: Self) -> *const T {
        let value = Self::as_ptr(&this);
        mem::forget(this);
        value
    }

    /// Takes ownership of one count previously leaked by [`Ref::into_raw`].
    ///
    /// # Safety
    ///
    /// `value` must come from `into_raw` on a `Ref<T>`, and the count it
    /// stood for must not be reclaimed twice.
    #[must_use]
    pub unsafe fn from_raw(value: *const T) -> Self {
        Self {
            cell: NonNull::new_unchecked(Self::cell_of(value)),
            _owns: PhantomData,
        }
    }

    /// Takes a new count on the cell behind `value` if it is still alive.
    ///
    /// # Safety
    ///
    /// `value` must come from `into_raw` or `as_ptr`, and the cell must not
    /// have been destroyed yet: the caller is pinned and found the pointer
    /// in a structure it was retired from after the pin.
    pub unsafe fn try_acquire(value: *const T) -> Option<Self> {
        let cell = Self::cell_of(value);
        if (*cell).count.increment_refs() {
            Some(Self {
                cell: NonNull::new_unchecked(cell),
                _owns: PhantomData,
            })
        } else {
            None
        }
    }

    /// Returns whether both handles point at the same cell.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.cell == b.cell
    }

    /// Returns the number of counts currently held.
    #[must_use]
    pub fn strong_count(this: &Self) -> usize {
        // Safety: the cell is live while `this` holds a count.
        unsafe { (*this.cell.as_ptr()).count.refs() }
    }
}

impl<T: Managed> Clone for Ref<T> {
    fn clone(&self) -> Self {
        // Safety: `self` holds a count, so the cell is live and the count
        // cannot be zero.
        unsafe { (*self.cell.as_ptr()).count.refs.fetch_add(1, Ordering::Relaxed) };
        Self {
            cell: self.cell,
            _owns: PhantomData,
        }
    }
}

impl<T: Managed> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the cell is live while `self` holds a count.
        unsafe { &(*self.cell.as_ptr()).value }
    }
}

impl<T: Managed + fmt::Debug> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

unsafe fn destroy_cell<T>(ptr: *mut ()) {
    let cell = ptr.cast::<RefBox<T>>();
    ptr::drop_in_place(cell);
    alloc::dealloc(cell.cast::<u8>(), Layout::new::<RefBox<T>>());
}

impl<T: Managed> Drop for Ref<T> {
    fn drop(&mut self) {
        // Safety: the cell is live while `self` holds a count.
        let last = unsafe { (*self.cell.as_ptr()).count.decrement_refs() };
        if last {
            collector::retire(self.cell.as_ptr().cast::<()>(), destroy_cell::<T>);
        }
    }
}
