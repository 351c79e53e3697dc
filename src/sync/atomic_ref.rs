/*!
 * Counted Atomic Link Cell
 *
 * Queue links (`prev`, `next`, head, tail, waiter chains) are atomic
 * pointer cells where every stored non-null pointer owns one strong
 * `Arc` count on its target. Overwrites release the displaced count
 * through an epoch-deferred drop, so a reader that loaded the old
 * pointer under an epoch pin can keep dereferencing it until it
 * unpins. Together with the rule that any pointer held across a park
 * lives in a counted cell, this keeps every raw traversal valid
 * without a garbage collector.
 *
 * The one uncounted exception is the cancellation sentinel: a node's
 * `next` may be pointed at the node itself to mark an ex-queue member.
 * The self-reference is stored with a tag bit so it never contributes
 * a count (a counted self-loop could never be reclaimed).
 */

use crossbeam_epoch::Guard;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

const TAG: usize = 1;

#[inline]
fn tagged<T>(raw: *const T) -> *mut T {
    (raw as usize | TAG) as *mut T
}

#[inline]
fn is_tagged<T>(raw: *const T) -> bool {
    raw as usize & TAG != 0
}

/// Strip the sentinel tag from a raw cell word.
#[inline]
pub(crate) fn untag<T>(raw: *mut T) -> *mut T {
    (raw as usize & !TAG) as *mut T
}

/// Clone the `Arc` behind a pointer loaded from a live cell.
///
/// # Safety
///
/// `raw` must have been loaded from an [`AtomicRef`] while `_guard`
/// was pinned, and must be non-null. The cell owned a count at load
/// time and any concurrent release of that count is deferred past the
/// pin, so the strong count is observably non-zero here.
pub(crate) unsafe fn arc_clone_guarded<T>(raw: *const T, _guard: &Guard) -> Arc<T> {
    Arc::increment_strong_count(raw);
    Arc::from_raw(raw)
}

/// Atomic `Option<Arc<T>>` cell with raw-pointer identity semantics.
pub(crate) struct AtomicRef<T> {
    ptr: AtomicPtr<T>,
    _marker: PhantomData<Option<Arc<T>>>,
}

impl<T> AtomicRef<T> {
    pub(crate) const fn null() -> Self {
        Self {
            ptr: AtomicPtr::new(std::ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// The exact stored word, tag included. Suitable for identity
    /// comparison and as the `expect` of a `compare_exchange`; must be
    /// untagged before dereferencing.
    #[inline]
    pub(crate) fn load_raw(&self) -> *mut T {
        self.ptr.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_null(&self) -> bool {
        self.load_raw().is_null()
    }
}

impl<T: Send + Sync + 'static> AtomicRef<T> {
    pub(crate) fn new(value: Arc<T>) -> Self {
        Self {
            ptr: AtomicPtr::new(Arc::into_raw(value) as *mut T),
            _marker: PhantomData,
        }
    }

    /// Dereference the current target for the lifetime of the pin.
    #[inline]
    pub(crate) fn load<'g>(&self, _guard: &'g Guard) -> Option<&'g T> {
        unsafe { untag(self.load_raw()).as_ref() }
    }

    /// Replace the cell contents, releasing the displaced count after
    /// all current pins retire.
    pub(crate) fn store(&self, new: Option<Arc<T>>, guard: &Guard) {
        let old = self.ptr.swap(into_raw(new), Ordering::AcqRel);
        release_deferred(old, guard);
    }

    /// Point the cell at `target` without taking a count (sentinel).
    pub(crate) fn store_sentinel(&self, target: *const T, guard: &Guard) {
        let old = self.ptr.swap(tagged(target), Ordering::AcqRel);
        release_deferred(old, guard);
    }

    /// Clone out the current target as an owned `Arc`.
    pub(crate) fn clone_inner(&self, guard: &Guard) -> Option<Arc<T>> {
        let raw = untag(self.load_raw());
        if raw.is_null() {
            None
        } else {
            Some(unsafe { arc_clone_guarded(raw, guard) })
        }
    }

    /// CAS the exact stored word. On success the displaced count is
    /// released (deferred); on failure ownership of `new` returns to
    /// the caller.
    pub(crate) fn compare_exchange(
        &self,
        expect: *mut T,
        new: Option<Arc<T>>,
        guard: &Guard,
    ) -> Result<(), Option<Arc<T>>> {
        let new_raw = into_raw(new);
        match self
            .ptr
            .compare_exchange(expect, new_raw, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(old) => {
                release_deferred(old, guard);
                Ok(())
            }
            Err(_) => Err(unsafe { from_raw(new_raw) }),
        }
    }
}

impl<T> Drop for AtomicRef<T> {
    fn drop(&mut self) {
        let raw = *self.ptr.get_mut();
        if !raw.is_null() && !is_tagged(raw) {
            // Exclusive access: nobody can still be reading through
            // this cell, so the count can drop immediately.
            unsafe { drop(Arc::from_raw(raw)) };
        }
    }
}

impl<T> std::fmt::Debug for AtomicRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AtomicRef({:p})", self.load_raw())
    }
}

#[inline]
fn into_raw<T>(value: Option<Arc<T>>) -> *mut T {
    match value {
        Some(arc) => Arc::into_raw(arc) as *mut T,
        None => std::ptr::null_mut(),
    }
}

/// # Safety
/// `raw` must be null or a pointer minted by [`into_raw`] whose count
/// has not been released.
#[inline]
unsafe fn from_raw<T>(raw: *mut T) -> Option<Arc<T>> {
    if raw.is_null() {
        None
    } else {
        Some(Arc::from_raw(raw))
    }
}

fn release_deferred<T: Send + Sync + 'static>(raw: *mut T, guard: &Guard) {
    if !raw.is_null() && !is_tagged(raw) {
        let addr = raw as usize;
        guard.defer(move || unsafe { drop(Arc::from_raw(addr as *const T)) });
    }
}
