/*!
 * Thread Parker
 * Per-thread park/unpark handle with a cooperative interrupt flag
 *
 * Parking uses the standard library's token-based park/unpark (an
 * unpark delivered before the park makes the next park return
 * immediately), so a wake can never be lost between a status check and
 * the park itself. Interruption is cooperative: `interrupt` raises a
 * flag and unparks; blocking loops observe the flag at their next wake.
 */

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::Duration;

use crate::core::Nanos;

static NEXT_PARKER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: Arc<Parker> = Arc::new(Parker::new(thread::current()));
}

/// Park/unpark handle for one thread.
pub struct Parker {
    id: u64,
    thread: Thread,
    interrupted: AtomicBool,
}

impl Parker {
    fn new(thread: Thread) -> Self {
        Self {
            id: NEXT_PARKER_ID.fetch_add(1, Ordering::Relaxed),
            thread,
            interrupted: AtomicBool::new(false),
        }
    }

    /// Process-unique identity for owner tracking.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The underlying thread handle.
    #[inline]
    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    /// Wake the thread if it is parked; otherwise bank one permit.
    #[inline]
    pub fn unpark(&self) {
        self.thread.unpark();
    }

    /// Raise the interrupt flag and unpark the thread.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.thread.unpark();
    }

    /// Read the interrupt flag without clearing it.
    #[inline]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Read and clear the interrupt flag.
    #[inline]
    pub(crate) fn take_interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Re-assert the interrupt flag (without waking anything).
    #[inline]
    pub(crate) fn set_interrupted(&self) {
        self.interrupted.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Parker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parker")
            .field("id", &self.id)
            .field("thread", &self.thread.name())
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// The calling thread's parker.
pub fn current() -> Arc<Parker> {
    CURRENT.with(Arc::clone)
}

/// Park the calling thread until unparked (or spuriously woken).
#[inline]
pub(crate) fn park() {
    thread::park();
}

/// Park the calling thread for at most `nanos` nanoseconds.
#[inline]
pub(crate) fn park_nanos(nanos: Nanos) {
    if nanos > 0 {
        thread::park_timeout(Duration::from_nanos(nanos as u64));
    }
}
