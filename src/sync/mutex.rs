/*!
 * Queued Mutex
 * Reentrant exclusive lock built on the synchronizer framework
 *
 * State word = recursion depth (0 unlocked); the interpreter tracks
 * the owning thread by parker id. The scheduler's delay heap runs on
 * this lock and its conditions.
 */

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::{Nanos, SyncError, SyncResult};

use super::condition::Condition;
use super::parker;
use super::synchronizer::{SyncOps, Synchronizer};

/// Reentrant-lock state interpreter.
pub struct MutexOps {
    /// Parker id of the holder; 0 = unowned.
    owner: AtomicU64,
}

impl SyncOps for MutexOps {
    fn try_acquire(&self, sync: &Synchronizer<Self>, arg: i32) -> SyncResult<bool> {
        let me = parker::current().id();
        let c = sync.state().get();
        if c == 0 {
            if sync.state().compare_and_set(0, arg) {
                self.owner.store(me, Ordering::Release);
                return Ok(true);
            }
        } else if self.owner.load(Ordering::Acquire) == me {
            let next = c.checked_add(arg).ok_or_else(|| {
                SyncError::IllegalMonitorState("maximum hold count exceeded".to_string())
            })?;
            sync.state().set(next);
            return Ok(true);
        }
        Ok(false)
    }

    fn try_release(&self, sync: &Synchronizer<Self>, arg: i32) -> SyncResult<bool> {
        let me = parker::current().id();
        let c = sync.state().get() - arg;
        if self.owner.load(Ordering::Acquire) != me {
            return Err(SyncError::IllegalMonitorState(
                "mutex released by non-owner thread".to_string(),
            ));
        }
        let free = c == 0;
        if free {
            self.owner.store(0, Ordering::Release);
        }
        sync.state().set(c);
        Ok(free)
    }

    fn is_held_exclusively(&self, _sync: &Synchronizer<Self>) -> bool {
        self.owner.load(Ordering::Acquire) == parker::current().id()
    }
}

/// Reentrant mutex guarding a value.
pub struct Mutex<T> {
    sync: Arc<Synchronizer<MutexOps>>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            sync: Arc::new(Synchronizer::new(
                MutexOps {
                    owner: AtomicU64::new(0),
                },
                0,
            )),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire, ignoring interrupts (they are re-asserted on the
    /// calling thread).
    pub fn lock(&self) -> MutexGuard<'_, T> {
        // Hold-count overflow is the only possible failure here.
        self.sync
            .acquire(1)
            .expect("maximum hold count exceeded");
        MutexGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Acquire unless the calling thread is interrupted.
    pub fn lock_interruptibly(&self) -> SyncResult<MutexGuard<'_, T>> {
        self.sync.acquire_interruptibly(1)?;
        Ok(MutexGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Acquire only if the lock is free (or already held) right now.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match self.sync.ops().try_acquire(&self.sync, 1) {
            Ok(true) => Some(MutexGuard {
                lock: self,
                _not_send: PhantomData,
            }),
            _ => None,
        }
    }

    /// Acquire within the timeout; `Ok(None)` on expiry.
    pub fn try_lock_for(&self, timeout: Duration) -> SyncResult<Option<MutexGuard<'_, T>>> {
        if self.sync.try_acquire_nanos(1, timeout.as_nanos() as Nanos)? {
            Ok(Some(MutexGuard {
                lock: self,
                _not_send: PhantomData,
            }))
        } else {
            Ok(None)
        }
    }

    /// Create a condition bound to this mutex.
    pub fn new_condition(&self) -> MutexCondition {
        MutexCondition {
            cond: self.sync.new_condition(),
            sync: Arc::clone(&self.sync),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.sync.state().get() != 0
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.sync.ops().is_held_exclusively(&self.sync)
    }

    /// Recursion depth held by the calling thread (0 if not holder).
    pub fn hold_count(&self) -> i32 {
        if self.is_held_by_current_thread() {
            self.sync.state().get()
        } else {
            0
        }
    }

    pub fn has_queued_threads(&self) -> bool {
        self.sync.has_queued_threads()
    }

    pub fn queue_length(&self) -> usize {
        self.sync.queue_length()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// RAII guard; releases one hold on drop.
pub struct MutexGuard<'a, T> {
    lock: &'a Mutex<T>,
    /// Guards are thread-bound: the release must come from the
    /// acquiring thread.
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        let _released = self.lock.sync.release(1);
        debug_assert!(_released.is_ok(), "mutex guard dropped by non-owner");
    }
}

/// Condition variable usable through a [`MutexGuard`].
pub struct MutexCondition {
    cond: Condition<MutexOps>,
    sync: Arc<Synchronizer<MutexOps>>,
}

impl MutexCondition {
    fn check_same_mutex<T>(&self, guard: &MutexGuard<'_, T>) -> SyncResult<()> {
        if Arc::ptr_eq(&self.sync, &guard.lock.sync) {
            Ok(())
        } else {
            Err(SyncError::IllegalMonitorState(
                "condition waited on with a foreign mutex guard".to_string(),
            ))
        }
    }

    /// Release the mutex and block until signalled, then reacquire.
    pub fn wait<T>(&self, guard: &mut MutexGuard<'_, T>) -> SyncResult<()> {
        self.check_same_mutex(guard)?;
        self.cond.wait()
    }

    /// As [`wait`](Self::wait) but recording interrupts instead of
    /// raising them.
    pub fn wait_uninterruptibly<T>(&self, guard: &mut MutexGuard<'_, T>) -> SyncResult<()> {
        self.check_same_mutex(guard)?;
        self.cond.wait_uninterruptibly()
    }

    /// Timed wait; returns the remaining budget (≤ 0 on expiry).
    pub fn wait_nanos<T>(&self, guard: &mut MutexGuard<'_, T>, nanos: Nanos) -> SyncResult<Nanos> {
        self.check_same_mutex(guard)?;
        self.cond.wait_nanos(nanos)
    }

    /// Timed wait; `Ok(false)` if the timeout elapsed before a signal.
    pub fn wait_for<T>(&self, guard: &mut MutexGuard<'_, T>, timeout: Duration) -> SyncResult<bool> {
        self.check_same_mutex(guard)?;
        self.cond.wait_for(timeout.as_nanos() as Nanos)
    }

    /// Wake one waiter.
    pub fn signal(&self) -> SyncResult<()> {
        self.cond.signal()
    }

    /// Wake every waiter; they resume in FIFO wait order.
    pub fn signal_all(&self) -> SyncResult<()> {
        self.cond.signal_all()
    }

    pub fn has_waiters(&self) -> SyncResult<bool> {
        self.cond.has_waiters()
    }

    pub fn wait_queue_length(&self) -> SyncResult<usize> {
        self.cond.wait_queue_length()
    }
}
