/*!
 * Semaphore
 * Shared-mode counting permits on the synchronizer framework
 *
 * State word = available permits. The fair variant defers to queued
 * predecessors so permits hand out in FIFO arrival order.
 */

use std::sync::Arc;
use std::time::Duration;

use crate::core::{Nanos, SyncError, SyncResult};

use super::synchronizer::{SyncOps, Synchronizer};

pub struct SemaphoreOps {
    fair: bool,
}

impl SemaphoreOps {
    fn nonfair_try_acquire(&self, sync: &Synchronizer<Self>, permits: i32) -> i32 {
        loop {
            let available = sync.state().get();
            let remaining = available - permits;
            if remaining < 0 || sync.state().compare_and_set(available, remaining) {
                return remaining;
            }
        }
    }
}

impl SyncOps for SemaphoreOps {
    fn try_acquire_shared(&self, sync: &Synchronizer<Self>, permits: i32) -> SyncResult<i32> {
        if self.fair {
            loop {
                if sync.has_queued_predecessors() {
                    return Ok(-1);
                }
                let available = sync.state().get();
                let remaining = available - permits;
                if remaining < 0 || sync.state().compare_and_set(available, remaining) {
                    return Ok(remaining);
                }
            }
        } else {
            Ok(self.nonfair_try_acquire(sync, permits))
        }
    }

    fn try_release_shared(&self, sync: &Synchronizer<Self>, permits: i32) -> SyncResult<bool> {
        loop {
            let current = sync.state().get();
            let next = current.checked_add(permits).ok_or_else(|| {
                SyncError::IllegalMonitorState("maximum permit count exceeded".to_string())
            })?;
            if sync.state().compare_and_set(current, next) {
                return Ok(true);
            }
        }
    }
}

/// Counting semaphore.
pub struct Semaphore {
    sync: Arc<Synchronizer<SemaphoreOps>>,
}

impl Semaphore {
    /// Unfair semaphore with the given number of permits.
    pub fn new(permits: i32) -> Self {
        Self {
            sync: Arc::new(Synchronizer::new(SemaphoreOps { fair: false }, permits)),
        }
    }

    /// FIFO-fair semaphore with the given number of permits.
    pub fn new_fair(permits: i32) -> Self {
        Self {
            sync: Arc::new(Synchronizer::new(SemaphoreOps { fair: true }, permits)),
        }
    }

    /// Take `permits`, blocking uninterruptibly until available.
    pub fn acquire(&self, permits: i32) {
        assert!(permits >= 0, "negative permit count");
        // Semaphore hooks are infallible; only overflow on release can
        // surface an error.
        let _acquired = self.sync.acquire_shared(permits);
        debug_assert!(_acquired.is_ok());
    }

    /// Take `permits` unless interrupted first.
    pub fn acquire_interruptibly(&self, permits: i32) -> SyncResult<()> {
        assert!(permits >= 0, "negative permit count");
        self.sync.acquire_shared_interruptibly(permits)
    }

    /// Take `permits` only if immediately available.
    pub fn try_acquire(&self, permits: i32) -> bool {
        assert!(permits >= 0, "negative permit count");
        self.sync
            .ops()
            .nonfair_try_acquire(&self.sync, permits)
            >= 0
    }

    /// Take `permits` within the timeout; `Ok(false)` on expiry.
    pub fn try_acquire_for(&self, permits: i32, timeout: Duration) -> SyncResult<bool> {
        assert!(permits >= 0, "negative permit count");
        self.sync
            .try_acquire_shared_nanos(permits, timeout.as_nanos() as Nanos)
    }

    /// Return `permits`, waking queued acquirers.
    pub fn release(&self, permits: i32) {
        assert!(permits >= 0, "negative permit count");
        let _released = self.sync.release_shared(permits);
        debug_assert!(_released.is_ok(), "semaphore permit count overflow");
    }

    /// Take every available permit, returning how many were taken.
    pub fn drain_permits(&self) -> i32 {
        loop {
            let current = self.sync.state().get();
            if current == 0 || self.sync.state().compare_and_set(current, 0) {
                return current;
            }
        }
    }

    pub fn available_permits(&self) -> i32 {
        self.sync.state().get()
    }

    pub fn has_queued_threads(&self) -> bool {
        self.sync.has_queued_threads()
    }

    pub fn queue_length(&self) -> usize {
        self.sync.queue_length()
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("permits", &self.available_permits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_acquire_release() {
        let sem = Semaphore::new(2);
        sem.acquire(1);
        sem.acquire(1);
        assert_eq!(sem.available_permits(), 0);
        assert!(!sem.try_acquire(1));
        sem.release(2);
        assert_eq!(sem.available_permits(), 2);
    }

    #[test]
    fn test_blocking_acquire_wakes() {
        let sem = Arc::new(Semaphore::new(0));
        let sem_clone = Arc::clone(&sem);
        let handle = thread::spawn(move || {
            sem_clone.acquire(1);
            true
        });
        thread::sleep(Duration::from_millis(50));
        sem.release(1);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_timed_acquire_expires() {
        let sem = Semaphore::new(0);
        let result = sem.try_acquire_for(1, Duration::from_millis(30));
        assert_eq!(result, Ok(false));
    }

    #[test]
    fn test_drain_permits() {
        let sem = Semaphore::new(5);
        assert_eq!(sem.drain_permits(), 5);
        assert_eq!(sem.available_permits(), 0);
    }

    #[test]
    fn test_multi_permit_release_wakes_all() {
        let sem = Arc::new(Semaphore::new(0));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let sem = Arc::clone(&sem);
                thread::spawn(move || sem.acquire(1))
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        sem.release(3);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sem.available_permits(), 0);
    }
}
