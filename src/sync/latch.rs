/*!
 * Latch
 * One-shot shared-mode gate; open releases every waiter at once
 */

use std::sync::Arc;
use std::time::Duration;

use crate::core::{Nanos, SyncResult};

use super::synchronizer::{SyncOps, Synchronizer};

pub struct LatchOps;

impl SyncOps for LatchOps {
    fn try_acquire_shared(&self, sync: &Synchronizer<Self>, _arg: i32) -> SyncResult<i32> {
        Ok(if sync.state().get() != 0 { 1 } else { -1 })
    }

    fn try_release_shared(&self, sync: &Synchronizer<Self>, _arg: i32) -> SyncResult<bool> {
        sync.state().set(1);
        Ok(true)
    }
}

/// One-shot gate. Closed at construction; `open` is idempotent and
/// propagates through the whole wait queue.
pub struct Latch {
    sync: Arc<Synchronizer<LatchOps>>,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            sync: Arc::new(Synchronizer::new(LatchOps, 0)),
        }
    }

    /// Block until opened; an interrupt aborts the wait.
    pub fn wait(&self) -> SyncResult<()> {
        self.sync.acquire_shared_interruptibly(1)
    }

    /// Block until opened or the timeout elapses (`Ok(false)`).
    pub fn wait_for(&self, timeout: Duration) -> SyncResult<bool> {
        self.sync
            .try_acquire_shared_nanos(1, timeout.as_nanos() as Nanos)
    }

    /// Open the gate, waking every waiter.
    pub fn open(&self) {
        let _released = self.sync.release_shared(1);
        debug_assert!(_released.is_ok());
    }

    pub fn is_open(&self) -> bool {
        self.sync.state().get() != 0
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch").field("open", &self.is_open()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_open_releases_waiters() {
        let latch = Arc::new(Latch::new());
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || latch.wait())
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        assert!(!latch.is_open());
        latch.open();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
    }

    #[test]
    fn test_wait_after_open_is_immediate() {
        let latch = Latch::new();
        latch.open();
        assert!(latch.is_open());
        assert!(latch.wait().is_ok());
        assert_eq!(latch.wait_for(Duration::ZERO), Ok(true));
    }

    #[test]
    fn test_wait_for_times_out() {
        let latch = Latch::new();
        assert_eq!(latch.wait_for(Duration::from_millis(30)), Ok(false));
    }
}
