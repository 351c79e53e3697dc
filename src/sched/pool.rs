/*!
 * Worker Pool Plumbing
 * Run-state machine and the worker thread registry
 */

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, warn};
use parking_lot::Mutex as PlMutex;

use crate::sync::parker::{self, Parker};

/// Pool lifecycle states, strictly increasing.
pub(crate) mod run_state {
    /// Accept new tasks and run queued ones.
    pub const RUNNING: i32 = 0;
    /// No new tasks; queued tasks run per policy.
    pub const SHUTDOWN: i32 = 1;
    /// No new tasks, queue drained, workers interrupted.
    pub const STOP: i32 = 2;
    /// All workers gone; about to terminate.
    pub const TIDYING: i32 = 3;
    pub const TERMINATED: i32 = 4;
}

/// One live worker: its parker (interrupt target) and whether it is
/// currently executing a task (idle workers only are interrupted on
/// graceful shutdown).
pub(crate) struct WorkerSlot {
    parker: Arc<Parker>,
    busy: AtomicBool,
}

impl WorkerSlot {
    #[inline]
    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }
}

/// Registry of live workers.
pub(crate) struct WorkerSet {
    slots: PlMutex<Vec<Arc<WorkerSlot>>>,
    /// Incremented at spawn time (before the thread runs) so
    /// `ensure_prestart` cannot overshoot the core size.
    count: AtomicUsize,
    name_prefix: String,
    next_id: AtomicU64,
}

impl WorkerSet {
    pub(crate) fn new(name_prefix: String) -> Self {
        Self {
            slots: PlMutex::new(Vec::new()),
            count: AtomicUsize::new(0),
            name_prefix,
            next_id: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Launch one named worker thread running `body`.
    pub(crate) fn spawn<F>(&self, body: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", self.name_prefix, id);
        self.count.fetch_add(1, Ordering::AcqRel);
        match thread::Builder::new().name(name.clone()).spawn(body) {
            Ok(_) => {
                debug!("spawned worker {name}");
                true
            }
            Err(err) => {
                self.count.fetch_sub(1, Ordering::AcqRel);
                warn!("failed to spawn worker {name}: {err}");
                false
            }
        }
    }

    /// Called by a worker thread on entry; the returned slot is the
    /// worker's interrupt identity.
    pub(crate) fn register(&self) -> Arc<WorkerSlot> {
        let slot = Arc::new(WorkerSlot {
            parker: parker::current(),
            busy: AtomicBool::new(false),
        });
        self.slots.lock().push(Arc::clone(&slot));
        slot
    }

    /// Called by a worker thread on exit.
    pub(crate) fn deregister(&self, slot: &Arc<WorkerSlot>) {
        let mut slots = self.slots.lock();
        slots.retain(|s| !Arc::ptr_eq(s, slot));
        drop(slots);
        self.count.fetch_sub(1, Ordering::AcqRel);
        debug!("worker exited, {} remaining", self.count());
    }

    /// Interrupt workers not currently running a task, waking them to
    /// re-check the run state.
    pub(crate) fn interrupt_idle(&self) {
        for slot in self.slots.lock().iter() {
            if !slot.busy.load(Ordering::Acquire) {
                slot.parker.interrupt();
            }
        }
    }

    /// Interrupt every worker, busy or not (stop path).
    pub(crate) fn interrupt_all(&self) {
        for slot in self.slots.lock().iter() {
            slot.parker.interrupt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_spawn_and_register() {
        let set = Arc::new(WorkerSet::new("test-worker".to_string()));
        let (tx, rx) = mpsc::channel();
        let set_clone = Arc::clone(&set);
        assert!(set.spawn(move || {
            let slot = set_clone.register();
            tx.send(thread::current().name().map(String::from)).unwrap();
            set_clone.deregister(&slot);
        }));
        assert_eq!(set.count(), 1);
        let name = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(name.as_deref(), Some("test-worker-0"));
        while set.count() != 0 {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_interrupt_idle_skips_busy() {
        let set = WorkerSet::new("busy-worker".to_string());
        let slot = set.register();
        slot.set_busy(true);
        set.interrupt_idle();
        assert!(!parker::current().is_interrupted());
        set.interrupt_all();
        assert!(parker::current().take_interrupted());
        drop(slot);
        // consume the permit interrupt_all banked on this thread
        thread::park_timeout(Duration::from_millis(1));
    }
}
