/*!
 * Wait Node
 * Intrusive queue node: parked thread handle plus wait-status word
 */

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crossbeam_epoch::Guard;

use super::atomic_ref::AtomicRef;
use super::parker::Parker;

/// Wait-status values. Zero is the initial state.
pub(crate) mod wait_status {
    /// Successor's thread needs unparking on release or cancel.
    pub const SIGNAL: i32 = -1;
    /// Terminal: the node abandoned acquisition.
    pub const CANCELLED: i32 = 1;
    /// Parked on a condition sub-queue, not the sync queue.
    pub const CONDITION: i32 = -2;
    /// A shared release must propagate even without an obvious successor.
    pub const PROPAGATE: i32 = -3;
}

/// Acquisition mode a node was enqueued in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Exclusive,
    Shared,
}

/// One entry in the sync queue (or a condition sub-queue).
///
/// `prev` links are valid for traversal at every instant; `next` links
/// may lag and are reconstructed by walking `prev` from tail. A
/// cancelled node's `next` is pointed at itself (tagged, uncounted) to
/// mark an ex-queue member.
pub(crate) struct WaitNode {
    pub(crate) mode: Mode,
    pub(crate) wait_status: AtomicI32,
    pub(crate) prev: AtomicRef<WaitNode>,
    pub(crate) next: AtomicRef<WaitNode>,
    pub(crate) thread: AtomicRef<Parker>,
    /// Link in a condition sub-queue; mutated only while the owner
    /// holds the synchronizer exclusively.
    pub(crate) next_waiter: AtomicRef<WaitNode>,
}

impl WaitNode {
    /// Dummy head installed on first contention.
    pub(crate) fn dummy() -> Self {
        Self {
            mode: Mode::Exclusive,
            wait_status: AtomicI32::new(0),
            prev: AtomicRef::null(),
            next: AtomicRef::null(),
            thread: AtomicRef::null(),
            next_waiter: AtomicRef::null(),
        }
    }

    /// Node for a failed-fast-path acquire.
    pub(crate) fn for_acquire(mode: Mode, parker: Arc<Parker>) -> Self {
        Self {
            mode,
            wait_status: AtomicI32::new(0),
            prev: AtomicRef::null(),
            next: AtomicRef::null(),
            thread: AtomicRef::new(parker),
            next_waiter: AtomicRef::null(),
        }
    }

    /// Node parked on a condition sub-queue.
    pub(crate) fn for_condition(parker: Arc<Parker>) -> Self {
        Self {
            mode: Mode::Exclusive,
            wait_status: AtomicI32::new(wait_status::CONDITION),
            prev: AtomicRef::null(),
            next: AtomicRef::null(),
            thread: AtomicRef::new(parker),
            next_waiter: AtomicRef::null(),
        }
    }

    #[inline]
    pub(crate) fn status(&self) -> i32 {
        self.wait_status.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_status(&self, status: i32) {
        self.wait_status.store(status, Ordering::Release);
    }

    #[inline]
    pub(crate) fn cas_status(&self, expect: i32, update: i32) -> bool {
        self.wait_status
            .compare_exchange(expect, update, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    #[inline]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.status() > 0
    }

    #[inline]
    pub(crate) fn is_shared(&self) -> bool {
        self.mode == Mode::Shared
    }

    /// Wake this node's thread if one is still attached.
    pub(crate) fn unpark_thread(&self, guard: &Guard) {
        if let Some(parker) = self.thread.load(guard) {
            parker.unpark();
        }
    }
}

impl std::fmt::Debug for WaitNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitNode")
            .field("mode", &self.mode)
            .field("wait_status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let node = WaitNode::dummy();
        assert_eq!(node.status(), 0);
        assert!(node.cas_status(0, wait_status::SIGNAL));
        assert!(!node.cas_status(0, wait_status::PROPAGATE));
        node.set_status(wait_status::CANCELLED);
        assert!(node.is_cancelled());
    }

    #[test]
    fn test_condition_node_initial_status() {
        let node = WaitNode::for_condition(super::super::parker::current());
        assert_eq!(node.status(), wait_status::CONDITION);
        assert!(!node.is_shared());
    }
}
