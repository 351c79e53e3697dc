/*!
 * Sync Queue
 * CLH-variant FIFO with explicit prev links to support cancellation
 *
 * Head and tail are lazily initialized: both stay null until the first
 * contended acquire CAS-installs a dummy head. A node becomes head only
 * by acquiring; head's status is never CANCELLED.
 */

use std::ptr;
use std::sync::Arc;

use crossbeam_epoch::Guard;

use super::atomic_ref::{arc_clone_guarded, untag, AtomicRef};
use super::node::WaitNode;
use super::parker::Parker;

pub(crate) struct SyncQueue {
    pub(crate) head: AtomicRef<WaitNode>,
    pub(crate) tail: AtomicRef<WaitNode>,
}

impl SyncQueue {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicRef::null(),
            tail: AtomicRef::null(),
        }
    }

    #[inline]
    pub(crate) fn head_raw(&self) -> *mut WaitNode {
        self.head.load_raw()
    }

    #[inline]
    pub(crate) fn tail_raw(&self) -> *mut WaitNode {
        self.tail.load_raw()
    }

    /// Insert `node` at the tail, initializing the queue on first
    /// contention. Returns the predecessor.
    ///
    /// The node's `prev` is linked before the tail CAS so a traversal
    /// walking tail-to-head never observes a null `prev` mid-insert.
    pub(crate) fn enq(&self, node: &Arc<WaitNode>, guard: &Guard) -> *mut WaitNode {
        loop {
            let t = self.tail_raw();
            if t.is_null() {
                let dummy = Arc::new(WaitNode::dummy());
                if self
                    .head
                    .compare_exchange(ptr::null_mut(), Some(Arc::clone(&dummy)), guard)
                    .is_ok()
                {
                    // Only the winner of the head CAS writes the tail.
                    self.tail.store(Some(dummy), guard);
                }
            } else {
                let pred = unsafe { arc_clone_guarded(t, guard) };
                node.prev.store(Some(pred), guard);
                if self
                    .tail
                    .compare_exchange(t, Some(Arc::clone(node)), guard)
                    .is_ok()
                {
                    unsafe { &*t }.next.store(Some(Arc::clone(node)), guard);
                    return t;
                }
            }
        }
    }

    /// Install `node` as head after it acquired. Only the acquiring
    /// thread ever runs this for a given node, so no CAS is needed.
    pub(crate) fn set_head(&self, node: &Arc<WaitNode>, guard: &Guard) {
        self.head.store(Some(Arc::clone(node)), guard);
        node.thread.store(None, guard);
        node.prev.store(None, guard);
    }

    /// Wake the thread of `node`'s effective successor, if any.
    ///
    /// Clears a negative status first (best-effort), then takes `next`;
    /// if that is missing or cancelled, walks tail-to-head through
    /// `prev` for the first non-cancelled node past `node`.
    pub(crate) fn unpark_successor(
        &self,
        node: &WaitNode,
        node_raw: *mut WaitNode,
        guard: &Guard,
    ) {
        let ws = node.status();
        if ws < 0 {
            let _ = node.cas_status(ws, 0);
        }

        let next_raw = untag(node.next.load_raw());
        let mut successor: Option<&WaitNode> = unsafe { next_raw.as_ref() };
        if successor.map_or(true, |s| s.is_cancelled()) {
            successor = None;
            let mut t = self.tail_raw();
            while !t.is_null() && t != node_raw {
                let t_ref = unsafe { &*t };
                if t_ref.status() <= 0 {
                    successor = Some(t_ref);
                }
                t = t_ref.prev.load_raw();
            }
        }
        if let Some(s) = successor {
            s.unpark_thread(guard);
        }
    }

    /// Whether `node_raw` is currently reachable tail-to-head.
    pub(crate) fn contains(&self, node_raw: *mut WaitNode, _guard: &Guard) -> bool {
        let mut t = self.tail_raw();
        while !t.is_null() {
            if t == node_raw {
                return true;
            }
            t = unsafe { &*t }.prev.load_raw();
        }
        false
    }

    /// Number of nodes with an attached thread (an estimate under
    /// concurrent mutation).
    pub(crate) fn len(&self, _guard: &Guard) -> usize {
        let mut n = 0;
        let head = self.head_raw();
        let mut t = self.tail_raw();
        while !t.is_null() && t != head {
            let t_ref = unsafe { &*t };
            if !t_ref.thread.is_null() {
                n += 1;
            }
            t = t_ref.prev.load_raw();
        }
        n
    }

    /// The longest-waiting thread's parker, or None if the queue is
    /// empty. Walks from the tail so the answer is exact even while
    /// `next` links lag.
    pub(crate) fn first_queued_parker(&self, guard: &Guard) -> Option<Arc<Parker>> {
        let head = self.head_raw();
        let mut first = None;
        let mut t = self.tail_raw();
        while !t.is_null() && t != head {
            let t_ref = unsafe { &*t };
            if let Some(parker) = t_ref.thread.clone_inner(guard) {
                first = Some(parker);
            }
            t = t_ref.prev.load_raw();
        }
        first
    }

    /// Parkers of queued nodes matching `filter`, tail-to-head order
    /// reversed to FIFO.
    pub(crate) fn collect_parkers<F>(&self, guard: &Guard, filter: F) -> Vec<Arc<Parker>>
    where
        F: Fn(&WaitNode) -> bool,
    {
        let mut out = Vec::new();
        let head = self.head_raw();
        let mut t = self.tail_raw();
        while !t.is_null() && t != head {
            let t_ref = unsafe { &*t };
            if filter(t_ref) {
                if let Some(parker) = t_ref.thread.clone_inner(guard) {
                    out.push(parker);
                }
            }
            t = t_ref.prev.load_raw();
        }
        out.reverse();
        out
    }

    /// Whether the given parker is enqueued.
    pub(crate) fn is_queued(&self, parker: &Parker, guard: &Guard) -> bool {
        let mut t = self.tail_raw();
        while !t.is_null() {
            let t_ref = unsafe { &*t };
            if let Some(p) = t_ref.thread.load(guard) {
                if p.id() == parker.id() {
                    return true;
                }
            }
            t = t_ref.prev.load_raw();
        }
        false
    }
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncQueue")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::node::Mode;
    use super::super::parker;
    use super::*;
    use crossbeam_epoch as epoch;

    #[test]
    fn test_lazy_initialization() {
        let queue = SyncQueue::new();
        assert!(queue.head_raw().is_null());
        assert!(queue.tail_raw().is_null());

        let guard = epoch::pin();
        let node = Arc::new(WaitNode::for_acquire(Mode::Exclusive, parker::current()));
        let pred = queue.enq(&node, &guard);

        // dummy head installed, node behind it
        assert!(!queue.head_raw().is_null());
        assert_eq!(pred, queue.head_raw());
        assert_eq!(queue.tail_raw(), Arc::as_ptr(&node) as *mut WaitNode);
        assert_eq!(queue.len(&guard), 1);
    }

    #[test]
    fn test_fifo_order_and_contains() {
        let queue = SyncQueue::new();
        let guard = epoch::pin();
        let a = Arc::new(WaitNode::for_acquire(Mode::Exclusive, parker::current()));
        let b = Arc::new(WaitNode::for_acquire(Mode::Shared, parker::current()));
        queue.enq(&a, &guard);
        let pred_b = queue.enq(&b, &guard);
        assert_eq!(pred_b, Arc::as_ptr(&a) as *mut WaitNode);
        assert!(queue.contains(Arc::as_ptr(&b) as *mut WaitNode, &guard));
        assert_eq!(queue.len(&guard), 2);
    }

    #[test]
    fn test_set_head_detaches_node() {
        let queue = SyncQueue::new();
        let guard = epoch::pin();
        let node = Arc::new(WaitNode::for_acquire(Mode::Exclusive, parker::current()));
        queue.enq(&node, &guard);
        queue.set_head(&node, &guard);
        assert_eq!(queue.head_raw(), Arc::as_ptr(&node) as *mut WaitNode);
        assert!(node.thread.is_null());
        assert!(node.prev.is_null());
        assert_eq!(queue.len(&guard), 0);
    }
}
