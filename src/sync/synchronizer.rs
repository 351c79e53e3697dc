/*!
 * Synchronizer
 * Acquire/release engine over a state word and the sync queue
 *
 * State interpretation is supplied through [`SyncOps`]; the engine owns
 * queueing, parking, cancellation and wake-up propagation. Exclusive
 * and shared modes each come in uninterruptible, interruptible and
 * timed variants.
 *
 * # Ordering
 *
 * State transitions CAS with sequential consistency (they are the
 * linearization points); queue links use release stores and acquire
 * loads, which suffices because every link is republished through the
 * state word before it matters to a third thread.
 */

use std::sync::Arc;
use std::thread::Thread;
use std::time::Instant;

use crossbeam_epoch::{self as epoch, Guard};
use log::trace;

use crate::core::{Nanos, SyncError, SyncResult};

use super::atomic_ref::{arc_clone_guarded, untag};
use super::condition::Condition;
use super::node::{wait_status, Mode, WaitNode};
use super::parker::{self, Parker};
use super::queue::SyncQueue;
use super::state::StateWord;

/// Remaining-budget threshold below which timed acquires busy-retry
/// instead of parking; a timed park costs more than the wait itself.
pub(crate) const SPIN_FOR_TIMEOUT_THRESHOLD: Nanos = 1_000;

/// State interpretation hooks.
///
/// Implementations attach meaning to the state word (hold count,
/// permits, open/closed) and receive the owning synchronizer so they
/// can consult the state word and queue inspection methods. Every hook
/// defaults to unsupported; an interpreter overrides the subset its
/// mode needs. A hook that returns an error aborts the in-flight
/// operation; the engine cleans any enqueued node before propagating.
pub trait SyncOps: Send + Sync + Sized + 'static {
    fn try_acquire(&self, _sync: &Synchronizer<Self>, _arg: i32) -> SyncResult<bool> {
        Err(SyncError::unsupported("try_acquire"))
    }

    fn try_release(&self, _sync: &Synchronizer<Self>, _arg: i32) -> SyncResult<bool> {
        Err(SyncError::unsupported("try_release"))
    }

    /// Negative = failure; zero = success without propagation;
    /// positive = success and subsequent shared acquires may also
    /// succeed.
    fn try_acquire_shared(&self, _sync: &Synchronizer<Self>, _arg: i32) -> SyncResult<i32> {
        Err(SyncError::unsupported("try_acquire_shared"))
    }

    fn try_release_shared(&self, _sync: &Synchronizer<Self>, _arg: i32) -> SyncResult<bool> {
        Err(SyncError::unsupported("try_release_shared"))
    }

    fn is_held_exclusively(&self, _sync: &Synchronizer<Self>) -> bool {
        false
    }
}

/// Blocking acquire/release engine.
pub struct Synchronizer<O: SyncOps> {
    state: StateWord,
    queue: SyncQueue,
    ops: O,
}

impl<O: SyncOps> Synchronizer<O> {
    pub fn new(ops: O, initial_state: i32) -> Self {
        Self {
            state: StateWord::new(initial_state),
            queue: SyncQueue::new(),
            ops,
        }
    }

    /// The shared state word.
    #[inline]
    pub fn state(&self) -> &StateWord {
        &self.state
    }

    /// The state interpreter.
    #[inline]
    pub fn ops(&self) -> &O {
        &self.ops
    }

    /// Create a condition sub-queue bound to this synchronizer.
    pub fn new_condition(self: &Arc<Self>) -> Condition<O> {
        Condition::new(Arc::clone(self))
    }

    // ---------------------------------------------------------------
    // Exclusive mode
    // ---------------------------------------------------------------

    /// Acquire exclusively, ignoring interrupts. An interrupt observed
    /// while parked is re-asserted on the calling thread before
    /// returning.
    pub fn acquire(&self, arg: i32) -> SyncResult<()> {
        if self.ops.try_acquire(self, arg)? {
            return Ok(());
        }
        let node = self.add_waiter(Mode::Exclusive);
        if self.acquire_queued(&node, arg)? {
            parker::current().set_interrupted();
        }
        Ok(())
    }

    /// Acquire exclusively; an interrupt aborts with
    /// [`SyncError::Interrupted`].
    pub fn acquire_interruptibly(&self, arg: i32) -> SyncResult<()> {
        if parker::current().take_interrupted() {
            return Err(SyncError::Interrupted);
        }
        if self.ops.try_acquire(self, arg)? {
            return Ok(());
        }
        self.do_acquire_interruptibly(arg)
    }

    /// Acquire exclusively within `nanos`. Returns `Ok(false)` on
    /// deadline; interruptible.
    pub fn try_acquire_nanos(&self, arg: i32, nanos: Nanos) -> SyncResult<bool> {
        if parker::current().take_interrupted() {
            return Err(SyncError::Interrupted);
        }
        if self.ops.try_acquire(self, arg)? {
            return Ok(true);
        }
        self.do_acquire_nanos(arg, nanos)
    }

    /// Release exclusively. Wakes the head's successor when one is
    /// waiting for a signal.
    pub fn release(&self, arg: i32) -> SyncResult<bool> {
        if self.ops.try_release(self, arg)? {
            let guard = epoch::pin();
            let h_raw = self.queue.head_raw();
            if let Some(h) = unsafe { h_raw.as_ref() } {
                if h.status() != 0 {
                    self.queue.unpark_successor(h, h_raw, &guard);
                }
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // ---------------------------------------------------------------
    // Shared mode
    // ---------------------------------------------------------------

    /// Acquire in shared mode, ignoring interrupts.
    pub fn acquire_shared(&self, arg: i32) -> SyncResult<()> {
        if self.ops.try_acquire_shared(self, arg)? < 0 {
            if self.do_acquire_shared(arg)? {
                parker::current().set_interrupted();
            }
        }
        Ok(())
    }

    /// Acquire in shared mode; an interrupt aborts with
    /// [`SyncError::Interrupted`].
    pub fn acquire_shared_interruptibly(&self, arg: i32) -> SyncResult<()> {
        if parker::current().take_interrupted() {
            return Err(SyncError::Interrupted);
        }
        if self.ops.try_acquire_shared(self, arg)? < 0 {
            self.do_acquire_shared_interruptibly(arg)?;
        }
        Ok(())
    }

    /// Acquire in shared mode within `nanos`. Returns `Ok(false)` on
    /// deadline; interruptible.
    pub fn try_acquire_shared_nanos(&self, arg: i32, nanos: Nanos) -> SyncResult<bool> {
        if parker::current().take_interrupted() {
            return Err(SyncError::Interrupted);
        }
        if self.ops.try_acquire_shared(self, arg)? >= 0 {
            return Ok(true);
        }
        self.do_acquire_shared_nanos(arg, nanos)
    }

    /// Release in shared mode, propagating wake-ups down the queue.
    pub fn release_shared(&self, arg: i32) -> SyncResult<bool> {
        if self.ops.try_release_shared(self, arg)? {
            self.do_release_shared();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // ---------------------------------------------------------------
    // Queued acquire loops
    // ---------------------------------------------------------------

    fn add_waiter(&self, mode: Mode) -> Arc<WaitNode> {
        let node = Arc::new(WaitNode::for_acquire(mode, parker::current()));
        let guard = epoch::pin();
        self.queue.enq(&node, &guard);
        node
    }

    /// Uninterruptible acquire loop for an already-enqueued node.
    /// Returns whether an interrupt was observed while waiting.
    ///
    /// Also the reacquire path for condition waiters, which is why the
    /// node is supplied by the caller.
    pub(crate) fn acquire_queued(&self, node: &Arc<WaitNode>, arg: i32) -> SyncResult<bool> {
        let me = parker::current();
        let mut interrupted = false;
        loop {
            let guard = epoch::pin();
            let p_raw = node.prev.load_raw();
            let p = unsafe { &*p_raw };
            if p_raw == self.queue.head_raw() {
                match self.ops.try_acquire(self, arg) {
                    Ok(true) => {
                        self.queue.set_head(node, &guard);
                        p.next.store(None, &guard);
                        return Ok(interrupted);
                    }
                    Ok(false) => {}
                    Err(err) => {
                        drop(guard);
                        self.cancel_acquire(node);
                        return Err(err);
                    }
                }
            }
            let should_park = self.should_park_after_failed_acquire(p_raw, node, &guard);
            drop(guard);
            if should_park {
                parker::park();
                if me.take_interrupted() {
                    interrupted = true;
                }
            }
        }
    }

    fn do_acquire_interruptibly(&self, arg: i32) -> SyncResult<()> {
        let node = self.add_waiter(Mode::Exclusive);
        let me = parker::current();
        loop {
            let guard = epoch::pin();
            let p_raw = node.prev.load_raw();
            let p = unsafe { &*p_raw };
            if p_raw == self.queue.head_raw() {
                match self.ops.try_acquire(self, arg) {
                    Ok(true) => {
                        self.queue.set_head(&node, &guard);
                        p.next.store(None, &guard);
                        return Ok(());
                    }
                    Ok(false) => {}
                    Err(err) => {
                        drop(guard);
                        self.cancel_acquire(&node);
                        return Err(err);
                    }
                }
            }
            let should_park = self.should_park_after_failed_acquire(p_raw, &node, &guard);
            drop(guard);
            if should_park {
                parker::park();
                if me.take_interrupted() {
                    self.cancel_acquire(&node);
                    return Err(SyncError::Interrupted);
                }
            }
        }
    }

    fn do_acquire_nanos(&self, arg: i32, nanos: Nanos) -> SyncResult<bool> {
        if nanos <= 0 {
            return Ok(false);
        }
        let start = Instant::now();
        let node = self.add_waiter(Mode::Exclusive);
        let me = parker::current();
        loop {
            let guard = epoch::pin();
            let p_raw = node.prev.load_raw();
            let p = unsafe { &*p_raw };
            if p_raw == self.queue.head_raw() {
                match self.ops.try_acquire(self, arg) {
                    Ok(true) => {
                        self.queue.set_head(&node, &guard);
                        p.next.store(None, &guard);
                        return Ok(true);
                    }
                    Ok(false) => {}
                    Err(err) => {
                        drop(guard);
                        self.cancel_acquire(&node);
                        return Err(err);
                    }
                }
            }
            let remaining = nanos - elapsed_nanos(start);
            if remaining <= 0 {
                drop(guard);
                self.cancel_acquire(&node);
                return Ok(false);
            }
            let should_park = self.should_park_after_failed_acquire(p_raw, &node, &guard);
            drop(guard);
            if should_park && remaining > SPIN_FOR_TIMEOUT_THRESHOLD {
                parker::park_nanos(remaining);
            }
            if me.take_interrupted() {
                self.cancel_acquire(&node);
                return Err(SyncError::Interrupted);
            }
        }
    }

    fn do_acquire_shared(&self, arg: i32) -> SyncResult<bool> {
        let node = self.add_waiter(Mode::Shared);
        let me = parker::current();
        let mut interrupted = false;
        loop {
            let guard = epoch::pin();
            let p_raw = node.prev.load_raw();
            let p = unsafe { &*p_raw };
            if p_raw == self.queue.head_raw() {
                match self.ops.try_acquire_shared(self, arg) {
                    Ok(r) if r >= 0 => {
                        self.set_head_and_propagate(&node, r, &guard);
                        p.next.store(None, &guard);
                        return Ok(interrupted);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        drop(guard);
                        self.cancel_acquire(&node);
                        return Err(err);
                    }
                }
            }
            let should_park = self.should_park_after_failed_acquire(p_raw, &node, &guard);
            drop(guard);
            if should_park {
                parker::park();
                if me.take_interrupted() {
                    interrupted = true;
                }
            }
        }
    }

    fn do_acquire_shared_interruptibly(&self, arg: i32) -> SyncResult<()> {
        let node = self.add_waiter(Mode::Shared);
        let me = parker::current();
        loop {
            let guard = epoch::pin();
            let p_raw = node.prev.load_raw();
            let p = unsafe { &*p_raw };
            if p_raw == self.queue.head_raw() {
                match self.ops.try_acquire_shared(self, arg) {
                    Ok(r) if r >= 0 => {
                        self.set_head_and_propagate(&node, r, &guard);
                        p.next.store(None, &guard);
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(err) => {
                        drop(guard);
                        self.cancel_acquire(&node);
                        return Err(err);
                    }
                }
            }
            let should_park = self.should_park_after_failed_acquire(p_raw, &node, &guard);
            drop(guard);
            if should_park {
                parker::park();
                if me.take_interrupted() {
                    self.cancel_acquire(&node);
                    return Err(SyncError::Interrupted);
                }
            }
        }
    }

    fn do_acquire_shared_nanos(&self, arg: i32, nanos: Nanos) -> SyncResult<bool> {
        if nanos <= 0 {
            return Ok(false);
        }
        let start = Instant::now();
        let node = self.add_waiter(Mode::Shared);
        let me = parker::current();
        loop {
            let guard = epoch::pin();
            let p_raw = node.prev.load_raw();
            let p = unsafe { &*p_raw };
            if p_raw == self.queue.head_raw() {
                match self.ops.try_acquire_shared(self, arg) {
                    Ok(r) if r >= 0 => {
                        self.set_head_and_propagate(&node, r, &guard);
                        p.next.store(None, &guard);
                        return Ok(true);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        drop(guard);
                        self.cancel_acquire(&node);
                        return Err(err);
                    }
                }
            }
            let remaining = nanos - elapsed_nanos(start);
            if remaining <= 0 {
                drop(guard);
                self.cancel_acquire(&node);
                return Ok(false);
            }
            let should_park = self.should_park_after_failed_acquire(p_raw, &node, &guard);
            drop(guard);
            if should_park && remaining > SPIN_FOR_TIMEOUT_THRESHOLD {
                parker::park_nanos(remaining);
            }
            if me.take_interrupted() {
                self.cancel_acquire(&node);
                return Err(SyncError::Interrupted);
            }
        }
    }

    // ---------------------------------------------------------------
    // Wake-up plumbing
    // ---------------------------------------------------------------

    /// Park only when the predecessor has promised a signal. A
    /// cancelled predecessor is spliced past; any other status is
    /// CAS'd toward SIGNAL and the caller retries before parking.
    fn should_park_after_failed_acquire(
        &self,
        pred_raw: *mut WaitNode,
        node: &Arc<WaitNode>,
        guard: &Guard,
    ) -> bool {
        let pred = unsafe { &*pred_raw };
        let ws = pred.status();
        if ws == wait_status::SIGNAL {
            return true;
        }
        if ws > 0 {
            let mut p_raw = pred_raw;
            loop {
                p_raw = unsafe { &*p_raw }.prev.load_raw();
                let p = unsafe { arc_clone_guarded(p_raw, guard) };
                node.prev.store(Some(Arc::clone(&p)), guard);
                if !p.is_cancelled() {
                    p.next.store(Some(Arc::clone(node)), guard);
                    break;
                }
            }
        } else {
            let _ = pred.cas_status(ws, wait_status::SIGNAL);
        }
        false
    }

    /// Install the new head after a shared acquire and keep the
    /// release wave moving when propagation may be required.
    fn set_head_and_propagate(&self, node: &Arc<WaitNode>, propagate: i32, guard: &Guard) {
        let old_head_raw = self.queue.head_raw();
        self.queue.set_head(node, guard);

        // Conservative propagation check: a positive count, or either
        // head recorded (or lost) a waiter-status, keeps the wave going.
        let mut must_propagate = propagate > 0;
        if !must_propagate {
            must_propagate = unsafe { old_head_raw.as_ref() }.map_or(true, |h| h.status() < 0);
        }
        if !must_propagate {
            let new_head_raw = self.queue.head_raw();
            must_propagate = unsafe { new_head_raw.as_ref() }.map_or(true, |h| h.status() < 0);
        }
        if must_propagate {
            let s_raw = untag(node.next.load_raw());
            match unsafe { s_raw.as_ref() } {
                None => self.do_release_shared(),
                Some(s) if s.is_shared() => self.do_release_shared(),
                Some(_) => {}
            }
        }
    }

    /// Signal-or-mark loop for shared releases. Exits when the head is
    /// stable across an iteration; a PROPAGATE left on the head is
    /// picked up by the next `set_head_and_propagate`.
    pub(crate) fn do_release_shared(&self) {
        let guard = epoch::pin();
        loop {
            let h_raw = self.queue.head_raw();
            if !h_raw.is_null() && h_raw != self.queue.tail_raw() {
                let h = unsafe { &*h_raw };
                let ws = h.status();
                if ws == wait_status::SIGNAL {
                    if !h.cas_status(wait_status::SIGNAL, 0) {
                        continue;
                    }
                    self.queue.unpark_successor(h, h_raw, &guard);
                } else if ws == 0 && !h.cas_status(0, wait_status::PROPAGATE) {
                    continue;
                }
            }
            if h_raw == self.queue.head_raw() {
                break;
            }
        }
    }

    // ---------------------------------------------------------------
    // Cancellation
    // ---------------------------------------------------------------

    /// Abandon an in-queue acquire after a timeout, interrupt or hook
    /// error. Link repair is best-effort; anything missed here is
    /// finished by later acquirers splicing past cancelled nodes.
    pub(crate) fn cancel_acquire(&self, node: &Arc<WaitNode>) {
        let guard = epoch::pin();
        let node_raw = Arc::as_ptr(node) as *mut WaitNode;
        node.thread.store(None, &guard);

        let mut pred_raw = node.prev.load_raw();
        loop {
            let pred = unsafe { &*pred_raw };
            if !pred.is_cancelled() {
                break;
            }
            let prev_raw = pred.prev.load_raw();
            let prev = unsafe { arc_clone_guarded(prev_raw, &guard) };
            node.prev.store(Some(prev), &guard);
            pred_raw = prev_raw;
        }
        let pred = unsafe { &*pred_raw };
        let pred_next_raw = pred.next.load_raw();

        node.set_status(wait_status::CANCELLED);
        trace!("acquire cancelled, repairing queue links");

        let pred_arc = unsafe { arc_clone_guarded(pred_raw, &guard) };
        if node_raw == self.queue.tail_raw()
            && self
                .queue
                .tail
                .compare_exchange(node_raw, Some(pred_arc), &guard)
                .is_ok()
        {
            let _ = pred.next.compare_exchange(pred_next_raw, None, &guard);
        } else {
            let unlink = if pred_raw != self.queue.head_raw() {
                let ws = pred.status();
                let signal_ready = ws == wait_status::SIGNAL
                    || (ws <= 0 && pred.cas_status(ws, wait_status::SIGNAL));
                signal_ready && !pred.thread.is_null()
            } else {
                false
            };
            if unlink {
                let next_raw = untag(node.next.load_raw());
                if let Some(next) = unsafe { next_raw.as_ref() } {
                    if next.status() <= 0 {
                        let next_arc = unsafe { arc_clone_guarded(next_raw, &guard) };
                        let _ = pred.next.compare_exchange(pred_next_raw, Some(next_arc), &guard);
                    }
                }
            } else {
                self.queue.unpark_successor(node, node_raw, &guard);
            }
            node.next.store_sentinel(node_raw, &guard);
        }
    }

    // ---------------------------------------------------------------
    // Condition plumbing
    // ---------------------------------------------------------------

    /// Whether a (former condition) node has made it to the sync queue.
    pub(crate) fn is_on_sync_queue(&self, node: &Arc<WaitNode>) -> bool {
        if node.status() == wait_status::CONDITION || node.prev.is_null() {
            return false;
        }
        if !node.next.is_null() {
            return true;
        }
        let guard = epoch::pin();
        self.queue
            .contains(Arc::as_ptr(node) as *mut WaitNode, &guard)
    }

    /// Move a condition waiter to the sync queue after a signal.
    /// Returns false if the waiter already cancelled its wait.
    pub(crate) fn transfer_for_signal(&self, node: &Arc<WaitNode>) -> bool {
        if !node.cas_status(wait_status::CONDITION, 0) {
            return false;
        }
        let guard = epoch::pin();
        let pred_raw = self.queue.enq(node, &guard);
        let pred = unsafe { &*pred_raw };
        let ws = pred.status();
        if ws > 0 || !pred.cas_status(ws, wait_status::SIGNAL) {
            // Predecessor cancelled or refused the signal duty; let
            // the transferred waiter resynchronize on its own.
            node.unpark_thread(&guard);
        }
        true
    }

    /// After a timed-out or interrupted condition wait, move the node
    /// to the sync queue ourselves. Returns true if this call did the
    /// transfer, false if a signal beat it (in which case we spin
    /// until the signaller finishes the enqueue).
    pub(crate) fn transfer_after_cancelled_wait(&self, node: &Arc<WaitNode>) -> bool {
        if node.cas_status(wait_status::CONDITION, 0) {
            let guard = epoch::pin();
            self.queue.enq(node, &guard);
            return true;
        }
        while !self.is_on_sync_queue(node) {
            std::thread::yield_now();
        }
        false
    }

    /// Release the full held state for a condition wait, returning the
    /// saved value for reacquisition. Failure cancels the waiter.
    pub(crate) fn fully_release(&self, node: &Arc<WaitNode>) -> SyncResult<i32> {
        let saved = self.state.get();
        match self.release(saved) {
            Ok(true) => Ok(saved),
            Ok(false) => {
                node.set_status(wait_status::CANCELLED);
                Err(SyncError::IllegalMonitorState(
                    "release failed during condition wait".to_string(),
                ))
            }
            Err(err) => {
                node.set_status(wait_status::CANCELLED);
                Err(err)
            }
        }
    }

    // ---------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------

    /// Whether any thread is queued waiting to acquire. O(1); may race
    /// with concurrent cancellation.
    pub fn has_queued_threads(&self) -> bool {
        self.queue.head_raw() != self.queue.tail_raw()
    }

    /// Whether any acquire has ever contended (the queue was
    /// initialized).
    pub fn has_contended(&self) -> bool {
        !self.queue.head_raw().is_null()
    }

    /// Whether a thread queued before the caller is waiting to
    /// acquire. The basis of fair-mode interpreters.
    pub fn has_queued_predecessors(&self) -> bool {
        let guard = epoch::pin();
        let h_raw = self.queue.head_raw();
        if h_raw == self.queue.tail_raw() {
            return false;
        }
        let h = unsafe { &*h_raw };
        let s_raw = untag(h.next.load_raw());
        match unsafe { s_raw.as_ref() } {
            None => true,
            Some(s) => match s.thread.load(&guard) {
                None => true,
                Some(p) => p.id() != parker::current().id(),
            },
        }
    }

    /// The longest-waiting queued thread, if any.
    pub fn first_queued_thread(&self) -> Option<Thread> {
        let guard = epoch::pin();
        self.queue
            .first_queued_parker(&guard)
            .map(|p| p.thread().clone())
    }

    /// Estimate of the number of queued threads.
    pub fn queue_length(&self) -> usize {
        let guard = epoch::pin();
        self.queue.len(&guard)
    }

    /// Whether the given parker is currently queued.
    pub fn is_queued(&self, parker: &Parker) -> bool {
        let guard = epoch::pin();
        self.queue.is_queued(parker, &guard)
    }

    /// Snapshot of queued threads, FIFO order.
    pub fn queued_threads(&self) -> Vec<Thread> {
        let guard = epoch::pin();
        self.queue
            .collect_parkers(&guard, |_| true)
            .into_iter()
            .map(|p| p.thread().clone())
            .collect()
    }

    /// Snapshot of threads queued in exclusive mode.
    pub fn exclusive_queued_threads(&self) -> Vec<Thread> {
        let guard = epoch::pin();
        self.queue
            .collect_parkers(&guard, |n| !n.is_shared())
            .into_iter()
            .map(|p| p.thread().clone())
            .collect()
    }

    /// Snapshot of threads queued in shared mode.
    pub fn shared_queued_threads(&self) -> Vec<Thread> {
        let guard = epoch::pin();
        self.queue
            .collect_parkers(&guard, |n| n.is_shared())
            .into_iter()
            .map(|p| p.thread().clone())
            .collect()
    }
}

impl<O: SyncOps> std::fmt::Debug for Synchronizer<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("state", &self.state.get())
            .field("has_queued_threads", &self.has_queued_threads())
            .finish()
    }
}

#[inline]
fn elapsed_nanos(start: Instant) -> Nanos {
    start.elapsed().as_nanos() as Nanos
}
