/*!
 * Condition Sub-Queues
 *
 * A condition is a singly-linked chain of CONDITION-status nodes
 * hanging off a synchronizer. Waiters fully release the held state,
 * park until transferred to the sync queue by a signal (or by their
 * own timeout/interrupt), then reacquire at the saved state. Every
 * operation requires the caller to hold the synchronizer exclusively.
 */

use std::sync::Arc;
use std::time::Instant;

use crossbeam_epoch::{self as epoch, Guard};

use crate::core::{Nanos, SyncError, SyncResult};

use super::atomic_ref::AtomicRef;
use super::node::{wait_status, WaitNode};
use super::parker;
use super::synchronizer::{SyncOps, Synchronizer, SPIN_FOR_TIMEOUT_THRESHOLD};

/// How an interrupt observed during a wait is reported: re-asserted on
/// exit when a signal won the race, raised when the interrupt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptMode {
    None,
    Reinterrupt,
    Throw,
}

/// Condition variable bound to one synchronizer.
pub struct Condition<O: SyncOps> {
    sync: Arc<Synchronizer<O>>,
    /// Chain ends; mutated only while the synchronizer is held
    /// exclusively.
    first_waiter: AtomicRef<WaitNode>,
    last_waiter: AtomicRef<WaitNode>,
}

impl<O: SyncOps> Condition<O> {
    pub(crate) fn new(sync: Arc<Synchronizer<O>>) -> Self {
        Self {
            sync,
            first_waiter: AtomicRef::null(),
            last_waiter: AtomicRef::null(),
        }
    }

    fn check_owner(&self) -> SyncResult<()> {
        if self.sync.ops().is_held_exclusively(&self.sync) {
            Ok(())
        } else {
            Err(SyncError::IllegalMonitorState(
                "condition used without holding the synchronizer".to_string(),
            ))
        }
    }

    // ---------------------------------------------------------------
    // Waiting
    // ---------------------------------------------------------------

    /// Block until signalled; an interrupt aborts with
    /// [`SyncError::Interrupted`] after the synchronizer has been
    /// reacquired.
    pub fn wait(&self) -> SyncResult<()> {
        if parker::current().take_interrupted() {
            return Err(SyncError::Interrupted);
        }
        self.check_owner()?;
        let node = {
            let guard = epoch::pin();
            self.add_condition_waiter(&guard)
        };
        let saved_state = self.sync.fully_release(&node)?;

        let mut interrupt_mode = InterruptMode::None;
        while !self.sync.is_on_sync_queue(&node) {
            parker::park();
            interrupt_mode = self.check_interrupt_while_waiting(&node);
            if interrupt_mode != InterruptMode::None {
                break;
            }
        }

        if self.sync.acquire_queued(&node, saved_state)? && interrupt_mode != InterruptMode::Throw
        {
            interrupt_mode = InterruptMode::Reinterrupt;
        }
        if !node.next_waiter.is_null() {
            let guard = epoch::pin();
            self.unlink_cancelled_waiters(&guard);
        }
        self.report_interrupt(interrupt_mode)
    }

    /// Block until signalled, recording (not raising) interrupts.
    pub fn wait_uninterruptibly(&self) -> SyncResult<()> {
        self.check_owner()?;
        let node = {
            let guard = epoch::pin();
            self.add_condition_waiter(&guard)
        };
        let saved_state = self.sync.fully_release(&node)?;

        let me = parker::current();
        let mut interrupted = false;
        while !self.sync.is_on_sync_queue(&node) {
            parker::park();
            if me.take_interrupted() {
                interrupted = true;
            }
        }
        if self.sync.acquire_queued(&node, saved_state)? || interrupted {
            me.set_interrupted();
        }
        Ok(())
    }

    /// Block for at most `nanos`; returns the remaining budget (≤ 0
    /// means the deadline passed before a signal arrived).
    pub fn wait_nanos(&self, nanos: Nanos) -> SyncResult<Nanos> {
        if parker::current().take_interrupted() {
            return Err(SyncError::Interrupted);
        }
        self.check_owner()?;
        let node = {
            let guard = epoch::pin();
            self.add_condition_waiter(&guard)
        };
        let saved_state = self.sync.fully_release(&node)?;
        let start = Instant::now();

        let mut interrupt_mode = InterruptMode::None;
        while !self.sync.is_on_sync_queue(&node) {
            let remaining = nanos - elapsed_nanos(start);
            if remaining <= 0 {
                self.sync.transfer_after_cancelled_wait(&node);
                break;
            }
            if remaining > SPIN_FOR_TIMEOUT_THRESHOLD {
                parker::park_nanos(remaining);
            }
            interrupt_mode = self.check_interrupt_while_waiting(&node);
            if interrupt_mode != InterruptMode::None {
                break;
            }
        }

        if self.sync.acquire_queued(&node, saved_state)? && interrupt_mode != InterruptMode::Throw
        {
            interrupt_mode = InterruptMode::Reinterrupt;
        }
        if !node.next_waiter.is_null() {
            let guard = epoch::pin();
            self.unlink_cancelled_waiters(&guard);
        }
        self.report_interrupt(interrupt_mode)?;
        Ok(nanos - elapsed_nanos(start))
    }

    /// Block for at most `nanos`; returns `Ok(false)` if the deadline
    /// elapsed before a signal.
    pub fn wait_for(&self, nanos: Nanos) -> SyncResult<bool> {
        if parker::current().take_interrupted() {
            return Err(SyncError::Interrupted);
        }
        self.check_owner()?;
        let node = {
            let guard = epoch::pin();
            self.add_condition_waiter(&guard)
        };
        let saved_state = self.sync.fully_release(&node)?;
        let start = Instant::now();

        let mut timed_out = false;
        let mut interrupt_mode = InterruptMode::None;
        while !self.sync.is_on_sync_queue(&node) {
            let remaining = nanos - elapsed_nanos(start);
            if remaining <= 0 {
                timed_out = self.sync.transfer_after_cancelled_wait(&node);
                break;
            }
            if remaining > SPIN_FOR_TIMEOUT_THRESHOLD {
                parker::park_nanos(remaining);
            }
            interrupt_mode = self.check_interrupt_while_waiting(&node);
            if interrupt_mode != InterruptMode::None {
                break;
            }
        }

        if self.sync.acquire_queued(&node, saved_state)? && interrupt_mode != InterruptMode::Throw
        {
            interrupt_mode = InterruptMode::Reinterrupt;
        }
        if !node.next_waiter.is_null() {
            let guard = epoch::pin();
            self.unlink_cancelled_waiters(&guard);
        }
        self.report_interrupt(interrupt_mode)?;
        Ok(!timed_out)
    }

    /// Block until the absolute deadline; returns `Ok(false)` if it
    /// passed before a signal.
    pub fn wait_until(&self, deadline: Instant) -> SyncResult<bool> {
        if parker::current().take_interrupted() {
            return Err(SyncError::Interrupted);
        }
        self.check_owner()?;
        let node = {
            let guard = epoch::pin();
            self.add_condition_waiter(&guard)
        };
        let saved_state = self.sync.fully_release(&node)?;

        let mut timed_out = false;
        let mut interrupt_mode = InterruptMode::None;
        while !self.sync.is_on_sync_queue(&node) {
            let now = Instant::now();
            if now >= deadline {
                timed_out = self.sync.transfer_after_cancelled_wait(&node);
                break;
            }
            parker::park_nanos((deadline - now).as_nanos() as Nanos);
            interrupt_mode = self.check_interrupt_while_waiting(&node);
            if interrupt_mode != InterruptMode::None {
                break;
            }
        }

        if self.sync.acquire_queued(&node, saved_state)? && interrupt_mode != InterruptMode::Throw
        {
            interrupt_mode = InterruptMode::Reinterrupt;
        }
        if !node.next_waiter.is_null() {
            let guard = epoch::pin();
            self.unlink_cancelled_waiters(&guard);
        }
        self.report_interrupt(interrupt_mode)?;
        Ok(!timed_out)
    }

    // ---------------------------------------------------------------
    // Signalling
    // ---------------------------------------------------------------

    /// Transfer the longest-waiting non-cancelled waiter to the sync
    /// queue.
    pub fn signal(&self) -> SyncResult<()> {
        self.check_owner()?;
        let guard = epoch::pin();
        let mut first = self.first_waiter.clone_inner(&guard);
        while let Some(node) = first {
            let next = node.next_waiter.clone_inner(&guard);
            self.first_waiter.store(next.clone(), &guard);
            if next.is_none() {
                self.last_waiter.store(None, &guard);
            }
            node.next_waiter.store(None, &guard);
            if self.sync.transfer_for_signal(&node) {
                break;
            }
            first = next;
        }
        Ok(())
    }

    /// Transfer every waiter to the sync queue.
    pub fn signal_all(&self) -> SyncResult<()> {
        self.check_owner()?;
        let guard = epoch::pin();
        let mut first = self.first_waiter.clone_inner(&guard);
        self.first_waiter.store(None, &guard);
        self.last_waiter.store(None, &guard);
        while let Some(node) = first {
            let next = node.next_waiter.clone_inner(&guard);
            node.next_waiter.store(None, &guard);
            self.sync.transfer_for_signal(&node);
            first = next;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------

    /// Whether any thread is waiting on this condition.
    pub fn has_waiters(&self) -> SyncResult<bool> {
        self.check_owner()?;
        let guard = epoch::pin();
        let mut w = self.first_waiter.clone_inner(&guard);
        while let Some(node) = w {
            if node.status() == wait_status::CONDITION {
                return Ok(true);
            }
            w = node.next_waiter.clone_inner(&guard);
        }
        Ok(false)
    }

    /// Estimate of the number of threads waiting on this condition.
    pub fn wait_queue_length(&self) -> SyncResult<usize> {
        self.check_owner()?;
        let guard = epoch::pin();
        let mut n = 0;
        let mut w = self.first_waiter.clone_inner(&guard);
        while let Some(node) = w {
            if node.status() == wait_status::CONDITION {
                n += 1;
            }
            w = node.next_waiter.clone_inner(&guard);
        }
        Ok(n)
    }

    // ---------------------------------------------------------------
    // Chain maintenance
    // ---------------------------------------------------------------

    fn add_condition_waiter(&self, guard: &Guard) -> Arc<WaitNode> {
        if let Some(t) = self.last_waiter.load(guard) {
            if t.status() != wait_status::CONDITION {
                self.unlink_cancelled_waiters(guard);
            }
        }
        let node = Arc::new(WaitNode::for_condition(parker::current()));
        match self.last_waiter.load(guard) {
            None => self.first_waiter.store(Some(Arc::clone(&node)), guard),
            Some(t) => t.next_waiter.store(Some(Arc::clone(&node)), guard),
        }
        self.last_waiter.store(Some(Arc::clone(&node)), guard);
        node
    }

    /// Purge nodes that are no longer in CONDITION status (cancelled
    /// waits). Called only while holding the synchronizer.
    fn unlink_cancelled_waiters(&self, guard: &Guard) {
        let mut trail: Option<Arc<WaitNode>> = None;
        let mut current = self.first_waiter.clone_inner(guard);
        while let Some(node) = current {
            let next = node.next_waiter.clone_inner(guard);
            if node.status() != wait_status::CONDITION {
                node.next_waiter.store(None, guard);
                match &trail {
                    None => self.first_waiter.store(next.clone(), guard),
                    Some(t) => t.next_waiter.store(next.clone(), guard),
                }
                if next.is_none() {
                    self.last_waiter.store(trail.clone(), guard);
                }
            } else {
                trail = Some(node);
            }
            current = next;
        }
    }

    fn check_interrupt_while_waiting(&self, node: &Arc<WaitNode>) -> InterruptMode {
        if parker::current().take_interrupted() {
            if self.sync.transfer_after_cancelled_wait(node) {
                InterruptMode::Throw
            } else {
                InterruptMode::Reinterrupt
            }
        } else {
            InterruptMode::None
        }
    }

    fn report_interrupt(&self, mode: InterruptMode) -> SyncResult<()> {
        match mode {
            InterruptMode::Throw => Err(SyncError::Interrupted),
            InterruptMode::Reinterrupt => {
                parker::current().set_interrupted();
                Ok(())
            }
            InterruptMode::None => Ok(()),
        }
    }
}

impl<O: SyncOps> std::fmt::Debug for Condition<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition")
            .field("has_first_waiter", &!self.first_waiter.is_null())
            .finish()
    }
}

#[inline]
fn elapsed_nanos(start: Instant) -> Nanos {
    start.elapsed().as_nanos() as Nanos
}
