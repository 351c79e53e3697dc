/*!
 * Scheduled Task
 * Delay-heap entry: payload, trigger time, period, heap index, sequence
 *
 * Lifecycle runs Pending → Running → (Succeeded | Failed | Cancelled)
 * on a CAS'd state machine. Periodic runs reset to Pending instead of
 * latching a result, so the same task re-enters the heap; completion
 * of a one-shot (or cancellation/failure of any task) opens the done
 * latch that `get` waits on.
 */

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::warn;
use parking_lot::Mutex as PlMutex;

use crate::core::{Nanos, ScheduleError, ScheduleResult, Sequence};
use crate::sync::parker::{self, Parker};
use crate::sync::Latch;

use super::clock;
use super::executor::CoreInner;

/// Boxed task body. Periodic tasks invoke it in place on every run;
/// one-shots take it out and run it once.
pub type Payload = Box<dyn FnMut() + Send + 'static>;

mod task_state {
    pub const PENDING: i32 = 0;
    pub const RUNNING: i32 = 1;
    pub const SUCCEEDED: i32 = 2;
    pub const FAILED: i32 = 3;
    pub const CANCELLED: i32 = 4;
}
use task_state::*;

/// One scheduled unit of work.
pub struct ScheduledTask {
    sequence: Sequence,
    /// Trigger instant in monotonic nanos. Mutated only between heap
    /// residencies, so heap ordering sees a stable key.
    time: AtomicI64,
    /// 0 = one-shot; +p = fixed-rate; −p = fixed-delay.
    period: Nanos,
    /// Position in the delay heap; −1 when not enqueued.
    heap_index: AtomicI64,
    state: AtomicI32,
    payload: PlMutex<Option<Payload>>,
    /// Parker of the thread currently executing the payload; target
    /// of best-effort cancel interrupts.
    runner: PlMutex<Option<Arc<Parker>>>,
    failure: PlMutex<Option<String>>,
    /// Late-bound identity of the (possibly decorated) task the
    /// scheduler enqueued; periodic re-enqueue goes through it.
    outer: PlMutex<Option<Weak<ScheduledTask>>>,
    core: Weak<CoreInner>,
    done: Latch,
}

impl ScheduledTask {
    pub(crate) fn new(
        core: Weak<CoreInner>,
        payload: Payload,
        trigger: Nanos,
        period: Nanos,
        sequence: Sequence,
    ) -> Arc<Self> {
        Arc::new(Self {
            sequence,
            time: AtomicI64::new(trigger),
            period,
            heap_index: AtomicI64::new(-1),
            state: AtomicI32::new(PENDING),
            payload: PlMutex::new(Some(payload)),
            runner: PlMutex::new(None),
            failure: PlMutex::new(None),
            outer: PlMutex::new(None),
            core,
            done: Latch::new(),
        })
    }

    /// Build a decorating wrapper around `inner`: same trigger,
    /// period, sequence and owner, new payload. For `decorate` hooks
    /// that substitute their own task object.
    pub fn wrapping(inner: &Arc<ScheduledTask>, payload: Payload) -> Arc<Self> {
        Arc::new(Self {
            sequence: inner.sequence,
            time: AtomicI64::new(inner.trigger_nanos()),
            period: inner.period,
            heap_index: AtomicI64::new(-1),
            state: AtomicI32::new(PENDING),
            payload: PlMutex::new(Some(payload)),
            runner: PlMutex::new(None),
            failure: PlMutex::new(None),
            outer: PlMutex::new(None),
            core: inner.core.clone(),
            done: Latch::new(),
        })
    }

    #[inline]
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    #[inline]
    pub fn is_periodic(&self) -> bool {
        self.period != 0
    }

    /// Remaining delay; negative once the trigger time has passed.
    pub fn delay_nanos(&self) -> Nanos {
        self.trigger_nanos() - clock::now_nanos()
    }

    #[inline]
    pub(crate) fn trigger_nanos(&self) -> Nanos {
        self.time.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn heap_index(&self) -> i64 {
        self.heap_index.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_heap_index(&self, index: i64) {
        self.heap_index.store(index, Ordering::Release);
    }

    /// Heap ordering: `(trigger, sequence)`, FIFO for equal triggers.
    /// The subtraction is safe against wrap because submission clamps
    /// triggers so all pairwise differences stay representable.
    pub(crate) fn precedes(&self, other: &ScheduledTask) -> bool {
        let diff = self.trigger_nanos() - other.trigger_nanos();
        if diff != 0 {
            diff < 0
        } else {
            self.sequence < other.sequence
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) >= SUCCEEDED
    }

    /// Cancel the task. Succeeds if it has not completed; a task
    /// caught mid-run stops rescheduling, and with `may_interrupt`
    /// the running worker is interrupted (best-effort). With the
    /// owner's remove-on-cancel policy set, the task leaves the heap
    /// immediately instead of waiting to be polled and dropped.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let cancelled = self.cas_state(PENDING, CANCELLED) || self.cas_state(RUNNING, CANCELLED);
        if cancelled {
            if may_interrupt {
                if let Some(runner) = self.runner.lock().as_ref() {
                    runner.interrupt();
                }
            }
            self.done.open();
            if let Some(core) = self.core.upgrade() {
                if core.remove_on_cancel() && self.heap_index() >= 0 {
                    core.remove_from_heap(self);
                }
            }
        }
        cancelled
    }

    pub(crate) fn set_outer(&self, outer: &Arc<ScheduledTask>) {
        *self.outer.lock() = Some(Arc::downgrade(outer));
    }

    /// Execute per the run-state policy: cancel if the pool no longer
    /// admits this class of task; run one-shots to completion; run
    /// periodic tasks without latching and re-enqueue on success.
    pub(crate) fn run(self: &Arc<Self>, core: &Arc<CoreInner>) {
        let periodic = self.is_periodic();
        if !core.can_run_in_current_run_state(periodic) {
            self.cancel(false);
            return;
        }
        if !self.cas_state(PENDING, RUNNING) {
            return;
        }

        let me = parker::current();
        *self.runner.lock() = Some(Arc::clone(&me));
        let outcome = {
            let mut payload = self.payload.lock();
            if periodic {
                match payload.as_mut() {
                    Some(job) => catch_unwind(AssertUnwindSafe(|| job())),
                    None => Ok(()),
                }
            } else {
                match payload.take() {
                    Some(mut job) => catch_unwind(AssertUnwindSafe(move || job())),
                    None => Ok(()),
                }
            }
        };
        *self.runner.lock() = None;
        // Absorb a best-effort cancel interrupt aimed at this run so
        // it cannot leak into the worker's next wait.
        me.take_interrupted();

        match outcome {
            Ok(()) => {
                if periodic {
                    // Reset for reuse; a cancel that won the race
                    // keeps the task out of the heap.
                    if self.cas_state(RUNNING, PENDING) {
                        self.set_next_run_time(core);
                        let outer = self
                            .outer
                            .lock()
                            .as_ref()
                            .and_then(Weak::upgrade)
                            .unwrap_or_else(|| Arc::clone(self));
                        core.re_execute_periodic(outer);
                    }
                } else if self.cas_state(RUNNING, SUCCEEDED) {
                    self.done.open();
                }
            }
            Err(panic) => {
                let message = panic_message(&panic);
                warn!("scheduled task panicked: {message}");
                *self.failure.lock() = Some(message);
                let _ = self.cas_state(RUNNING, FAILED);
                self.done.open();
            }
        }
    }

    /// Fixed-rate: advance from the previous trigger. Fixed-delay:
    /// re-anchor at completion time.
    fn set_next_run_time(&self, core: &Arc<CoreInner>) {
        if self.period > 0 {
            self.time.fetch_add(self.period, Ordering::AcqRel);
        } else {
            self.time
                .store(core.trigger_time(-self.period), Ordering::Release);
        }
    }

    #[inline]
    fn cas_state(&self, expect: i32, update: i32) -> bool {
        self.state
            .compare_exchange(expect, update, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn terminal_result<T: Clone>(&self, result: &PlMutex<Option<T>>) -> ScheduleResult<T> {
        match self.state.load(Ordering::Acquire) {
            SUCCEEDED => result
                .lock()
                .clone()
                .ok_or(ScheduleError::Cancelled),
            FAILED => Err(ScheduleError::Panicked(
                self.failure
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "unknown panic".to_string()),
            )),
            _ => Err(ScheduleError::Cancelled),
        }
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("sequence", &self.sequence)
            .field("delay_nanos", &self.delay_nanos())
            .field("period", &self.period)
            .field("state", &self.state.load(Ordering::Acquire))
            .finish()
    }
}

/// Handle to a scheduled task's eventual result.
pub struct ScheduledFuture<T> {
    task: Arc<ScheduledTask>,
    result: Arc<PlMutex<Option<T>>>,
}

impl<T> Clone for ScheduledFuture<T> {
    fn clone(&self) -> Self {
        Self {
            task: Arc::clone(&self.task),
            result: Arc::clone(&self.result),
        }
    }
}

impl<T> ScheduledFuture<T> {
    pub(crate) fn new(task: Arc<ScheduledTask>, result: Arc<PlMutex<Option<T>>>) -> Self {
        Self { task, result }
    }

    /// The underlying task (heap-entry view).
    pub fn task(&self) -> &Arc<ScheduledTask> {
        &self.task
    }

    pub fn cancel(&self, may_interrupt: bool) -> bool {
        self.task.cancel(may_interrupt)
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.task.is_done()
    }

    pub fn is_periodic(&self) -> bool {
        self.task.is_periodic()
    }

    /// Remaining delay; negative once due.
    pub fn delay_nanos(&self) -> Nanos {
        self.task.delay_nanos()
    }

    /// Remaining delay as a duration, zero once due.
    pub fn delay(&self) -> Duration {
        Duration::from_nanos(self.delay_nanos().max(0) as u64)
    }
}

impl<T: Clone> ScheduledFuture<T> {
    /// Block until the task completes. For a periodic task this only
    /// returns once it is cancelled or fails.
    pub fn get(&self) -> ScheduleResult<T> {
        self.task.done.wait()?;
        self.task.terminal_result(&self.result)
    }

    /// Block for at most `timeout`; `Ok(None)` if still pending.
    pub fn get_timeout(&self, timeout: Duration) -> ScheduleResult<Option<T>> {
        if self.task.done.wait_for(timeout)? {
            self.task.terminal_result(&self.result).map(Some)
        } else {
            Ok(None)
        }
    }
}

impl<T> std::fmt::Debug for ScheduledFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledFuture")
            .field("task", &self.task)
            .finish()
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
