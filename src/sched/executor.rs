/*!
 * Scheduled Core
 * Delay-heap executor: one-shot delayed tasks and periodic tasks
 *
 * Owns the delay heap and the worker pool. Workers block in the
 * heap's leader-follower take; submission guards the trigger-time
 * arithmetic against overflow and re-checks the run state around the
 * enqueue so shutdown races resolve to the policy table.
 */

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex as PlMutex;

use crate::core::{Nanos, ScheduleError, ScheduleResult, Sequence, SyncError, SyncResult};
use crate::sync::{Mutex, MutexCondition};

use super::clock;
use super::config::CoreConfig;
use super::heap::DelayHeap;
use super::pool::{run_state, WorkerSet};
use super::task::{Payload, ScheduledFuture, ScheduledTask};

/// Hook applied to every constructed task before enqueue; returns the
/// task actually scheduled (identity when absent). Wrappers can be
/// built with [`ScheduledTask::wrapping`].
pub type TaskDecorator = Arc<dyn Fn(Arc<ScheduledTask>) -> Arc<ScheduledTask> + Send + Sync>;

pub(crate) struct CoreInner {
    pub(crate) heap: DelayHeap,
    state: AtomicI32,
    pub(crate) workers: WorkerSet,
    termination: Mutex<()>,
    termination_cond: MutexCondition,
    core_threads: usize,
    continue_periodic: AtomicBool,
    execute_delayed: AtomicBool,
    remove_on_cancel: AtomicBool,
    sequence: AtomicU64,
    decorator: Option<TaskDecorator>,
}

impl CoreInner {
    #[inline]
    pub(crate) fn run_state(&self) -> i32 {
        self.state.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_shutdown(&self) -> bool {
        self.run_state() != run_state::RUNNING
    }

    #[inline]
    pub(crate) fn remove_on_cancel(&self) -> bool {
        self.remove_on_cancel.load(Ordering::Acquire)
    }

    pub(crate) fn remove_from_heap(&self, task: &ScheduledTask) -> bool {
        self.heap.remove(task)
    }

    /// Raise the run state monotonically; never lowers it.
    fn advance_run_state(&self, target: i32) {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current >= target {
                return;
            }
            if self
                .state
                .compare_exchange(current, target, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Policy table for whether a task class may run in the current
    /// state.
    pub(crate) fn can_run_in_current_run_state(&self, periodic: bool) -> bool {
        match self.run_state() {
            run_state::RUNNING => true,
            run_state::SHUTDOWN => {
                if periodic {
                    self.continue_periodic.load(Ordering::Acquire)
                } else {
                    self.execute_delayed.load(Ordering::Acquire)
                }
            }
            _ => false,
        }
    }

    /// Trigger instant for a delay, clamped so that no pairwise
    /// difference against an already-overdue head can overflow the
    /// heap comparison.
    pub(crate) fn trigger_time(&self, delay: Nanos) -> Nanos {
        let delay = delay.max(0);
        clock::now_nanos()
            + if delay < (Nanos::MAX >> 1) {
                delay
            } else {
                self.overflow_free(delay)
            }
    }

    fn overflow_free(&self, mut delay: Nanos) -> Nanos {
        if let Some(head) = self.heap.peek() {
            let head_delay = head.delay_nanos();
            if head_delay < 0 && delay - head_delay < 0 {
                delay = Nanos::MAX + head_delay;
            }
        }
        delay
    }

    fn reject(&self) -> ScheduleError {
        let message = format!("executor rejected task (run state {})", self.run_state());
        warn!("{message}");
        ScheduleError::Rejected(message)
    }

    /// Construct, decorate, bind and enqueue a task.
    fn submit(
        self: &Arc<Self>,
        payload: Payload,
        delay: Nanos,
        period: Nanos,
    ) -> ScheduleResult<Arc<ScheduledTask>> {
        let trigger = self.trigger_time(delay);
        let sequence: Sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut task = ScheduledTask::new(Arc::downgrade(self), payload, trigger, period, sequence);
        if let Some(decorate) = &self.decorator {
            task = decorate(task);
        }
        task.set_outer(&task);
        self.delayed_execute(&task)?;
        Ok(task)
    }

    /// Enqueue with the shutdown re-check: a state change that now
    /// precludes this task class removes and cancels it.
    fn delayed_execute(self: &Arc<Self>, task: &Arc<ScheduledTask>) -> ScheduleResult<()> {
        if self.is_shutdown() {
            return Err(self.reject());
        }
        self.heap.offer(Arc::clone(task));
        if self.is_shutdown()
            && !self.can_run_in_current_run_state(task.is_periodic())
            && self.heap.remove(task)
        {
            task.cancel(false);
        } else {
            self.ensure_prestart();
        }
        Ok(())
    }

    /// Requeue a periodic task after a successful run.
    pub(crate) fn re_execute_periodic(self: &Arc<Self>, task: Arc<ScheduledTask>) {
        if self.can_run_in_current_run_state(true) {
            self.heap.offer(Arc::clone(&task));
            if !self.can_run_in_current_run_state(true) && self.heap.remove(&task) {
                task.cancel(false);
            } else {
                self.ensure_prestart();
            }
        }
    }

    /// Launch a worker if the pool is below its core size.
    fn ensure_prestart(self: &Arc<Self>) {
        if self.run_state() >= run_state::STOP {
            return;
        }
        if self.workers.count() < self.core_threads {
            let inner = Arc::clone(self);
            self.workers.spawn(move || worker_loop(inner));
        }
    }

    /// Graceful-shutdown sweep: cancel and drop every queued task
    /// whose class the current policy disallows, plus anything
    /// already cancelled.
    pub(crate) fn on_shutdown(&self) {
        let keep_delayed = self.execute_delayed.load(Ordering::Acquire);
        let keep_periodic = self.continue_periodic.load(Ordering::Acquire);
        if !keep_delayed && !keep_periodic {
            for task in self.heap.drain() {
                task.cancel(false);
            }
        } else {
            for task in self.heap.snapshot() {
                let disallowed = if task.is_periodic() {
                    !keep_periodic
                } else {
                    !keep_delayed
                };
                if (disallowed || task.is_cancelled()) && self.heap.remove(&task) {
                    task.cancel(false);
                }
            }
        }
        debug!("shutdown sweep left {} queued task(s)", self.heap.len());
        self.try_terminate();
    }

    /// Advance to TERMINATED once the queue is exhausted and the last
    /// worker has exited; otherwise propagate the shutdown by waking
    /// idle workers.
    pub(crate) fn try_terminate(&self) {
        loop {
            let state = self.run_state();
            if state == run_state::RUNNING || state >= run_state::TIDYING {
                return;
            }
            if state == run_state::SHUTDOWN && !self.heap.is_empty() {
                return;
            }
            if self.workers.count() != 0 {
                self.workers.interrupt_idle();
                return;
            }
            if self
                .state
                .compare_exchange(
                    state,
                    run_state::TIDYING,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                self.state.store(run_state::TERMINATED, Ordering::SeqCst);
                info!("scheduled core terminated");
                let _guard = self.termination.lock();
                let _ = self.termination_cond.signal_all();
                return;
            }
        }
    }
}

/// How long a worker waits per pass while the pool is draining after
/// shutdown, so policy flips are observed without relying on an
/// interrupt landing.
const SHUTDOWN_POLL_NANOS: Nanos = 100_000_000;

/// Worker body: block on the heap, run what comes out, re-check the
/// run state on every wake.
fn worker_loop(inner: Arc<CoreInner>) {
    let slot = inner.workers.register();
    loop {
        let state = inner.run_state();
        if state >= run_state::STOP {
            break;
        }
        if state == run_state::SHUTDOWN && inner.heap.is_empty() {
            break;
        }
        let taken = if state == run_state::SHUTDOWN {
            inner.heap.poll_deadline(SHUTDOWN_POLL_NANOS)
        } else {
            inner.heap.take().map(Some)
        };
        match taken {
            Ok(Some(task)) => {
                slot.set_busy(true);
                task.run(&inner);
                slot.set_busy(false);
            }
            Ok(None) => continue,
            Err(SyncError::Interrupted) => continue,
            Err(err) => {
                warn!("worker wait failed: {err}");
                break;
            }
        }
    }
    inner.workers.deregister(&slot);
    inner.try_terminate();
}

/// Thread pool scheduling one-shot delayed and periodic tasks.
///
/// Dropping the core performs a graceful [`shutdown`](Self::shutdown)
/// without waiting: already-queued tasks finish per policy on
/// detached workers.
pub struct ScheduledCore {
    inner: Arc<CoreInner>,
}

impl ScheduledCore {
    pub fn new(config: CoreConfig) -> Self {
        Self::build(config, None)
    }

    /// Core with a task decoration hook.
    pub fn with_decorator(config: CoreConfig, decorator: TaskDecorator) -> Self {
        Self::build(config, Some(decorator))
    }

    fn build(config: CoreConfig, decorator: Option<TaskDecorator>) -> Self {
        let termination = Mutex::new(());
        let termination_cond = termination.new_condition();
        let inner = Arc::new(CoreInner {
            heap: DelayHeap::new(),
            state: AtomicI32::new(run_state::RUNNING),
            workers: WorkerSet::new(config.thread_name_prefix.clone()),
            termination,
            termination_cond,
            core_threads: config.core_threads.max(1),
            continue_periodic: AtomicBool::new(config.continue_periodic_after_shutdown),
            execute_delayed: AtomicBool::new(config.execute_delayed_after_shutdown),
            remove_on_cancel: AtomicBool::new(config.remove_on_cancel),
            sequence: AtomicU64::new(0),
            decorator,
        });
        info!(
            "scheduled core started: up to {} worker(s)",
            inner.core_threads
        );
        Self { inner }
    }

    // ---------------------------------------------------------------
    // Submission
    // ---------------------------------------------------------------

    /// Run `f` once after `delay`.
    pub fn schedule<F>(&self, f: F, delay: Duration) -> ScheduleResult<ScheduledFuture<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_call(
            move || {
                f();
            },
            delay,
        )
    }

    /// Run `f` once after `delay`, capturing its value for `get`.
    pub fn schedule_call<T, F>(&self, f: F, delay: Duration) -> ScheduleResult<ScheduledFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let result = Arc::new(PlMutex::new(None));
        let slot = Arc::clone(&result);
        let mut f = Some(f);
        let payload: Payload = Box::new(move || {
            if let Some(f) = f.take() {
                *slot.lock() = Some(f());
            }
        });
        let task = self
            .inner
            .submit(payload, clock::duration_to_nanos(delay), 0)?;
        Ok(ScheduledFuture::new(task, result))
    }

    /// Run `f` immediately on the pool.
    pub fn execute<F>(&self, f: F) -> ScheduleResult<ScheduledFuture<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(f, Duration::ZERO)
    }

    /// Run `f` repeatedly: first at `initial_delay`, then every
    /// `period` measured trigger-to-trigger, regardless of run
    /// duration. Requires `period > 0`.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        f: F,
        initial_delay: Duration,
        period: Duration,
    ) -> ScheduleResult<ScheduledFuture<()>>
    where
        F: FnMut() + Send + 'static,
    {
        let period_nanos = clock::duration_to_nanos(period);
        if period_nanos <= 0 {
            return Err(ScheduleError::InvalidPeriod(period_nanos));
        }
        self.submit_periodic(f, initial_delay, period_nanos)
    }

    /// Run `f` repeatedly: first at `initial_delay`, then `delay`
    /// after each completion. Requires `delay > 0`.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        f: F,
        initial_delay: Duration,
        delay: Duration,
    ) -> ScheduleResult<ScheduledFuture<()>>
    where
        F: FnMut() + Send + 'static,
    {
        let delay_nanos = clock::duration_to_nanos(delay);
        if delay_nanos <= 0 {
            return Err(ScheduleError::InvalidPeriod(delay_nanos));
        }
        self.submit_periodic(f, initial_delay, -delay_nanos)
    }

    fn submit_periodic<F>(
        &self,
        mut f: F,
        initial_delay: Duration,
        period: Nanos,
    ) -> ScheduleResult<ScheduledFuture<()>>
    where
        F: FnMut() + Send + 'static,
    {
        let result = Arc::new(PlMutex::new(None));
        let payload: Payload = Box::new(move || f());
        let task = self
            .inner
            .submit(payload, clock::duration_to_nanos(initial_delay), period)?;
        Ok(ScheduledFuture::new(task, result))
    }

    // ---------------------------------------------------------------
    // Policies
    // ---------------------------------------------------------------

    pub fn continue_periodic_after_shutdown(&self) -> bool {
        self.inner.continue_periodic.load(Ordering::Acquire)
    }

    /// Flipping this off after shutdown re-runs the policy sweep, as
    /// the newly-disallowed periodic tasks must leave the queue.
    pub fn set_continue_periodic_after_shutdown(&self, value: bool) {
        self.inner.continue_periodic.store(value, Ordering::Release);
        if !value && self.is_shutdown() {
            self.inner.on_shutdown();
        }
    }

    pub fn execute_delayed_after_shutdown(&self) -> bool {
        self.inner.execute_delayed.load(Ordering::Acquire)
    }

    pub fn set_execute_delayed_after_shutdown(&self, value: bool) {
        self.inner.execute_delayed.store(value, Ordering::Release);
        if !value && self.is_shutdown() {
            self.inner.on_shutdown();
        }
    }

    pub fn remove_on_cancel(&self) -> bool {
        self.inner.remove_on_cancel()
    }

    pub fn set_remove_on_cancel(&self, value: bool) {
        self.inner.remove_on_cancel.store(value, Ordering::Release);
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// Stop accepting tasks; queued tasks run per the shutdown
    /// policies.
    pub fn shutdown(&self) {
        info!("scheduled core shutting down");
        self.inner.advance_run_state(run_state::SHUTDOWN);
        self.inner.workers.interrupt_idle();
        self.inner.on_shutdown();
    }

    /// Stop immediately: drain the queue, interrupt every worker, and
    /// return the tasks that never ran.
    pub fn shutdown_now(&self) -> Vec<Arc<ScheduledTask>> {
        info!("scheduled core stopping");
        self.inner.advance_run_state(run_state::STOP);
        self.inner.workers.interrupt_all();
        let drained = self.inner.heap.drain();
        self.inner.try_terminate();
        drained
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.run_state() == run_state::TERMINATED
    }

    /// Block until terminated or the timeout elapses (`Ok(false)`).
    pub fn await_termination(&self, timeout: Duration) -> SyncResult<bool> {
        let mut guard = self.inner.termination.lock_interruptibly()?;
        let mut nanos = clock::duration_to_nanos(timeout);
        loop {
            if self.is_terminated() {
                return Ok(true);
            }
            if nanos <= 0 {
                return Ok(false);
            }
            nanos = self
                .inner
                .termination_cond
                .wait_nanos(&mut guard, nanos)?;
        }
    }

    // ---------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------

    /// Read-mostly copy of the queue; iteration does not follow
    /// execution order.
    pub fn queue_snapshot(&self) -> Vec<Arc<ScheduledTask>> {
        self.inner.heap.snapshot()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.heap.len()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.count()
    }
}

impl Drop for ScheduledCore {
    fn drop(&mut self) {
        if !self.is_shutdown() {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for ScheduledCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledCore")
            .field("run_state", &self.inner.run_state())
            .field("queued", &self.queue_len())
            .field("workers", &self.worker_count())
            .finish()
    }
}
