/*!
 * Turnstile
 * Queued synchronization primitives and a delay-heap scheduled executor
 *
 * Two tightly-coupled cores:
 *
 * - [`sync`]: a queued synchronizer framework — blocking
 *   acquire/release semantics over one atomic state word and an
 *   intrusive FIFO wait queue, with exclusive/shared modes, timed and
 *   interruptible variants, and condition sub-queues. Ships reentrant
 *   [`Mutex`], counting [`Semaphore`] and one-shot [`Latch`]
 *   interpreters.
 * - [`sched`]: a scheduled executor — one-shot delayed and periodic
 *   tasks on an indexed min-heap delay queue with leader-follower
 *   timed waits and O(log n) cancellation.
 */

pub mod core;
pub mod sched;
pub mod sync;

pub use crate::core::{Nanos, ScheduleError, ScheduleResult, Sequence, SyncError, SyncResult};
pub use crate::sched::{CoreConfig, ScheduledCore, ScheduledFuture, ScheduledTask};
pub use crate::sync::{
    Condition, Latch, Mutex, MutexCondition, MutexGuard, Semaphore, StateWord, SyncOps,
    Synchronizer,
};
