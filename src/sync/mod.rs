/*!
 * Queued Synchronizer Framework
 *
 * Blocking acquire/release semantics over a single atomic state word
 * and an intrusive FIFO wait queue. State interpretation is supplied
 * through [`SyncOps`]; the framework owns queueing, parking,
 * cancellation and wake-up propagation.
 *
 * # Architecture
 *
 * - [`StateWord`]: the 32-bit CAS substrate every interpreter mutates.
 * - Sync queue: a CLH variant with explicit prev links so cancelled
 *   waiters can be spliced out; lock-free, lazily initialized.
 * - [`Synchronizer`]: exclusive and shared acquire paths, each in
 *   uninterruptible, interruptible and timed flavors, plus
 *   [`Condition`] sub-queues.
 * - Built-in interpreters: reentrant [`Mutex`], counting
 *   [`Semaphore`], one-shot [`Latch`].
 */

mod atomic_ref;
mod condition;
mod latch;
mod mutex;
mod node;
pub mod parker;
mod queue;
mod semaphore;
mod state;
mod synchronizer;

pub use condition::Condition;
pub use latch::Latch;
pub use mutex::{Mutex, MutexCondition, MutexGuard};
pub use parker::Parker;
pub use semaphore::Semaphore;
pub use state::StateWord;
pub use synchronizer::{SyncOps, Synchronizer};
