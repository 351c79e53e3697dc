/*!
 * Scheduled Executor Core
 *
 * A thread pool for one-shot delayed tasks and periodic tasks, backed
 * by an indexed binary min-heap delay queue with O(log n) arbitrary
 * cancellation and leader-follower timed waits. Blocking runs on the
 * crate's own queued mutex and conditions.
 */

mod clock;
mod config;
mod executor;
mod heap;
mod pool;
mod task;

pub use config::CoreConfig;
pub use executor::{ScheduledCore, TaskDecorator};
pub use task::{Payload, ScheduledFuture, ScheduledTask};
