/*!
 * Scheduler Configuration
 * Pool sizing and shutdown policies
 */

use serde::{Deserialize, Serialize};

/// Construction-time configuration for a scheduled core.
///
/// The three shutdown policies remain adjustable at runtime through
/// the core's setters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Number of worker threads the pool grows to on demand.
    pub core_threads: usize,
    /// Worker threads are named `{prefix}-{n}`.
    pub thread_name_prefix: String,
    /// Keep running periodic tasks after a graceful shutdown.
    pub continue_periodic_after_shutdown: bool,
    /// Run already-queued one-shot tasks after a graceful shutdown.
    pub execute_delayed_after_shutdown: bool,
    /// Eagerly remove cancelled tasks from the delay heap.
    pub remove_on_cancel: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            core_threads: 1,
            thread_name_prefix: "turnstile-worker".to_string(),
            continue_periodic_after_shutdown: false,
            execute_delayed_after_shutdown: true,
            remove_on_cancel: false,
        }
    }
}

impl CoreConfig {
    /// Single-threaded scheduler with default policies.
    pub fn single_thread() -> Self {
        Self::default()
    }

    /// Scheduler with `core_threads` workers and default policies.
    pub fn with_core_threads(core_threads: usize) -> Self {
        Self {
            core_threads: core_threads.max(1),
            ..Self::default()
        }
    }
}
