/*!
 * State Word
 * 32-bit atomic state holder; meaning is owned by the state interpreter
 */

use std::sync::atomic::{AtomicI32, Ordering};

/// The synchronizer's single 32-bit state word.
///
/// The framework never interprets the value; interpreters attach
/// semantics (hold count, permit count, open/closed). Mutation is
/// through `compare_and_set` or `set`; a successful release-store
/// followed by an acquire-load on another thread establishes the
/// release/acquire edge every acquire-after-release depends on.
#[derive(Debug)]
pub struct StateWord {
    value: AtomicI32,
}

impl StateWord {
    /// Create a state word with the given initial value.
    pub const fn new(initial: i32) -> Self {
        Self {
            value: AtomicI32::new(initial),
        }
    }

    /// Volatile-read the current state.
    #[inline]
    pub fn get(&self) -> i32 {
        self.value.load(Ordering::Acquire)
    }

    /// Volatile-write the state.
    ///
    /// Only safe protocol-wise for the thread that currently holds the
    /// synchronizer exclusively; contended transitions must CAS.
    #[inline]
    pub fn set(&self, new: i32) {
        self.value.store(new, Ordering::Release);
    }

    /// Atomically set the state to `update` if it equals `expect`.
    ///
    /// Sequentially consistent: state transitions are the linearization
    /// points of every acquire and release.
    #[inline]
    pub fn compare_and_set(&self, expect: i32, update: i32) -> bool {
        self.value
            .compare_exchange(expect, update, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
