/*!
 * Core Types
 * Scalar aliases shared across the synchronizer and scheduler
 */

/// Monotonic-clock instant or span in nanoseconds.
///
/// Signed so that pairwise differences between a deeply-negative delay
/// and a near-maximum trigger time stay representable (see the overflow
/// clamp in the scheduler's trigger-time computation).
pub type Nanos = i64;

/// Submission sequence number; FIFO tie-breaker for equal trigger times.
pub type Sequence = u64;
