/*!
 * Monotonic Clock
 * Nanosecond instants from a lazily-pinned process-wide epoch
 */

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::core::Nanos;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the process epoch. Monotonic, never negative.
pub(crate) fn now_nanos() -> Nanos {
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as Nanos
}

/// Clamp a duration into the signed nanosecond domain trigger
/// arithmetic runs in.
pub(crate) fn duration_to_nanos(duration: Duration) -> Nanos {
    duration.as_nanos().min(Nanos::MAX as u128) as Nanos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let a = now_nanos();
        let b = now_nanos();
        assert!(b >= a);
        assert!(a >= 0);
    }

    #[test]
    fn test_duration_clamp() {
        assert_eq!(duration_to_nanos(Duration::from_nanos(5)), 5);
        assert_eq!(duration_to_nanos(Duration::MAX), Nanos::MAX);
    }
}
