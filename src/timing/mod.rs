//! Clock, position/time model and wake scheduling.
//!
//! All times are nanoseconds on a process-wide monotonic clock, see
//! [`ClockTime`].

mod model;
mod scheduler;

use std::sync::OnceLock;
use std::time::{Duration, Instant};

pub use model::{LinearPosTimeModel, PositionRegression, PositionTracker};
pub use scheduler::WakeScheduler;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic nanosecond clock shared by the client and the in-process servers.
pub struct ClockTime;

impl ClockTime {
    /// Nanoseconds since the first call in this process.
    pub fn now_nanos() -> i64 {
        let epoch = *EPOCH.get_or_init(Instant::now);
        i64::try_from(epoch.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }

    /// Sleeps until the clock reads `deadline`. Returns at once if it has passed.
    pub fn absolute_sleep(deadline: i64) {
        let remaining = deadline - Self::now_nanos();
        if remaining > 0 {
            std::thread::sleep(Duration::from_nanos(remaining as u64));
        }
    }

    /// Sleeps for `nanos`.
    pub fn relative_sleep(nanos: i64) {
        if nanos > 0 {
            std::thread::sleep(Duration::from_nanos(nanos as u64));
        }
    }

    /// Converts a clock reading into a duration since the epoch.
    pub fn to_duration(nanos: i64) -> Duration {
        Duration::from_nanos(nanos.max(0) as u64)
    }
}

/// Converts a duration to signed clock nanoseconds, saturating.
pub(crate) fn nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let a = ClockTime::now_nanos();
        let b = ClockTime::now_nanos();
        assert!(b >= a);
    }

    #[test]
    fn test_absolute_sleep_reaches_deadline() {
        let deadline = ClockTime::now_nanos() + 2_000_000;
        ClockTime::absolute_sleep(deadline);
        assert!(ClockTime::now_nanos() >= deadline);
    }

    #[test]
    fn test_absolute_sleep_in_past_returns() {
        let start = Instant::now();
        ClockTime::absolute_sleep(ClockTime::now_nanos() - 1_000_000_000);
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
