//! Monotonic microsecond wall-clock (spec §4.2).

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::ids::{Timestamp, DISTANT_FUTURE, DISTANT_PAST};

/// Produces non-decreasing microsecond timestamps, clamping across clock
/// regressions. One instance is shared per store; cloning shares the clamp
/// state so independently-held clones still agree on monotonicity.
#[derive(Debug)]
pub struct TimestampSource {
    last: Mutex<Timestamp>,
}

impl Default for TimestampSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampSource {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(DISTANT_PAST),
        }
    }

    /// `distant_past` sentinel: the smallest representable timestamp.
    pub const fn distant_past() -> Timestamp {
        DISTANT_PAST
    }

    /// `distant_future` sentinel: the largest representable timestamp.
    pub const fn distant_future() -> Timestamp {
        DISTANT_FUTURE
    }

    /// Microseconds since `UNIX_EPOCH`, guaranteed non-decreasing across
    /// successive calls against the same `TimestampSource`.
    pub fn now(&self) -> Timestamp {
        let wall_clock = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);

        let mut last = self.last.lock().expect("timestamp source mutex poisoned");
        let next = if wall_clock > *last {
            wall_clock
        } else {
            last.saturating_add(1)
        };
        *last = next;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successive_calls_never_decrease() {
        let source = TimestampSource::new();
        let mut previous = source.now();
        for _ in 0..1_000 {
            let next = source.now();
            assert!(next > previous, "{next} did not advance past {previous}");
            previous = next;
        }
    }

    #[test]
    fn sentinels_bound_every_real_timestamp() {
        let source = TimestampSource::new();
        let now = source.now();
        assert!(now > TimestampSource::distant_past());
        assert!(now < TimestampSource::distant_future());
    }
}
