//! Minimum-interval gate between accepted samples.

use std::time::Duration;

use time::OffsetDateTime;

/// Decides whether a sample is far enough from the last accepted one.
///
/// A sample is admitted when there is no previously accepted sample, or when
/// its capture time is at least 90% of the configured interval after the last
/// accepted capture time. The comparison is done in integer nanoseconds so
/// the 90% boundary is exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalGate {
    interval: Duration,
}

impl IntervalGate {
    /// Create a gate for the given minimum interval.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// The configured interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether `candidate` may be accepted after `last`.
    ///
    /// Samples with a capture time before `last` are rejected.
    #[must_use]
    pub fn admits(&self, last: Option<OffsetDateTime>, candidate: OffsetDateTime) -> bool {
        let Some(last) = last else {
            return true;
        };

        let elapsed = candidate.unix_timestamp_nanos() - last.unix_timestamp_nanos();
        if elapsed < 0 {
            return false;
        }

        // elapsed >= 0.9 * interval, scaled by 10
        elapsed * 10 >= self.interval.as_nanos() as i128 * 9
    }
}
