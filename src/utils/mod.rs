//! Small helpers shared by the scheduler and the input dispatcher.

use std::time::Duration;

pub mod clock;

pub use clock::{get_monotonic_time, Clock, ManualClock, MonotonicClock, Nsecs};

pub const NS_PER_MS: Nsecs = 1_000_000;
pub const NS_PER_SEC: Nsecs = 1_000_000_000;

pub fn duration_to_ns(duration: Duration) -> Nsecs {
    Nsecs::try_from(duration.as_nanos()).unwrap_or(Nsecs::MAX)
}

/// Converts nanoseconds to a `Duration`, clamping negative values to zero.
pub fn ns_to_duration(ns: Nsecs) -> Duration {
    Duration::from_nanos(u64::try_from(ns).unwrap_or(0))
}

pub fn ms_to_ns(ms: u32) -> Nsecs {
    Nsecs::from(ms) * NS_PER_MS
}
