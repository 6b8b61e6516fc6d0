//! Monotonic time sources.
//!
//! Everything in this crate measures time as signed nanoseconds on the monotonic clock, the same
//! time base that hardware vsync timestamps and input event times use. Components take a
//! [`Clock`] so tests can drive time by hand with [`ManualClock`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use super::duration_to_ns;

/// Nanoseconds on the monotonic clock.
pub type Nsecs = i64;

pub trait Clock: Send + Sync {
    fn now(&self) -> Nsecs;
}

pub fn get_monotonic_time() -> Nsecs {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime() only writes to the timespec we pass in, and CLOCK_MONOTONIC is
    // always available on Linux.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as Nsecs * 1_000_000_000 + ts.tv_nsec as Nsecs
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Nsecs {
        get_monotonic_time()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Nsecs) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: Nsecs) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) -> Nsecs {
        let by = duration_to_ns(by);
        self.now.fetch_add(by, Ordering::SeqCst) + by
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Nsecs {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_time_does_not_go_backwards() {
        let a = get_monotonic_time();
        let b = get_monotonic_time();
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now(), 100);
        assert_eq!(clock.advance(Duration::from_nanos(50)), 150);
        clock.set(10);
        assert_eq!(clock.now(), 10);
    }
}
