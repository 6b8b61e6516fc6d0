//! Telemetry sink.
//!
//! The scheduler and the dispatcher report into a [`TimeStats`] implementation provided by the
//! embedder. Collection and aggregation live outside this crate.

use crate::utils::Nsecs;

pub trait TimeStats: Send + Sync {
    /// The display ran at `fps` for `duration` before switching away.
    fn record_refresh_rate(&self, fps: f32, duration: Nsecs) {
        let _ = (fps, duration);
    }

    /// Time between an input event happening and it being published to a window.
    fn record_dispatch_latency(&self, latency: Nsecs) {
        let _ = latency;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTimeStats;

impl TimeStats for NoopTimeStats {}
