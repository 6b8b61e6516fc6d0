//! VSync timing model.
//!
//! The [`VsyncSource`] is what the scheduler talks to: it is fed hardware vsync samples and
//! present fences, and predicts upcoming vsyncs. Hardware vsync is only needed while the model
//! is (re)learning, so every sample reports whether more are needed.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::utils::Nsecs;

mod predictor;
mod reactor;

pub use predictor::{VsyncModel, VsyncPredictor};
pub use reactor::VsyncReactor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsyncSettings {
    /// Number of samples kept for the fit.
    pub history_size: usize,
    /// Samples needed before the fit is trusted.
    pub min_samples: usize,
    /// A sample whose phase error exceeds this share of a period is discarded.
    pub outlier_tolerance_percent: u32,
    /// Unsignaled present fences kept around.
    pub pending_fence_limit: usize,
}

impl Default for VsyncSettings {
    fn default() -> Self {
        Self::from(&cadence_config::Vsync::default())
    }
}

impl From<&cadence_config::Vsync> for VsyncSettings {
    fn from(config: &cadence_config::Vsync) -> Self {
        Self {
            history_size: config.history_size.max(2) as usize,
            min_samples: config.min_samples.max(2) as usize,
            outlier_tolerance_percent: config.outlier_tolerance_percent.min(50),
            pending_fence_limit: config.pending_fence_limit as usize,
        }
    }
}

/// Result of feeding a hardware vsync sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncOutcome {
    /// Hardware vsync should stay (or become) enabled.
    pub needs_hw_vsync: bool,
    /// A pending period change took effect with this sample.
    pub period_flushed: bool,
}

/// Periodic timing signal with a fitted model.
pub trait VsyncSource: Send + Sync {
    /// Switches to a new ideal period. Non-positive periods are ignored.
    fn set_period(&self, period: Nsecs);

    /// Currently predicted vsync period.
    fn period(&self) -> Nsecs;

    /// Starts a hardware resync window.
    fn enable(&self);

    /// Ends a hardware resync window.
    fn disable(&self);

    /// Feeds a hardware vsync timestamp.
    fn add_resync_sample(&self, timestamp: Nsecs) -> ResyncOutcome;

    /// Feeds a present fence. Returns whether hardware vsync is needed.
    fn add_present_fence(&self, fence: std::sync::Arc<PresentFence>) -> bool;

    fn set_ignore_present_fences(&self, ignore: bool);

    /// Predicted vsync after `now + periods_offset * period`.
    fn compute_next_refresh(&self, periods_offset: i32) -> Nsecs;

    /// Predicted vsync at which a frame started now would be shown.
    fn expected_present_time(&self) -> Nsecs;
}

/// Turns the hardware vsync interrupt on and off.
pub trait HwVsyncControl: Send + Sync {
    fn set_vsync_enabled(&self, enabled: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceTime {
    Pending,
    Invalid,
    Signaled(Nsecs),
}

const SIGNAL_TIME_PENDING: Nsecs = Nsecs::MAX;
const SIGNAL_TIME_INVALID: Nsecs = -1;

/// Present fence whose signal time becomes known later.
#[derive(Debug)]
pub struct PresentFence {
    signal_time: AtomicI64,
}

impl PresentFence {
    pub fn pending() -> Self {
        Self {
            signal_time: AtomicI64::new(SIGNAL_TIME_PENDING),
        }
    }

    pub fn invalid() -> Self {
        Self {
            signal_time: AtomicI64::new(SIGNAL_TIME_INVALID),
        }
    }

    pub fn signaled(at: Nsecs) -> Self {
        Self {
            signal_time: AtomicI64::new(at),
        }
    }

    pub fn signal(&self, at: Nsecs) {
        self.signal_time.store(at, Ordering::Release);
    }

    pub fn signal_time(&self) -> FenceTime {
        match self.signal_time.load(Ordering::Acquire) {
            SIGNAL_TIME_PENDING => FenceTime::Pending,
            t if t < 0 => FenceTime::Invalid,
            t => FenceTime::Signaled(t),
        }
    }
}
