//! [`VsyncSource`] built on the predictor.
//!
//! The reactor decides which timestamps reach the predictor. Present fences are the cheap
//! source and hardware vsync samples the expensive one, which is only requested while the model
//! needs confirmation, such as after a period change or when fences stop lining up.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use super::{FenceTime, PresentFence, ResyncOutcome, VsyncPredictor, VsyncSettings, VsyncSource};
use crate::utils::{Clock, Nsecs};

/// A new period is confirmed when two consecutive hardware samples are this close to it.
const PERIOD_CONFIRMATION_TOLERANCE_PERCENT: Nsecs = 10;

struct ReactorState {
    predictor: VsyncPredictor,
    unfired_fences: VecDeque<Arc<PresentFence>>,
    external_ignore_fences: bool,
    internal_ignore_fences: bool,
    more_samples_needed: bool,
    period_confirmation_in_progress: bool,
    period_transitioning_to: Option<Nsecs>,
    last_hw_vsync: Option<Nsecs>,
}

pub struct VsyncReactor {
    clock: Arc<dyn Clock>,
    pending_fence_limit: usize,
    state: Mutex<ReactorState>,
}

impl VsyncReactor {
    pub fn new(settings: VsyncSettings, initial_period: Nsecs, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            pending_fence_limit: settings.pending_fence_limit,
            state: Mutex::new(ReactorState {
                predictor: VsyncPredictor::new(settings, initial_period),
                unfired_fences: VecDeque::new(),
                external_ignore_fences: false,
                internal_ignore_fences: false,
                more_samples_needed: false,
                period_confirmation_in_progress: false,
                period_transitioning_to: None,
                last_hw_vsync: None,
            }),
        }
    }

    pub fn pending_fence_count(&self) -> usize {
        self.state.lock().unwrap().unfired_fences.len()
    }
}

impl ReactorState {
    fn ignoring_fences(&self) -> bool {
        self.external_ignore_fences || self.internal_ignore_fences
    }

    fn set_internal_ignore_fences(&mut self, ignore: bool) {
        if ignore {
            self.unfired_fences.clear();
        }
        self.internal_ignore_fences = ignore;
    }

    fn period_confirmed(&self, timestamp: Nsecs) -> bool {
        if !self.period_confirmation_in_progress {
            return false;
        }

        let Some(last) = self.last_hw_vsync else {
            return false;
        };

        let period = self
            .period_transitioning_to
            .unwrap_or_else(|| self.predictor.current_period());
        let distance = timestamp
            .saturating_sub(last)
            .saturating_sub(period)
            .saturating_abs();
        distance.saturating_mul(100) / period < PERIOD_CONFIRMATION_TOLERANCE_PERCENT
    }

    fn end_period_transition(&mut self) {
        self.period_transitioning_to = None;
        self.period_confirmation_in_progress = false;
        self.last_hw_vsync = None;
        self.set_internal_ignore_fences(false);
    }
}

impl VsyncSource for VsyncReactor {
    fn set_period(&self, period: Nsecs) {
        if period <= 0 {
            warn!("ignoring invalid vsync period {period}");
            return;
        }

        let mut state = self.state.lock().unwrap();
        if state.period_transitioning_to.is_none() && state.predictor.ideal_period() == period {
            return;
        }

        debug!("vsync period changing to {period}ns");
        state.period_transitioning_to = Some(period);
        state.period_confirmation_in_progress = true;
        state.more_samples_needed = true;
        state.last_hw_vsync = None;
        state.set_internal_ignore_fences(true);
    }

    fn period(&self) -> Nsecs {
        self.state.lock().unwrap().predictor.current_period()
    }

    fn enable(&self) {
        let mut state = self.state.lock().unwrap();
        state.predictor.reset_model();
        state.more_samples_needed = true;
    }

    fn disable(&self) {
        let mut state = self.state.lock().unwrap();
        state.last_hw_vsync = None;
    }

    fn add_resync_sample(&self, timestamp: Nsecs) -> ResyncOutcome {
        let _span = tracy_client::span!("VsyncReactor::add_resync_sample");

        let mut state = self.state.lock().unwrap();
        let mut period_flushed = false;

        if state.period_confirmed(timestamp) {
            if let Some(period) = state.period_transitioning_to {
                state.predictor.set_period(period);
                period_flushed = true;
            }
            if let Some(last) = state.last_hw_vsync {
                state.predictor.add_vsync_timestamp(last);
            }
            state.predictor.add_vsync_timestamp(timestamp);
            state.end_period_transition();
            state.more_samples_needed = state.predictor.needs_more_samples(timestamp);
        } else if state.period_confirmation_in_progress {
            state.last_hw_vsync = Some(timestamp);
            state.more_samples_needed = true;
        } else {
            state.predictor.add_vsync_timestamp(timestamp);
            state.more_samples_needed = state.predictor.needs_more_samples(timestamp);
        }

        trace!(
            "resync sample {timestamp}: needs hw vsync {}, period flushed {period_flushed}",
            state.more_samples_needed
        );
        ResyncOutcome {
            needs_hw_vsync: state.more_samples_needed,
            period_flushed,
        }
    }

    fn add_present_fence(&self, fence: Arc<PresentFence>) -> bool {
        let signal_time = fence.signal_time();
        if signal_time == FenceTime::Invalid {
            return true;
        }

        let mut state = self.state.lock().unwrap();
        if state.ignoring_fences() {
            return true;
        }

        let mut accepted = true;
        let mut pending = VecDeque::with_capacity(state.unfired_fences.len());
        while let Some(unfired) = state.unfired_fences.pop_front() {
            match unfired.signal_time() {
                FenceTime::Pending => pending.push_back(unfired),
                FenceTime::Invalid => (),
                FenceTime::Signaled(time) => {
                    accepted &= state.predictor.add_vsync_timestamp(time);
                }
            }
        }
        state.unfired_fences = pending;

        match signal_time {
            FenceTime::Pending => {
                if state.unfired_fences.len() >= self.pending_fence_limit {
                    state.unfired_fences.pop_front();
                }
                state.unfired_fences.push_back(fence);
            }
            FenceTime::Signaled(time) => {
                accepted &= state.predictor.add_vsync_timestamp(time);
            }
            FenceTime::Invalid => (),
        }

        if !accepted {
            debug!("present fence rejected by the vsync model, requesting hardware vsync");
            state.more_samples_needed = true;
            state.set_internal_ignore_fences(true);
            state.period_confirmation_in_progress = true;
        } else if !state.more_samples_needed {
            state.more_samples_needed = state.predictor.needs_more_samples(self.clock.now());
        }

        state.more_samples_needed
    }

    fn set_ignore_present_fences(&self, ignore: bool) {
        let mut state = self.state.lock().unwrap();
        state.external_ignore_fences = ignore;
        if ignore {
            state.unfired_fences.clear();
        }
    }

    fn compute_next_refresh(&self, periods_offset: i32) -> Nsecs {
        let now = self.clock.now();
        let state = self.state.lock().unwrap();
        let period = state.predictor.current_period();
        state
            .predictor
            .next_anticipated_vsync_from(now + Nsecs::from(periods_offset) * period)
    }

    fn expected_present_time(&self) -> Nsecs {
        let now = self.clock.now();
        self.state
            .lock()
            .unwrap()
            .predictor
            .next_anticipated_vsync_from(now)
    }
}
