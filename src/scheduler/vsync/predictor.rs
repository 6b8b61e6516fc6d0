//! Least-squares vsync predictor.
//!
//! Keeps a short history of vsync timestamps and fits `timestamp = ordinal * period + intercept`
//! over them. Timestamps are normalized to the oldest sample and ordinals are fixed point, which
//! keeps the whole fit in integer arithmetic.

use std::collections::{HashMap, VecDeque};

use tracing::{trace, warn};

use super::VsyncSettings;
use crate::utils::{Nsecs, NS_PER_MS};

/// Fixed point scale of the ordinals.
const SCALING_FACTOR: i128 = 1000;

/// Fitted models are remembered per ideal period, up to this many periods.
const MAX_RATE_MAP_ENTRIES: usize = 30;

/// With no sample for this long the model is considered stale.
const SAMPLES_STALE_AFTER: Nsecs = 500 * NS_PER_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsyncModel {
    pub period: Nsecs,
    /// Offset from the oldest sample to the ordinal 0 vsync.
    pub intercept: Nsecs,
}

#[derive(Debug)]
pub struct VsyncPredictor {
    settings: VsyncSettings,
    ideal_period: Nsecs,
    /// Newest timestamp that was dropped from or rejected by the history.
    known_timestamp: Option<Nsecs>,
    timestamps: VecDeque<Nsecs>,
    rate_map: HashMap<Nsecs, VsyncModel>,
}

impl VsyncPredictor {
    pub fn new(settings: VsyncSettings, ideal_period: Nsecs) -> Self {
        let mut rate_map = HashMap::new();
        rate_map.insert(ideal_period, VsyncModel::ideal(ideal_period));

        Self {
            settings,
            ideal_period,
            known_timestamp: None,
            timestamps: VecDeque::with_capacity(settings.history_size),
            rate_map,
        }
    }

    pub fn model(&self) -> VsyncModel {
        self.rate_map
            .get(&self.ideal_period)
            .copied()
            .unwrap_or(VsyncModel::ideal(self.ideal_period))
    }

    pub fn current_period(&self) -> Nsecs {
        self.model().period
    }

    pub fn ideal_period(&self) -> Nsecs {
        self.ideal_period
    }

    pub fn sample_count(&self) -> usize {
        self.timestamps.len()
    }

    fn validate(&self, timestamp: Nsecs) -> bool {
        let Some(&last) = self.timestamps.back() else {
            return true;
        };

        let phase = timestamp.saturating_sub(last).rem_euclid(self.ideal_period);
        let percent = phase.saturating_mul(100) / self.ideal_period;
        let tolerance = Nsecs::from(self.settings.outlier_tolerance_percent);
        percent < tolerance || percent >= 100 - tolerance
    }

    /// Adds a vsync timestamp and refits the model.
    ///
    /// Returns `false` if the timestamp was rejected as an outlier or if the fit had to be
    /// thrown away.
    pub fn add_vsync_timestamp(&mut self, timestamp: Nsecs) -> bool {
        let _span = tracy_client::span!("VsyncPredictor::add_vsync_timestamp");

        if self.timestamps.back().is_some_and(|&last| timestamp <= last) {
            trace!("ignoring non-increasing vsync timestamp {timestamp}");
            return false;
        }

        if !self.validate(timestamp) {
            let newest = self.timestamps.back().copied().unwrap_or(timestamp);
            self.known_timestamp = Some(timestamp.max(newest));
            trace!("vsync timestamp {timestamp} is an outlier");
            return false;
        }

        self.timestamps.push_back(timestamp);
        while self.timestamps.len() > self.settings.history_size {
            self.timestamps.pop_front();
        }

        if self.timestamps.len() < self.settings.min_samples {
            self.rate_map
                .insert(self.ideal_period, VsyncModel::ideal(self.ideal_period));
            return true;
        }

        let Some(model) = self.fit() else {
            warn!(
                "vsync fit diverged from the {}ns ideal period, resetting",
                self.ideal_period
            );
            self.rate_map
                .insert(self.ideal_period, VsyncModel::ideal(self.ideal_period));
            self.clear_timestamps();
            return false;
        };

        trace!(
            "vsync model: period {}ns, intercept {}ns",
            model.period,
            model.intercept
        );
        self.rate_map.insert(self.ideal_period, model);
        true
    }

    fn fit(&self) -> Option<VsyncModel> {
        let oldest = *self.timestamps.front()?;
        let current_period = i128::from(self.current_period());
        let n = self.timestamps.len() as i128;

        let points: Vec<(i128, i128)> = self
            .timestamps
            .iter()
            .map(|&ts| {
                let ts = i128::from(ts) - i128::from(oldest);
                let ordinal = (ts + current_period / 2) / current_period * SCALING_FACTOR;
                (ts, ordinal)
            })
            .collect();

        let mean_ts = points.iter().map(|p| p.0).sum::<i128>() / n;
        let mean_ordinal = points.iter().map(|p| p.1).sum::<i128>() / n;

        // Timestamps spread over most of the i64 range overflow even in i128.
        let (top, bottom) = points
            .iter()
            .try_fold((0i128, 0i128), |(top, bottom), &(ts, ordinal)| {
                let ts = ts - mean_ts;
                let ordinal = ordinal - mean_ordinal;
                Some((
                    top.checked_add(ts.checked_mul(ordinal)?)?,
                    bottom.checked_add(ordinal.checked_mul(ordinal)?)?,
                ))
            })?;
        if bottom == 0 {
            return None;
        }

        let period = top.checked_mul(SCALING_FACTOR)? / bottom;
        let intercept = mean_ts.checked_sub(period.checked_mul(mean_ordinal)? / SCALING_FACTOR)?;

        let ideal = i128::from(self.ideal_period);
        let percent = period.saturating_sub(ideal).saturating_abs().saturating_mul(100) / ideal;
        if percent >= i128::from(self.settings.outlier_tolerance_percent) {
            return None;
        }

        Some(VsyncModel {
            period: Nsecs::try_from(period).ok()?,
            intercept: Nsecs::try_from(intercept).ok()?,
        })
    }

    /// First predicted vsync strictly after `time_point`.
    pub fn next_anticipated_vsync_from(&self, time_point: Nsecs) -> Nsecs {
        let Some(&oldest) = self.timestamps.front() else {
            let known = self.known_timestamp.unwrap_or(time_point);
            return next_vsync_after(time_point, i128::from(known), self.ideal_period);
        };

        let VsyncModel { period, intercept } = self.model();
        let zero_point = i128::from(oldest) + i128::from(intercept);
        next_vsync_after(time_point, zero_point, period)
    }

    pub fn set_period(&mut self, period: Nsecs) {
        let _span = tracy_client::span!("VsyncPredictor::set_period");

        self.ideal_period = period;
        if !self.rate_map.contains_key(&period) {
            if self.rate_map.len() >= MAX_RATE_MAP_ENTRIES {
                let evict = self.rate_map.keys().copied().find(|&p| p != period);
                if let Some(evict) = evict {
                    self.rate_map.remove(&evict);
                }
            }
            self.rate_map.insert(period, VsyncModel::ideal(period));
        }

        self.clear_timestamps();
    }

    /// Drops the samples but keeps the newest one as the phase reference.
    fn clear_timestamps(&mut self) {
        if let Some(&newest) = self.timestamps.back() {
            self.known_timestamp = Some(self.known_timestamp.map_or(newest, |k| k.max(newest)));
            self.timestamps.clear();
        }
    }

    pub fn reset_model(&mut self) {
        self.rate_map
            .insert(self.ideal_period, VsyncModel::ideal(self.ideal_period));
        self.clear_timestamps();
    }

    /// Whether hardware vsync samples are still needed to trust the model.
    pub fn needs_more_samples(&self, now: Nsecs) -> bool {
        if self.timestamps.len() < self.settings.min_samples {
            return true;
        }

        match self.timestamps.back() {
            Some(&last) => last.saturating_add(SAMPLES_STALE_AFTER) <= now,
            None => true,
        }
    }
}

/// The first `zero_point + k * period` after `time_point`, clamped to the end of time.
fn next_vsync_after(time_point: Nsecs, zero_point: i128, period: Nsecs) -> Nsecs {
    let period = i128::from(period);
    let ordinal = (i128::from(time_point) - zero_point).div_euclid(period) + 1;
    Nsecs::try_from(zero_point + ordinal * period).unwrap_or(Nsecs::MAX)
}

impl VsyncModel {
    fn ideal(period: Nsecs) -> Self {
        Self {
            period,
            intercept: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const PERIOD: Nsecs = 16_666_666;

    fn predictor() -> VsyncPredictor {
        VsyncPredictor::new(VsyncSettings::default(), PERIOD)
    }

    fn feed(predictor: &mut VsyncPredictor, start: Nsecs, period: Nsecs, count: i64) -> Nsecs {
        let mut last = start;
        for i in 0..count {
            last = start + i * period;
            predictor.add_vsync_timestamp(last);
        }
        last
    }

    #[test]
    fn predicts_from_ideal_period_without_samples() {
        let p = predictor();
        assert_eq!(p.next_anticipated_vsync_from(1000), 1000 + PERIOD);
    }

    #[test]
    fn predicts_from_known_timestamp_after_reset() {
        let mut p = predictor();
        p.add_vsync_timestamp(5000);
        p.reset_model();

        assert_eq!(p.sample_count(), 0);
        assert_eq!(p.next_anticipated_vsync_from(5001), 5000 + PERIOD);
        assert_eq!(p.next_anticipated_vsync_from(5000 + PERIOD), 5000 + 2 * PERIOD);
    }

    #[test]
    fn fits_a_slightly_different_period() {
        let mut p = predictor();
        let real_period = 16_000_000;
        let last = feed(&mut p, 1_000_000_000, real_period, 10);

        assert!((p.current_period() - real_period).abs() < 10);
        let next = p.next_anticipated_vsync_from(last);
        assert!((next - (last + real_period)).abs() < 100);
    }

    #[test]
    fn needs_samples_until_minimum_is_reached() {
        let mut p = predictor();
        let settings = VsyncSettings::default();

        let mut now = 0;
        for i in 0..settings.min_samples as i64 {
            assert!(p.needs_more_samples(now));
            now = i * PERIOD;
            p.add_vsync_timestamp(now);
        }
        assert!(!p.needs_more_samples(now));

        // Stale samples need a refresh.
        assert!(p.needs_more_samples(now + SAMPLES_STALE_AFTER));
    }

    #[test]
    fn outliers_are_rejected() {
        let mut p = predictor();
        assert!(p.add_vsync_timestamp(0));
        assert!(!p.add_vsync_timestamp(PERIOD / 2));
        assert!(p.add_vsync_timestamp(PERIOD));
        assert!(!p.add_vsync_timestamp(PERIOD));
        assert_eq!(p.sample_count(), 2);
    }

    #[test]
    fn set_period_clears_samples() {
        let mut p = predictor();
        let last = feed(&mut p, 0, PERIOD, 8);

        p.set_period(PERIOD / 2);
        assert_eq!(p.sample_count(), 0);
        assert_eq!(p.current_period(), PERIOD / 2);
        assert_eq!(p.next_anticipated_vsync_from(last), last + PERIOD / 2);
    }

    #[test]
    fn rate_map_is_bounded() {
        let mut p = predictor();
        for i in 0..(MAX_RATE_MAP_ENTRIES as i64 + 10) {
            p.set_period(PERIOD + i * 1000);
        }
        assert!(p.rate_map.len() <= MAX_RATE_MAP_ENTRIES);
    }

    #[test]
    fn history_is_bounded() {
        let mut p = predictor();
        feed(&mut p, 0, PERIOD, 100);
        assert_eq!(p.sample_count(), VsyncSettings::default().history_size);
    }

    #[test]
    fn extreme_timestamps_do_not_overflow() {
        let mut p = predictor();
        feed(&mut p, i64::MIN, PERIOD, 10);
        assert_eq!(p.current_period(), PERIOD);

        feed(&mut p, i64::MAX - 10 * PERIOD, PERIOD, 10);
        assert!(p.current_period() > 0);

        assert_eq!(p.next_anticipated_vsync_from(i64::MAX), i64::MAX);
        assert!(p.next_anticipated_vsync_from(i64::MIN) > i64::MIN);
    }

    proptest! {
        #[test]
        fn arbitrary_timestamps_keep_a_valid_model(
            mut timestamps in prop::collection::vec(any::<i64>(), 0..40),
            time_point in any::<i64>(),
        ) {
            timestamps.sort_unstable();
            let mut p = predictor();
            for ts in timestamps {
                p.add_vsync_timestamp(ts);
            }

            prop_assert!(p.current_period() > 0);
            let next = p.next_anticipated_vsync_from(time_point);
            prop_assert!(next > time_point || next == i64::MAX);
            p.needs_more_samples(time_point);
        }

        #[test]
        fn prediction_is_after_time_point(
            jitter in prop::collection::vec(-200_000i64..200_000, 0..30),
            time_point in 0i64..2_000_000_000,
        ) {
            let mut p = predictor();
            for (i, j) in jitter.iter().enumerate() {
                p.add_vsync_timestamp(i as i64 * PERIOD + j);
            }

            let next = p.next_anticipated_vsync_from(time_point);
            prop_assert!(next > time_point);
            prop_assert!(next - time_point <= p.current_period());
        }
    }
}
