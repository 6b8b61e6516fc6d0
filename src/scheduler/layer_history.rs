//! Per-window presentation history.
//!
//! Every window that presents gets a short ring of frame times. From it the history infers
//! whether the window is animating and at which rate, which feeds both the scheduler's content
//! fps and the per-layer votes of the policy table.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, trace};

use super::refresh_rate::{LayerRequirement, LayerVote};
use crate::utils::{Nsecs, NS_PER_SEC};

/// Frames kept per window.
pub const HISTORY_SIZE: usize = 90;

/// A heuristic needs either a full ring or this much history.
const HISTORY_TIME: Nsecs = NS_PER_SEC;

/// Windows that did not present for this long are inactive.
const MAX_ACTIVE_LAYER_PERIOD: Nsecs = NS_PER_SEC;

/// Frames looked at when deciding whether a window updates frequently.
const FREQUENT_LAYER_WINDOW_SIZE: usize = 3;
const MIN_FPS_FOR_FREQUENT_LAYER: f32 = 10.;

/// Inferred rates closer than this to the last reported one are not reported again.
const MARGIN_FOR_REFRESH_RATE: f32 = 1.;

/// Windows whose rates differ by more than this do not agree on a content rate.
const CONTENT_FPS_TOLERANCE: f32 = 1.;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LayerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameTime {
    present_time: Nsecs,
    queue_time: Nsecs,
}

#[derive(Debug)]
struct LayerInfo {
    name: String,
    low_fps: f32,
    high_refresh_period: Nsecs,
    frame_times: VecDeque<FrameTime>,
    last_updated: Nsecs,
    last_reported_fps: f32,
    explicit_vote: Option<LayerVote>,
    weight: f32,
}

impl LayerInfo {
    fn new(name: String, low_fps: f32, high_fps: f32) -> Self {
        Self {
            name,
            low_fps,
            high_refresh_period: (1e9 / high_fps.max(1.)) as Nsecs,
            frame_times: VecDeque::with_capacity(HISTORY_SIZE),
            last_updated: 0,
            last_reported_fps: 0.,
            explicit_vote: None,
            weight: 1.,
        }
    }

    fn record(&mut self, present_time: Nsecs, now: Nsecs) {
        let last_present = self.frame_times.back().map_or(0, |f| f.present_time);
        let present_time = present_time.max(last_present);
        self.last_updated = present_time.max(now);

        while self.frame_times.len() >= HISTORY_SIZE {
            self.frame_times.pop_front();
        }
        self.frame_times.push_back(FrameTime {
            present_time,
            queue_time: now,
        });
    }

    fn clear_history(&mut self) {
        self.frame_times.clear();
        self.last_reported_fps = 0.;
    }

    fn is_recently_active(&self, now: Nsecs) -> bool {
        !self.frame_times.is_empty() && self.last_updated >= now - MAX_ACTIVE_LAYER_PERIOD
    }

    fn is_frequent(&self, now: Nsecs) -> bool {
        // Too little history to know; could be the start of an animation.
        if self.frame_times.len() < FREQUENT_LAYER_WINDOW_SIZE {
            return true;
        }

        let threshold = now - MAX_ACTIVE_LAYER_PERIOD;
        let active: Vec<&FrameTime> = self
            .frame_times
            .iter()
            .skip_while(|f| f.queue_time < threshold)
            .collect();
        if active.len() < FREQUENT_LAYER_WINDOW_SIZE {
            return false;
        }

        let (Some(first), Some(last)) = (active.first(), active.last()) else {
            return false;
        };
        let total = last.queue_time - first.queue_time;
        if total <= 0 {
            return true;
        }

        1e9 * (active.len() - 1) as f32 / total as f32 >= MIN_FPS_FOR_FREQUENT_LAYER
    }

    fn has_enough_data_for_heuristic(&self) -> bool {
        let (Some(first), Some(last)) = (self.frame_times.front(), self.frame_times.back()) else {
            return false;
        };
        if self.frame_times.len() < 2 {
            return false;
        }

        self.frame_times.len() >= HISTORY_SIZE || last.queue_time - first.queue_time >= HISTORY_TIME
    }

    /// Average presentation rate, if the frames are evenly spaced.
    fn calculate_refresh_rate(&mut self) -> Option<f32> {
        if !self.has_enough_data_for_heuristic() {
            return None;
        }

        let deltas: Vec<Nsecs> = self
            .frame_times
            .iter()
            .zip(self.frame_times.iter().skip(1))
            .map(|(a, b)| (b.present_time - a.present_time).max(self.high_refresh_period))
            .collect();
        if self.frame_times.iter().any(|f| f.present_time == 0) {
            return None;
        }

        let average = deltas.iter().sum::<Nsecs>() as f32 / deltas.len() as f32;
        if average <= 0. {
            return None;
        }

        // A burst of frames followed by a pause is not a rate.
        if deltas
            .iter()
            .any(|&delta| (delta as f32 - average).abs() > 2. * average)
        {
            return None;
        }

        let fps = 1e9 / average;
        if (fps - self.last_reported_fps).abs() > MARGIN_FOR_REFRESH_RATE {
            self.last_reported_fps = fps;
        }
        Some(self.last_reported_fps)
    }

    fn vote(&mut self, now: Nsecs) -> LayerVote {
        if let Some(vote) = self.explicit_vote {
            return vote;
        }

        if !self.is_frequent(now) {
            return LayerVote::Min;
        }

        match self.calculate_refresh_rate() {
            Some(fps) if fps + MARGIN_FOR_REFRESH_RATE < self.low_fps => LayerVote::Min,
            Some(fps) => LayerVote::Heuristic { desired_fps: fps },
            None => LayerVote::Max,
        }
    }
}

#[derive(Debug, Default)]
pub struct LayerHistory {
    layers: BTreeMap<LayerId, LayerInfo>,
}

impl LayerHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a window with the range of rates it can sensibly run at.
    pub fn register_layer(&mut self, id: LayerId, name: &str, low_fps: f32, high_fps: f32) {
        debug!("registering layer {name} ({id:?}) with fps range [{low_fps}, {high_fps}]");
        self.layers
            .insert(id, LayerInfo::new(name.to_owned(), low_fps, high_fps));
    }

    pub fn unregister_layer(&mut self, id: LayerId) {
        if self.layers.remove(&id).is_none() {
            trace!("unregistering unknown layer {id:?}");
        }
    }

    pub fn is_registered(&self, id: LayerId) -> bool {
        self.layers.contains_key(&id)
    }

    /// Records a presented frame. Timestamps earlier than the previous one are clamped to it.
    pub fn record(&mut self, id: LayerId, present_time: Nsecs, now: Nsecs) {
        let Some(layer) = self.layers.get_mut(&id) else {
            trace!("ignoring frame of unregistered layer {id:?}");
            return;
        };
        layer.record(present_time, now);
    }

    pub fn set_layer_vote(&mut self, id: LayerId, vote: Option<LayerVote>) {
        if let Some(layer) = self.layers.get_mut(&id) {
            layer.explicit_vote = vote;
        }
    }

    pub fn set_layer_weight(&mut self, id: LayerId, weight: f32) {
        if let Some(layer) = self.layers.get_mut(&id) {
            layer.weight = weight.max(0.);
        }
    }

    /// Drops the history of windows that went idle.
    fn partition_layers(&mut self, now: Nsecs) {
        for (id, layer) in &mut self.layers {
            if !layer.frame_times.is_empty() && !layer.is_recently_active(now) {
                trace!("layer {id:?} went idle, dropping its history");
                layer.clear_history();
            }
        }
    }

    /// The content rate all active periodic windows agree on, or 0.
    pub fn summarize(&mut self, now: Nsecs) -> f32 {
        let _span = tracy_client::span!("LayerHistory::summarize");

        self.partition_layers(now);

        let mut rates = self
            .layers
            .values_mut()
            .filter(|layer| layer.is_recently_active(now) && layer.is_frequent(now))
            .filter_map(|layer| layer.calculate_refresh_rate());

        let Some(first) = rates.next() else {
            return 0.;
        };
        let (min, max) = rates.fold((first, first), |(min, max), fps| {
            (min.min(fps), max.max(fps))
        });

        if max - min > CONTENT_FPS_TOLERANCE {
            trace!("active layers disagree on content rate: {min} vs {max}");
            return 0.;
        }

        max
    }

    /// Votes of the active windows.
    pub fn requirements(&mut self, now: Nsecs) -> Vec<LayerRequirement> {
        self.partition_layers(now);

        self.layers
            .values_mut()
            .filter(|layer| layer.is_recently_active(now))
            .map(|layer| LayerRequirement {
                name: layer.name.clone(),
                vote: layer.vote(now),
                weight: layer.weight,
            })
            .collect()
    }

    /// Forgets all frame times so that the next summary starts fresh.
    pub fn clear(&mut self) {
        for layer in self.layers.values_mut() {
            layer.clear_history();
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    const START: Nsecs = 10 * NS_PER_SEC;

    fn period(fps: f32) -> Nsecs {
        (1e9 / fps) as Nsecs
    }

    /// Presents `count` frames at `fps` starting at `start`, returns the time of the last one.
    fn present(history: &mut LayerHistory, id: LayerId, start: Nsecs, fps: f32, count: usize) -> Nsecs {
        let mut now = start;
        for i in 0..count {
            now = start + i as Nsecs * period(fps);
            history.record(id, now, now);
        }
        now
    }

    fn history_with(layers: &[(u64, &str)]) -> LayerHistory {
        let mut history = LayerHistory::new();
        for (id, name) in layers {
            history.register_layer(LayerId(*id), name, 30., 120.);
        }
        history
    }

    #[test]
    fn steady_content_is_detected() {
        let mut history = history_with(&[(1, "video")]);
        let now = present(&mut history, LayerId(1), START, 60., 70);

        assert_abs_diff_eq!(history.summarize(now), 60., epsilon = 1.);

        let reqs = history.requirements(now);
        assert_eq!(reqs.len(), 1);
        let LayerVote::Heuristic { desired_fps } = reqs[0].vote else {
            panic!("unexpected vote {:?}", reqs[0].vote);
        };
        assert_abs_diff_eq!(desired_fps, 60., epsilon = 1.);
    }

    #[test]
    fn too_little_history_has_no_rate() {
        let mut history = history_with(&[(1, "anim")]);
        let now = present(&mut history, LayerId(1), START, 60., 10);

        assert_eq!(history.summarize(now), 0.);
        assert_eq!(history.requirements(now)[0].vote, LayerVote::Max);
    }

    #[test]
    fn disagreeing_layers_report_nothing() {
        let mut history = history_with(&[(1, "a"), (2, "b")]);
        present(&mut history, LayerId(1), START, 60., 70);
        let now = present(&mut history, LayerId(2), START, 30., 35);

        assert_eq!(history.summarize(now), 0.);
    }

    #[test]
    fn agreeing_layers_report_their_rate() {
        let mut history = history_with(&[(1, "a"), (2, "b")]);
        present(&mut history, LayerId(1), START, 30., 35);
        let now = present(&mut history, LayerId(2), START, 30., 35);

        assert_abs_diff_eq!(history.summarize(now), 30., epsilon = 1.);
    }

    #[test]
    fn idle_layers_are_evicted() {
        let mut history = history_with(&[(1, "a")]);
        let now = present(&mut history, LayerId(1), START, 60., 70);

        let later = now + 2 * MAX_ACTIVE_LAYER_PERIOD;
        assert_eq!(history.summarize(later), 0.);
        assert!(history.requirements(later).is_empty());
        assert!(history.layers[&LayerId(1)].frame_times.is_empty());
    }

    #[test]
    fn infrequent_layers_vote_min() {
        let mut history = history_with(&[(1, "clock")]);
        let mut now = START;
        for i in 0..5 {
            now = START + i * 200_000_000;
            history.record(LayerId(1), now, now);
        }

        assert_eq!(history.summarize(now), 0.);
        assert_eq!(history.requirements(now)[0].vote, LayerVote::Min);
    }

    #[test]
    fn bursts_are_not_a_rate() {
        let mut history = history_with(&[(1, "burst")]);
        let mut now = START;
        for i in 0..60 {
            now = START + i * period(60.);
            history.record(LayerId(1), now, now);
        }
        // A long pause, then more frames.
        now += 800_000_000;
        for i in 0..10 {
            history.record(LayerId(1), now + i * period(60.), now + i * period(60.));
        }
        now += 9 * period(60.);

        let mut layer_rate = None;
        if let Some(layer) = history.layers.get_mut(&LayerId(1)) {
            layer_rate = layer.calculate_refresh_rate();
        }
        assert_eq!(layer_rate, None);
        assert_eq!(history.summarize(now), 0.);
    }

    #[test]
    fn rate_is_clamped_to_high_bound() {
        let mut history = LayerHistory::new();
        history.register_layer(LayerId(1), "fast", 30., 60.);
        let now = present(&mut history, LayerId(1), START, 120., 130);

        assert_abs_diff_eq!(history.summarize(now), 60., epsilon = 1.);
    }

    #[test]
    fn clear_forgets_history() {
        let mut history = history_with(&[(1, "a")]);
        let now = present(&mut history, LayerId(1), START, 60., 70);
        history.clear();

        assert_eq!(history.summarize(now), 0.);
    }

    #[test]
    fn timestamps_never_go_backwards() {
        let mut history = history_with(&[(1, "a")]);
        history.record(LayerId(1), START, START);
        history.record(LayerId(1), START - 1000, START + 10);

        let layer = &history.layers[&LayerId(1)];
        assert_eq!(layer.frame_times[1].present_time, START);
    }

    #[test]
    fn explicit_votes_and_weights() {
        let mut history = history_with(&[(1, "a")]);
        history.set_layer_vote(
            LayerId(1),
            Some(LayerVote::ExplicitExactOrMultiple { desired_fps: 24. }),
        );
        history.set_layer_weight(LayerId(1), 0.5);
        let now = present(&mut history, LayerId(1), START, 60., 5);

        let reqs = history.requirements(now);
        assert_eq!(
            reqs,
            vec![LayerRequirement {
                name: String::from("a"),
                vote: LayerVote::ExplicitExactOrMultiple { desired_fps: 24. },
                weight: 0.5,
            }]
        );
    }

    #[test]
    fn unregistered_layers_are_ignored() {
        let mut history = LayerHistory::new();
        history.record(LayerId(5), START, START);
        assert!(!history.is_registered(LayerId(5)));
        assert_eq!(history.summarize(START), 0.);

        history.register_layer(LayerId(5), "a", 30., 120.);
        history.unregister_layer(LayerId(5));
        assert!(!history.is_registered(LayerId(5)));
    }
}
