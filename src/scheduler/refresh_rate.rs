//! Refresh rate policy table.
//!
//! Holds the display configurations enumerated at boot and the currently allowed policy range,
//! and picks the configuration that best fits a set of per-layer votes.
//!
//! The table is shared between the scheduler and whoever owns display policy, so all state sits
//! behind one mutex and every accessor returns owned values.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::utils::Nsecs;

/// Two periods closer than this are treated as the same cadence.
pub const MARGIN_FOR_PERIOD_CALCULATION: Nsecs = 800_000;

/// Tolerance used when checking whether an fps value falls inside a policy range.
const FPS_EPSILON: f32 = 0.001;

/// Relative tolerance under which two scores count as a tie.
const SCORE_EPSILON: f32 = 0.001;

/// Longest frame cadence that still earns partial credit.
const MAX_FRAMES_TO_FIT: i64 = 10;

/// Per extra display frame penalty for exact multiples, so the closest exact match wins.
const EXACT_MULTIPLE_PENALTY: f32 = 0.01;

/// Legacy content matching accepts a rate within this distance of an integer multiple.
const LEGACY_MULTIPLE_MARGIN: f32 = 0.05;

/// `-EINVAL`, the status reported for a rejected policy.
pub const BAD_VALUE: i32 = -22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigId(pub usize);

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configs in the same group can be switched between seamlessly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigGroup(pub i32);

/// A display configuration as enumerated from the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputConfig {
    pub config_id: ConfigId,
    pub config_group: ConfigGroup,
    pub vsync_period: Nsecs,
}

/// One hardware-supported display timing mode.
#[derive(Debug, Clone)]
pub struct RefreshRate {
    pub config_id: ConfigId,
    pub vsync_period: Nsecs,
    pub config_group: ConfigGroup,
    pub name: String,
    pub fps: f32,
}

impl RefreshRate {
    fn new(config: &InputConfig) -> Self {
        let fps = 1e9 / config.vsync_period as f32;
        Self {
            config_id: config.config_id,
            vsync_period: config.vsync_period,
            config_group: config.config_group,
            name: format!("{fps:.0}fps"),
            fps,
        }
    }

    pub fn in_policy(&self, min_fps: f32, max_fps: f32) -> bool {
        self.fps + FPS_EPSILON >= min_fps && self.fps <= max_fps + FPS_EPSILON
    }
}

impl PartialEq for RefreshRate {
    fn eq(&self, other: &Self) -> bool {
        self.config_id == other.config_id
            && self.fps == other.fps
            && self.config_group == other.config_group
            && self.vsync_period == other.vsync_period
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Policy {
    pub default_config: ConfigId,
    pub min_fps: f32,
    pub max_fps: f32,
}

/// How a layer wants the refresh rate to be chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LayerVote {
    /// The layer does not care.
    NoVote,
    /// Lowest refresh rate allowed by policy.
    Min,
    /// Highest refresh rate allowed by policy.
    Max,
    /// Rate inferred from the layer's presentation history.
    Heuristic { desired_fps: f32 },
    /// Pin the layer to one configuration.
    ExplicitDefault { pinned_config: ConfigId },
    /// Requested by the app; only exact cadence matches count.
    ExplicitExactOrMultiple { desired_fps: f32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerRequirement {
    pub name: String,
    pub vote: LayerVote,
    pub weight: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyUpdate {
    /// Whether the policy differs from the previous one.
    pub changed: bool,
    /// The config the display should run at under the new policy.
    pub current_by_policy: ConfigId,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PolicyError {
    #[error("no display configs")]
    NoConfigs,
    #[error("unknown display config {0}")]
    UnknownConfig(ConfigId),
    #[error("invalid fps range [{min}, {max}]")]
    InvalidRange { min: f32, max: f32 },
    #[error("default config {config} ({fps}fps) is outside [{min}, {max}]")]
    DefaultOutsidePolicy {
        config: ConfigId,
        fps: f32,
        min: f32,
        max: f32,
    },
}

impl PolicyError {
    pub fn code(&self) -> i32 {
        BAD_VALUE
    }
}

struct Inner {
    all: BTreeMap<ConfigId, RefreshRate>,
    /// Configs allowed by the policy, sorted by ascending fps.
    available: Vec<ConfigId>,
    current: ConfigId,
    policy: Policy,
}

pub struct RefreshRateConfigs {
    inner: Mutex<Inner>,
}

impl RefreshRateConfigs {
    pub fn new(configs: &[InputConfig], current: ConfigId) -> Result<Self, PolicyError> {
        if configs.is_empty() {
            return Err(PolicyError::NoConfigs);
        }

        let all: BTreeMap<_, _> = configs
            .iter()
            .map(|config| (config.config_id, RefreshRate::new(config)))
            .collect();
        if !all.contains_key(&current) {
            return Err(PolicyError::UnknownConfig(current));
        }

        let max_fps = all.values().map(|r| r.fps).fold(0., f32::max);
        let mut inner = Inner {
            all,
            available: Vec::new(),
            current,
            policy: Policy {
                default_config: current,
                min_fps: 0.,
                max_fps,
            },
        };
        inner.construct_available();

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    // =========================================================================
    // Policy
    // =========================================================================

    /// Validates and commits a new policy.
    ///
    /// A rejected policy leaves the previous one in force.
    pub fn set_policy(
        &self,
        default_config: ConfigId,
        min_fps: f32,
        max_fps: f32,
    ) -> Result<PolicyUpdate, PolicyError> {
        let mut inner = self.inner.lock().unwrap();

        let Some(default) = inner.all.get(&default_config) else {
            warn!("rejecting policy with unknown default config {default_config}");
            return Err(PolicyError::UnknownConfig(default_config));
        };

        // Also catches NaN.
        if !(min_fps <= max_fps) {
            warn!("rejecting policy with fps range [{min_fps}, {max_fps}]");
            return Err(PolicyError::InvalidRange {
                min: min_fps,
                max: max_fps,
            });
        }

        if !default.in_policy(min_fps, max_fps) {
            warn!(
                "rejecting policy: default config {default_config} ({}) outside [{min_fps}, {max_fps}]",
                default.name
            );
            return Err(PolicyError::DefaultOutsidePolicy {
                config: default_config,
                fps: default.fps,
                min: min_fps,
                max: max_fps,
            });
        }

        let policy = Policy {
            default_config,
            min_fps,
            max_fps,
        };
        let changed = policy != inner.policy;
        if changed {
            inner.policy = policy;
            inner.construct_available();
        }

        Ok(PolicyUpdate {
            changed,
            current_by_policy: inner.current_by_policy().config_id,
        })
    }

    pub fn policy(&self) -> Policy {
        self.inner.lock().unwrap().policy
    }

    pub fn is_config_allowed(&self, config: ConfigId) -> bool {
        self.inner.lock().unwrap().available.contains(&config)
    }

    /// Whether more than one config is available under the current policy.
    pub fn refresh_rate_switching_supported(&self) -> bool {
        self.inner.lock().unwrap().available.len() > 1
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Lowest rate in the current config's group, ignoring policy.
    pub fn min_refresh_rate(&self) -> RefreshRate {
        let inner = self.inner.lock().unwrap();
        lowest(inner.current_group())
            .unwrap_or(&inner.all[&inner.current])
            .clone()
    }

    /// Highest rate in the current config's group, ignoring policy.
    pub fn max_refresh_rate(&self) -> RefreshRate {
        let inner = self.inner.lock().unwrap();
        highest(inner.current_group())
            .unwrap_or(&inner.all[&inner.current])
            .clone()
    }

    pub fn min_refresh_rate_by_policy(&self) -> RefreshRate {
        self.inner.lock().unwrap().min_by_policy().clone()
    }

    pub fn max_refresh_rate_by_policy(&self) -> RefreshRate {
        self.inner.lock().unwrap().max_by_policy().clone()
    }

    pub fn current_refresh_rate(&self) -> RefreshRate {
        let inner = self.inner.lock().unwrap();
        inner.all[&inner.current].clone()
    }

    /// The current rate if the policy allows it, otherwise the policy default.
    pub fn current_refresh_rate_by_policy(&self) -> RefreshRate {
        self.inner.lock().unwrap().current_by_policy().clone()
    }

    /// Records the config the display is running at. Unknown ids are ignored.
    pub fn set_current_config_id(&self, config: ConfigId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.all.contains_key(&config) {
            warn!("ignoring unknown current config {config}");
            return false;
        }
        inner.current = config;
        true
    }

    pub fn refresh_rate_from_config_id(&self, config: ConfigId) -> Option<RefreshRate> {
        self.inner.lock().unwrap().all.get(&config).cloned()
    }

    pub fn all_refresh_rates(&self) -> Vec<RefreshRate> {
        self.inner.lock().unwrap().all.values().cloned().collect()
    }

    pub fn available_refresh_rates(&self) -> Vec<RefreshRate> {
        let inner = self.inner.lock().unwrap();
        inner
            .available
            .iter()
            .map(|id| inner.all[id].clone())
            .collect()
    }

    // =========================================================================
    // Content matching
    // =========================================================================

    /// Legacy content matching.
    ///
    /// Averages the desired rate of the heuristic and explicit layers, picks the nearest
    /// available rate and walks up from it looking for an integer multiple of the content rate.
    #[deprecated(note = "use `refresh_rate_for_content_v2`")]
    pub fn refresh_rate_for_content(&self, layers: &[LayerRequirement]) -> RefreshRate {
        let inner = self.inner.lock().unwrap();

        if layers.iter().any(|l| l.vote == LayerVote::Max) {
            return inner.max_by_policy().clone();
        }

        let mut voting = layers.iter().filter(|l| l.vote != LayerVote::NoVote).peekable();
        if voting.peek().is_some() && voting.all(|l| l.vote == LayerVote::Min) {
            return inner.min_by_policy().clone();
        }

        let (weighted, total_weight) = layers
            .iter()
            .filter_map(|l| match l.vote {
                LayerVote::Heuristic { desired_fps }
                | LayerVote::ExplicitExactOrMultiple { desired_fps } => {
                    Some((desired_fps * l.weight, l.weight))
                }
                _ => None,
            })
            .fold((0., 0.), |(f, w), (lf, lw)| (f + lf, w + lw));
        if total_weight <= 0. {
            return inner.max_by_policy().clone();
        }

        let content_fps = (weighted / total_weight).round();
        if content_fps <= 0. {
            return inner.max_by_policy().clone();
        }

        let rates: Vec<&RefreshRate> = inner.available.iter().map(|id| &inner.all[id]).collect();
        let Some(nearest) = (0..rates.len()).min_by(|&a, &b| {
            let da = (rates[a].fps - content_fps).abs();
            let db = (rates[b].fps - content_fps).abs();
            da.total_cmp(&db)
        }) else {
            return inner.current_by_policy().clone();
        };

        let multiple = rates[nearest..].iter().find(|rate| {
            let ratio = rate.fps / content_fps;
            (ratio.round() - ratio).abs() <= LEGACY_MULTIPLE_MARGIN
        });

        (*multiple.unwrap_or(&rates[nearest])).clone()
    }

    /// Picks the config that best satisfies the layer votes.
    ///
    /// Touch short-circuits to the highest allowed rate when switching is possible. Without any
    /// votes the current config is kept.
    pub fn refresh_rate_for_content_v2(
        &self,
        layers: &[LayerRequirement],
        touch_active: bool,
    ) -> RefreshRate {
        let _span = tracy_client::span!("RefreshRateConfigs::refresh_rate_for_content_v2");

        let inner = self.inner.lock().unwrap();

        if touch_active && inner.available.len() > 1 {
            return inner.max_by_policy().clone();
        }

        let voting: Vec<&LayerRequirement> = layers
            .iter()
            .filter(|l| l.vote != LayerVote::NoVote)
            .collect();
        if voting.is_empty() {
            return inner.current_by_policy().clone();
        }

        let min_id = inner.min_by_policy().config_id;
        let max_id = inner.max_by_policy().config_id;

        let mut best: Option<(&RefreshRate, f32)> = None;
        for id in &inner.available {
            let rate = &inner.all[id];
            let score: f32 = voting
                .iter()
                .map(|layer| layer.weight * layer_score(layer.vote, rate, min_id, max_id))
                .sum();
            trace!("{} scores {score}", rate.name);

            best = match best {
                None => Some((rate, score)),
                Some((best_rate, best_score)) => {
                    let better = score > best_score * (1. + SCORE_EPSILON);
                    let worse = best_score > score * (1. + SCORE_EPSILON);
                    if better || (!worse && preferred_on_tie(rate, best_rate)) {
                        Some((rate, score))
                    } else {
                        Some((best_rate, best_score))
                    }
                }
            };
        }

        match best {
            Some((rate, _)) => rate.clone(),
            None => inner.current_by_policy().clone(),
        }
    }
}

impl Inner {
    fn construct_available(&mut self) {
        let policy = self.policy;
        let group = self.all[&policy.default_config].config_group;

        let mut available: Vec<&RefreshRate> = self
            .all
            .values()
            .filter(|r| r.config_group == group && r.in_policy(policy.min_fps, policy.max_fps))
            .collect();
        available.sort_by(|a, b| {
            b.vsync_period
                .cmp(&a.vsync_period)
                .then(a.config_id.cmp(&b.config_id))
        });

        self.available = available.iter().map(|r| r.config_id).collect();

        debug!(
            "available refresh rates under [{}, {}]: {:?}",
            policy.min_fps,
            policy.max_fps,
            available.iter().map(|r| &r.name).collect::<Vec<_>>(),
        );
    }

    // The policy always contains its default config, so the fallbacks are never hit.

    fn min_by_policy(&self) -> &RefreshRate {
        lowest(self.available.iter().map(|id| &self.all[id]))
            .unwrap_or(&self.all[&self.policy.default_config])
    }

    fn max_by_policy(&self) -> &RefreshRate {
        highest(self.available.iter().map(|id| &self.all[id]))
            .unwrap_or(&self.all[&self.policy.default_config])
    }

    fn current_group(&self) -> impl Iterator<Item = &RefreshRate> + '_ {
        let group = self.all[&self.current].config_group;
        self.all.values().filter(move |r| r.config_group == group)
    }

    fn current_by_policy(&self) -> &RefreshRate {
        if self.available.contains(&self.current) {
            &self.all[&self.current]
        } else {
            &self.all[&self.policy.default_config]
        }
    }
}

/// Lowest fps, lowest config id among equals.
fn lowest<'a>(rates: impl Iterator<Item = &'a RefreshRate>) -> Option<&'a RefreshRate> {
    rates.reduce(|a, b| {
        if b.fps < a.fps - FPS_EPSILON
            || ((b.fps - a.fps).abs() <= FPS_EPSILON && b.config_id < a.config_id)
        {
            b
        } else {
            a
        }
    })
}

/// Highest fps, lowest config id among equals.
fn highest<'a>(rates: impl Iterator<Item = &'a RefreshRate>) -> Option<&'a RefreshRate> {
    rates.reduce(|a, b| if preferred_on_tie(b, a) { b } else { a })
}

fn preferred_on_tie(rate: &RefreshRate, other: &RefreshRate) -> bool {
    rate.fps > other.fps + FPS_EPSILON
        || ((rate.fps - other.fps).abs() <= FPS_EPSILON && rate.config_id < other.config_id)
}

/// Splits a layer period into whole display frames and a remainder, snapping remainders within
/// [`MARGIN_FOR_PERIOD_CALCULATION`] of a frame boundary.
fn display_frames(layer_period: Nsecs, display_period: Nsecs) -> (i64, Nsecs) {
    let mut quot = layer_period / display_period;
    let mut rem = layer_period % display_period;
    if rem <= MARGIN_FOR_PERIOD_CALCULATION {
        rem = 0;
    } else if display_period - rem <= MARGIN_FOR_PERIOD_CALCULATION {
        quot += 1;
        rem = 0;
    }
    (quot, rem)
}

fn layer_score(vote: LayerVote, rate: &RefreshRate, min_id: ConfigId, max_id: ConfigId) -> f32 {
    match vote {
        LayerVote::NoVote => 0.,
        LayerVote::Min => f32::from(u8::from(rate.config_id == min_id)),
        LayerVote::Max => f32::from(u8::from(rate.config_id == max_id)),
        LayerVote::ExplicitDefault { pinned_config } => {
            f32::from(u8::from(rate.config_id == pinned_config))
        }
        LayerVote::Heuristic { desired_fps } => cadence_score(desired_fps, rate, true),
        LayerVote::ExplicitExactOrMultiple { desired_fps } => {
            cadence_score(desired_fps, rate, false)
        }
    }
}

/// Scores how evenly frames at `desired_fps` land on the display's vsync grid.
///
/// Exact cadences score close to 1, slightly less for each extra display frame per content
/// frame. Uneven cadences score 1/n where n is the number of display frames it takes for the
/// pattern to repeat.
fn cadence_score(desired_fps: f32, rate: &RefreshRate, partial_credit: bool) -> f32 {
    if !(desired_fps > 0.) {
        return 0.;
    }

    let layer_period = (1e9 / desired_fps).round() as Nsecs;
    let display_period = rate.vsync_period;
    let (quot, rem) = display_frames(layer_period, display_period);

    if rem == 0 {
        let extra_frames = (quot.max(1) - 1) as f32;
        return 1. / (1. + EXACT_MULTIPLE_PENALTY * extra_frames);
    }

    if !partial_credit {
        return 0.;
    }

    if quot == 0 {
        // Content is faster than the display.
        return (layer_period as f32 / display_period as f32) / (MAX_FRAMES_TO_FIT + 1) as f32;
    }

    let mut diff = (rem - (display_period - rem)).abs();
    let mut iter = 2;
    while diff > MARGIN_FOR_PERIOD_CALCULATION && iter < MAX_FRAMES_TO_FIT {
        diff -= display_period - diff;
        iter += 1;
    }

    1. / iter as f32
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use insta::assert_debug_snapshot;
    use proptest::prelude::*;

    use super::*;

    const GROUP_0: ConfigGroup = ConfigGroup(0);
    const GROUP_1: ConfigGroup = ConfigGroup(1);

    fn period(fps: f32) -> Nsecs {
        (1e9 / fps) as Nsecs
    }

    fn config(id: usize, group: ConfigGroup, fps: f32) -> InputConfig {
        InputConfig {
            config_id: ConfigId(id),
            config_group: group,
            vsync_period: period(fps),
        }
    }

    fn table_of(fps: &[f32]) -> RefreshRateConfigs {
        let configs: Vec<_> = fps
            .iter()
            .enumerate()
            .map(|(id, fps)| config(id, GROUP_0, *fps))
            .collect();
        RefreshRateConfigs::new(&configs, ConfigId(0)).unwrap()
    }

    fn layer(vote: LayerVote) -> LayerRequirement {
        LayerRequirement {
            name: String::from("layer"),
            vote,
            weight: 1.,
        }
    }

    fn heuristic(fps: f32) -> LayerRequirement {
        layer(LayerVote::Heuristic { desired_fps: fps })
    }

    #[test]
    fn rejects_empty_and_unknown_current() {
        assert_eq!(
            RefreshRateConfigs::new(&[], ConfigId(0)).err(),
            Some(PolicyError::NoConfigs)
        );
        assert_eq!(
            RefreshRateConfigs::new(&[config(0, GROUP_0, 60.)], ConfigId(3)).err(),
            Some(PolicyError::UnknownConfig(ConfigId(3)))
        );
    }

    #[test]
    fn single_config_does_not_switch() {
        let configs = table_of(&[60.]);
        assert!(!configs.refresh_rate_switching_supported());
        assert_eq!(
            configs.min_refresh_rate_by_policy(),
            configs.max_refresh_rate_by_policy()
        );
    }

    #[test]
    fn names_and_ordering() {
        let configs = table_of(&[90., 60., 72.]);
        let names: Vec<_> = configs
            .available_refresh_rates()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_debug_snapshot!(names, @r#"
        [
            "60fps",
            "72fps",
            "90fps",
        ]
        "#);
    }

    #[test]
    fn policy_rejections_leave_state_unchanged() {
        let configs = table_of(&[60., 90.]);
        let before = configs.policy();

        let err = configs.set_policy(ConfigId(9), 60., 90.).unwrap_err();
        assert_eq!(err, PolicyError::UnknownConfig(ConfigId(9)));
        assert!(err.code() < 0);

        let err = configs.set_policy(ConfigId(0), 90., 60.).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidRange { .. }));
        assert!(err.code() < 0);

        let err = configs.set_policy(ConfigId(0), 90., 120.).unwrap_err();
        assert!(matches!(err, PolicyError::DefaultOutsidePolicy { .. }));

        assert_eq!(configs.policy(), before);
        assert_eq!(configs.available_refresh_rates().len(), 2);
    }

    #[test]
    fn policy_narrows_available_rates() {
        let configs = table_of(&[60., 90.]);

        let update = configs.set_policy(ConfigId(0), 60., 60.).unwrap();
        assert!(update.changed);
        assert_eq!(update.current_by_policy, ConfigId(0));
        assert!(!configs.refresh_rate_switching_supported());
        assert_eq!(configs.max_refresh_rate_by_policy().config_id, ConfigId(0));

        // Global bounds ignore the policy.
        assert_eq!(configs.max_refresh_rate().config_id, ConfigId(1));

        let update = configs.set_policy(ConfigId(0), 60., 60.).unwrap();
        assert!(!update.changed);
    }

    #[test]
    fn current_falls_back_to_default_outside_policy() {
        let configs = table_of(&[60., 90.]);
        assert!(configs.set_current_config_id(ConfigId(1)));
        configs.set_policy(ConfigId(0), 50., 70.).unwrap();

        assert_eq!(configs.current_refresh_rate().config_id, ConfigId(1));
        assert_eq!(
            configs.current_refresh_rate_by_policy().config_id,
            ConfigId(0)
        );
        assert!(!configs.set_current_config_id(ConfigId(5)));
    }

    #[test]
    fn groups_are_not_mixed() {
        let configs = RefreshRateConfigs::new(
            &[
                config(0, GROUP_0, 60.),
                config(1, GROUP_1, 90.),
                config(2, GROUP_0, 30.),
            ],
            ConfigId(0),
        )
        .unwrap();

        assert_eq!(configs.max_refresh_rate().config_id, ConfigId(0));
        assert_eq!(configs.min_refresh_rate().config_id, ConfigId(2));
        assert_eq!(configs.available_refresh_rates().len(), 2);
        assert!(!configs.is_config_allowed(ConfigId(1)));

        configs.set_policy(ConfigId(1), 0., 120.).unwrap();
        assert_eq!(configs.available_refresh_rates().len(), 1);
        assert!(configs.is_config_allowed(ConfigId(1)));
    }

    #[test]
    fn content_24fps_prefers_72() {
        let configs = table_of(&[30., 60., 72., 90.]);
        let best = configs.refresh_rate_for_content_v2(&[heuristic(24.)], false);
        assert_eq!(best.name, "72fps");
    }

    #[test]
    fn content_prefers_closest_exact_multiple() {
        let configs = table_of(&[30., 60.]);
        let best = configs.refresh_rate_for_content_v2(&[heuristic(30.)], false);
        assert_eq!(best.name, "30fps");

        let configs = table_of(&[60., 120.]);
        let best = configs.refresh_rate_for_content_v2(&[heuristic(60.)], false);
        assert_eq!(best.name, "60fps");
    }

    #[test]
    fn content_faster_than_display_picks_max() {
        let configs = table_of(&[60., 90.]);
        let best = configs.refresh_rate_for_content_v2(&[heuristic(120.)], false);
        assert_eq!(best.name, "90fps");
    }

    #[test]
    fn touch_overrides_votes() {
        let configs = table_of(&[60., 90.]);
        let best = configs.refresh_rate_for_content_v2(&[heuristic(60.)], true);
        assert_eq!(best.name, "90fps");

        let best = configs.refresh_rate_for_content_v2(&[heuristic(60.)], false);
        assert_eq!(best.name, "60fps");
    }

    #[test]
    fn no_votes_keeps_current() {
        let configs = table_of(&[60., 90.]);
        configs.set_current_config_id(ConfigId(1));

        let best = configs.refresh_rate_for_content_v2(&[], false);
        assert_eq!(best.config_id, ConfigId(1));

        let best = configs.refresh_rate_for_content_v2(&[layer(LayerVote::NoVote)], false);
        assert_eq!(best.config_id, ConfigId(1));
    }

    #[test]
    fn min_max_and_explicit_default_votes() {
        let configs = table_of(&[60., 90.]);

        let best = configs.refresh_rate_for_content_v2(&[layer(LayerVote::Min)], false);
        assert_eq!(best.name, "60fps");

        let best = configs.refresh_rate_for_content_v2(&[layer(LayerVote::Max)], false);
        assert_eq!(best.name, "90fps");

        let pinned = layer(LayerVote::ExplicitDefault {
            pinned_config: ConfigId(0),
        });
        let mut max = layer(LayerVote::Max);
        max.weight = 0.5;
        let best = configs.refresh_rate_for_content_v2(&[pinned, max], false);
        assert_eq!(best.name, "60fps");
    }

    #[test]
    fn explicit_exact_or_multiple_has_no_partial_credit() {
        let configs = table_of(&[60., 72.]);
        let rates = configs.available_refresh_rates();

        let vote = LayerVote::ExplicitExactOrMultiple { desired_fps: 24. };
        assert_eq!(layer_score(vote, &rates[0], ConfigId(0), ConfigId(1)), 0.);
        assert!(layer_score(vote, &rates[1], ConfigId(0), ConfigId(1)) > 0.9);

        let vote = LayerVote::Heuristic { desired_fps: 24. };
        assert_relative_eq!(layer_score(vote, &rates[0], ConfigId(0), ConfigId(1)), 0.5);
    }

    #[test]
    fn cadence_scores() {
        let rate = |fps| RefreshRate::new(&config(0, GROUP_0, fps));

        assert_relative_eq!(cadence_score(60., &rate(60.), true), 1.);
        assert_relative_eq!(cadence_score(24., &rate(30.), true), 1. / 3.);
        assert_relative_eq!(cadence_score(24., &rate(90.), true), 1. / 3.);
        assert_relative_eq!(cadence_score(0., &rate(60.), true), 0.);
    }

    #[test]
    fn equal_scores_prefer_higher_fps() {
        let configs = table_of(&[30., 90.]);
        // 24fps lands on a 1/3 cadence on both.
        let best = configs.refresh_rate_for_content_v2(&[heuristic(24.)], false);
        assert_eq!(best.name, "90fps");
    }

    #[test]
    fn equal_fps_prefers_lower_config_id() {
        let configs = RefreshRateConfigs::new(
            &[config(3, GROUP_0, 60.), config(1, GROUP_0, 60.)],
            ConfigId(3),
        )
        .unwrap();
        let best = configs.refresh_rate_for_content_v2(&[heuristic(60.)], false);
        assert_eq!(best.config_id, ConfigId(1));
    }

    #[test]
    #[allow(deprecated)]
    fn legacy_content_matching() {
        let configs = table_of(&[30., 60., 72., 90.]);

        let best = configs.refresh_rate_for_content(&[heuristic(24.)]);
        assert_eq!(best.name, "72fps");

        let best = configs.refresh_rate_for_content(&[heuristic(60.), layer(LayerVote::Max)]);
        assert_eq!(best.name, "90fps");

        let best = configs.refresh_rate_for_content(&[layer(LayerVote::Min)]);
        assert_eq!(best.name, "30fps");

        let best = configs.refresh_rate_for_content(&[heuristic(45.), heuristic(75.)]);
        assert_eq!(best.name, "60fps");
    }

    proptest! {
        #[test]
        fn equal_policy_bounds_give_equal_rates(
            fps in prop::collection::vec(20u32..240, 1..8),
            pick in any::<prop::sample::Index>(),
        ) {
            let configs: Vec<_> = fps
                .iter()
                .enumerate()
                .map(|(id, fps)| config(id, GROUP_0, *fps as f32))
                .collect();
            let table = RefreshRateConfigs::new(&configs, ConfigId(0)).unwrap();

            let default = configs[pick.index(configs.len())].config_id;
            let fps = table.refresh_rate_from_config_id(default).unwrap().fps;
            table.set_policy(default, fps, fps).unwrap();

            prop_assert_eq!(
                table.min_refresh_rate_by_policy(),
                table.max_refresh_rate_by_policy()
            );
        }

        #[test]
        fn choice_is_always_allowed(
            fps in prop::collection::vec(20u32..240, 1..8),
            desired in 1f32..300.,
            touch in any::<bool>(),
        ) {
            let configs: Vec<_> = fps
                .iter()
                .enumerate()
                .map(|(id, fps)| config(id, GROUP_0, *fps as f32))
                .collect();
            let table = RefreshRateConfigs::new(&configs, ConfigId(0)).unwrap();

            let best = table.refresh_rate_for_content_v2(&[heuristic(desired)], touch);
            prop_assert!(table.is_config_allowed(best.config_id));
        }
    }
}
