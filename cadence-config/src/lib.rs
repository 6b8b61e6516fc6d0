//! KDL configuration for the cadence scheduling and input dispatch core.
//!
//! Every section is optional. Missing nodes fall back to the defaults listed on each field, which
//! are also what `Default` produces, so an empty document and `Config::default()` are equal.

use std::ffi::OsStr;
use std::path::Path;

use miette::{Context, IntoDiagnostic};
use tracing::debug;

pub const DEFAULT_HISTORY_SIZE: u32 = 20;
pub const DEFAULT_MIN_SAMPLES: u32 = 6;
pub const DEFAULT_OUTLIER_TOLERANCE_PERCENT: u32 = 25;
pub const DEFAULT_PENDING_FENCE_LIMIT: u32 = 20;
pub const DEFAULT_PHASE_OFFSET_NS: i64 = 1_000_000;
pub const DEFAULT_DISPATCHING_TIMEOUT_MS: u32 = 5000;
pub const DEFAULT_KEY_REPEAT_TIMEOUT_MS: u32 = 500;
pub const DEFAULT_KEY_REPEAT_DELAY_MS: u32 = 50;

#[derive(knuffel::Decode, Debug, Default, Clone, PartialEq)]
pub struct Config {
    #[knuffel(child, default)]
    pub scheduler: Scheduler,
    #[knuffel(child, default)]
    pub vsync: Vsync,
    #[knuffel(child, default)]
    pub phase_offsets: PhaseOffsets,
    #[knuffel(child, default)]
    pub dispatcher: Dispatcher,
}

#[derive(knuffel::Decode, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Scheduler {
    /// Idle timer interval; the timer is disabled when unset.
    #[knuffel(child, unwrap(argument))]
    pub idle_timer_ms: Option<u32>,
    #[knuffel(child, unwrap(argument))]
    pub touch_timer_ms: Option<u32>,
    #[knuffel(child, unwrap(argument))]
    pub display_power_timer_ms: Option<u32>,
    /// The idle timer is implemented by the display kernel driver.
    #[knuffel(child)]
    pub kernel_idle_timer: bool,
    #[knuffel(child)]
    pub content_detection_off: bool,
}

#[derive(knuffel::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vsync {
    #[knuffel(child, unwrap(argument), default = DEFAULT_HISTORY_SIZE)]
    pub history_size: u32,
    #[knuffel(child, unwrap(argument), default = DEFAULT_MIN_SAMPLES)]
    pub min_samples: u32,
    #[knuffel(child, unwrap(argument), default = DEFAULT_OUTLIER_TOLERANCE_PERCENT)]
    pub outlier_tolerance_percent: u32,
    #[knuffel(child, unwrap(argument), default = DEFAULT_PENDING_FENCE_LIMIT)]
    pub pending_fence_limit: u32,
}

impl Default for Vsync {
    fn default() -> Self {
        Self {
            history_size: DEFAULT_HISTORY_SIZE,
            min_samples: DEFAULT_MIN_SAMPLES,
            outlier_tolerance_percent: DEFAULT_OUTLIER_TOLERANCE_PERCENT,
            pending_fence_limit: DEFAULT_PENDING_FENCE_LIMIT,
        }
    }
}

#[derive(knuffel::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseOffsets {
    #[knuffel(child, unwrap(argument), default = DEFAULT_PHASE_OFFSET_NS)]
    pub late_sf_ns: i64,
    #[knuffel(child, unwrap(argument), default = DEFAULT_PHASE_OFFSET_NS)]
    pub late_app_ns: i64,
    #[knuffel(child, unwrap(argument))]
    pub early_sf_ns: Option<i64>,
    #[knuffel(child, unwrap(argument))]
    pub early_app_ns: Option<i64>,
    #[knuffel(child, unwrap(argument))]
    pub early_gl_sf_ns: Option<i64>,
    #[knuffel(child, unwrap(argument))]
    pub early_gl_app_ns: Option<i64>,
    #[knuffel(child, unwrap(argument), default = DEFAULT_PHASE_OFFSET_NS)]
    pub high_fps_late_sf_ns: i64,
    #[knuffel(child, unwrap(argument), default = DEFAULT_PHASE_OFFSET_NS)]
    pub high_fps_late_app_ns: i64,
    #[knuffel(child, unwrap(argument))]
    pub high_fps_early_sf_ns: Option<i64>,
    #[knuffel(child, unwrap(argument))]
    pub high_fps_early_app_ns: Option<i64>,
    #[knuffel(child, unwrap(argument))]
    pub high_fps_early_gl_sf_ns: Option<i64>,
    #[knuffel(child, unwrap(argument))]
    pub high_fps_early_gl_app_ns: Option<i64>,
    #[knuffel(child, unwrap(argument), default = DEFAULT_PHASE_OFFSET_NS)]
    pub threshold_for_next_vsync_ns: i64,
}

impl Default for PhaseOffsets {
    fn default() -> Self {
        Self {
            late_sf_ns: DEFAULT_PHASE_OFFSET_NS,
            late_app_ns: DEFAULT_PHASE_OFFSET_NS,
            early_sf_ns: None,
            early_app_ns: None,
            early_gl_sf_ns: None,
            early_gl_app_ns: None,
            high_fps_late_sf_ns: DEFAULT_PHASE_OFFSET_NS,
            high_fps_late_app_ns: DEFAULT_PHASE_OFFSET_NS,
            high_fps_early_sf_ns: None,
            high_fps_early_app_ns: None,
            high_fps_early_gl_sf_ns: None,
            high_fps_early_gl_app_ns: None,
            threshold_for_next_vsync_ns: DEFAULT_PHASE_OFFSET_NS,
        }
    }
}

#[derive(knuffel::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatcher {
    /// Default time a window gets to acknowledge an event before it is reported as not
    /// responding. Windows and applications may override it.
    #[knuffel(child, unwrap(argument), default = DEFAULT_DISPATCHING_TIMEOUT_MS)]
    pub dispatching_timeout_ms: u32,
    #[knuffel(child, unwrap(argument), default = DEFAULT_KEY_REPEAT_TIMEOUT_MS)]
    pub key_repeat_timeout_ms: u32,
    #[knuffel(child, unwrap(argument), default = DEFAULT_KEY_REPEAT_DELAY_MS)]
    pub key_repeat_delay_ms: u32,
    #[knuffel(child)]
    pub key_repeat_off: bool,
    #[knuffel(child)]
    pub touch_mode_off: bool,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self {
            dispatching_timeout_ms: DEFAULT_DISPATCHING_TIMEOUT_MS,
            key_repeat_timeout_ms: DEFAULT_KEY_REPEAT_TIMEOUT_MS,
            key_repeat_delay_ms: DEFAULT_KEY_REPEAT_DELAY_MS,
            key_repeat_off: false,
            touch_mode_off: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> miette::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .into_diagnostic()
            .with_context(|| format!("error reading {path:?}"))?;

        let config = Self::parse(
            path.file_name()
                .and_then(OsStr::to_str)
                .unwrap_or("config.kdl"),
            &contents,
        )
        .context("error parsing")?;
        debug!("loaded config from {path:?}");
        Ok(config)
    }

    pub fn parse(filename: &str, text: &str) -> Result<Self, knuffel::Error> {
        let _span = tracy_client::span!("Config::parse");
        knuffel::parse(filename, text)
    }
}
