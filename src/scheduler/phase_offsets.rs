//! Vsync phase offsets for the composition and app wakeups.

use crate::utils::Nsecs;

/// Rates above this use the high fps offsets.
const HIGH_FPS_THRESHOLD: f32 = 65.;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offsets {
    pub sf: Nsecs,
    pub app: Nsecs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetSet {
    pub early: Offsets,
    pub early_gl: Offsets,
    pub late: Offsets,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseOffsets {
    default: OffsetSet,
    high_fps: OffsetSet,
    threshold_for_next_vsync: Nsecs,
}

impl Default for PhaseOffsets {
    fn default() -> Self {
        Self::from(&cadence_config::PhaseOffsets::default())
    }
}

impl From<&cadence_config::PhaseOffsets> for PhaseOffsets {
    fn from(config: &cadence_config::PhaseOffsets) -> Self {
        let late = Offsets {
            sf: config.late_sf_ns,
            app: config.late_app_ns,
        };
        let default = OffsetSet {
            early: Offsets {
                sf: config.early_sf_ns.unwrap_or(late.sf),
                app: config.early_app_ns.unwrap_or(late.app),
            },
            early_gl: Offsets {
                sf: config.early_gl_sf_ns.unwrap_or(late.sf),
                app: config.early_gl_app_ns.unwrap_or(late.app),
            },
            late,
        };

        let high_late = Offsets {
            sf: config.high_fps_late_sf_ns,
            app: config.high_fps_late_app_ns,
        };
        let high_fps = OffsetSet {
            early: Offsets {
                sf: config.high_fps_early_sf_ns.unwrap_or(high_late.sf),
                app: config.high_fps_early_app_ns.unwrap_or(high_late.app),
            },
            early_gl: Offsets {
                sf: config.high_fps_early_gl_sf_ns.unwrap_or(high_late.sf),
                app: config.high_fps_early_gl_app_ns.unwrap_or(high_late.app),
            },
            late: high_late,
        };

        Self {
            default,
            high_fps,
            threshold_for_next_vsync: config.threshold_for_next_vsync_ns,
        }
    }
}

impl PhaseOffsets {
    pub fn offsets_for_refresh_rate(&self, fps: f32) -> OffsetSet {
        if fps > HIGH_FPS_THRESHOLD {
            self.high_fps
        } else {
            self.default
        }
    }

    /// Offsets closer to the next vsync than this target the vsync after it.
    pub fn threshold_for_next_vsync(&self) -> Nsecs {
        self.threshold_for_next_vsync
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_debug_snapshot;

    use super::*;

    #[test]
    fn early_falls_back_to_late() {
        let config = cadence_config::PhaseOffsets {
            late_sf_ns: 6_000_000,
            late_app_ns: 2_000_000,
            early_sf_ns: Some(-3_000_000),
            ..Default::default()
        };
        let offsets = PhaseOffsets::from(&config).offsets_for_refresh_rate(60.);

        assert_eq!(
            offsets.early,
            Offsets {
                sf: -3_000_000,
                app: 2_000_000
            }
        );
    }

    #[test]
    fn early_gl_falls_back_to_late() {
        let config = cadence_config::PhaseOffsets {
            late_sf_ns: 6_000_000,
            late_app_ns: 2_000_000,
            early_gl_app_ns: Some(9_000_000),
            ..Default::default()
        };
        let offsets = PhaseOffsets::from(&config).offsets_for_refresh_rate(60.);

        assert_eq!(
            offsets.early_gl,
            Offsets {
                sf: 6_000_000,
                app: 9_000_000
            }
        );
    }

    #[test]
    fn high_fps_set_above_threshold() {
        let config = cadence_config::PhaseOffsets {
            late_sf_ns: 6_000_000,
            high_fps_late_sf_ns: 1_000_000,
            high_fps_late_app_ns: 500_000,
            high_fps_early_sf_ns: Some(-2_000_000),
            ..Default::default()
        };
        let offsets = PhaseOffsets::from(&config);

        assert_eq!(offsets.offsets_for_refresh_rate(65.).late.sf, 6_000_000);
        assert_debug_snapshot!(offsets.offsets_for_refresh_rate(90.), @r"
        OffsetSet {
            early: Offsets {
                sf: -2000000,
                app: 500000,
            },
            early_gl: Offsets {
                sf: 1000000,
                app: 500000,
            },
            late: Offsets {
                sf: 1000000,
                app: 500000,
            },
        }
        ");
    }
}
