//! Refresh rate scheduling.
//!
//! The [`Scheduler`] ties the vsync model, the layer history and the refresh rate policy table
//! together. It owns the idle, touch and display power timers, keeps hardware vsync enabled only
//! while the vsync model needs samples, and tells the composition engine through
//! [`SchedulerCallback`] whenever the display should run at a different config.
//!
//! Two locks guard its state: one for the feature flags that drive refresh rate decisions and
//! one for hardware vsync bookkeeping. Neither is held while calling back out.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, trace};

use crate::display::{DisplayContext, DisplayRegistry, Orientation, PhysicalDisplayId};
use crate::stats::TimeStats;
use crate::utils::{Clock, Nsecs, NS_PER_MS};

pub mod event_thread;
pub mod layer_history;
pub mod phase_offsets;
pub mod refresh_rate;
pub mod timer;
pub mod vsync;


pub use event_thread::{ConnectionHandle, EventThread};
use event_thread::Connections;
use layer_history::{LayerHistory, LayerId};
use phase_offsets::{OffsetSet, PhaseOffsets};
use refresh_rate::{ConfigId, LayerRequirement, LayerVote, RefreshRate, RefreshRateConfigs};
use timer::OneShotTimer;
use vsync::{HwVsyncControl, PresentFence, VsyncSource};

/// Resync requests closer together than this are dropped.
const IGNORE_RESYNC_DELAY: Nsecs = 750 * NS_PER_MS;

/// A vsync period change is assumed to have applied at most this long after it was reported.
const MAX_VSYNC_APPLIED_TIME: Nsecs = 200 * NS_PER_MS;

/// Above this rate the kernel idle timer leaves hardware vsync on.
const FPS_THRESHOLD_FOR_KERNEL_TIMER: f32 = 65.;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub idle_timer: Option<Duration>,
    pub touch_timer: Option<Duration>,
    pub display_power_timer: Option<Duration>,
    /// The idle timer is implemented by the display driver and also tracks touch.
    pub kernel_idle_timer: bool,
    pub content_detection: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&cadence_config::Scheduler::default())
    }
}

impl From<&cadence_config::Scheduler> for SchedulerSettings {
    fn from(config: &cadence_config::Scheduler) -> Self {
        let ms = |ms: Option<u32>| ms.map(|ms| Duration::from_millis(u64::from(ms)));
        Self {
            idle_timer: ms(config.idle_timer_ms),
            touch_timer: ms(config.touch_timer_ms),
            display_power_timer: ms(config.display_power_timer_ms),
            kernel_idle_timer: config.kernel_idle_timer,
            content_detection: !config.content_detection_off,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Reset,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchState {
    Inactive,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentDetectionState {
    Off,
    On,
}

/// Whether a refresh rate change should be negotiated with the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEvent {
    None,
    Changed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Normal,
    Wallpaper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayStatInfo {
    pub vsync_time: Nsecs,
    pub vsync_period: Nsecs,
}

/// Acknowledgment of a vsync period switch from the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsyncPeriodChangeTimeline {
    pub new_vsync_applied_time: Nsecs,
    pub refresh_required: bool,
    pub refresh_time: Nsecs,
}

/// What the scheduler asks of the composition engine.
pub trait SchedulerCallback: Send + Sync {
    fn change_refresh_rate(&self, rate: &RefreshRate, event: ConfigEvent);
    fn repaint_everything_for_hwc(&self);
    fn kernel_timer_changed(&self, expired: bool);
}

/// External collaborators of the [`Scheduler`].
pub struct SchedulerDeps {
    pub callback: Arc<dyn SchedulerCallback>,
    pub vsync: Arc<dyn VsyncSource>,
    pub hw_vsync: Arc<dyn HwVsyncControl>,
    pub time_stats: Arc<dyn TimeStats>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug)]
struct FeatureState {
    content_detection: ContentDetectionState,
    idle_timer: TimerState,
    touch: TouchState,
    display_power_timer: TimerState,
    is_display_power_state_normal: bool,
    /// Rounded content rate from the last layer history summary.
    content_refresh_rate: u32,
    layer_requirements: Vec<LayerRequirement>,
    config_id: ConfigId,
}

#[derive(Debug, Default)]
struct HwVsyncState {
    enabled: bool,
    available: bool,
}

#[derive(Debug)]
struct RateStats {
    fps: f32,
    since: Nsecs,
}

#[derive(Default)]
struct Timers {
    idle: Option<OneShotTimer>,
    touch: Option<OneShotTimer>,
    display_power: Option<OneShotTimer>,
}

pub struct Scheduler {
    settings: SchedulerSettings,
    phase_offsets: PhaseOffsets,
    refresh_rate_configs: Arc<RefreshRateConfigs>,
    callback: Arc<dyn SchedulerCallback>,
    vsync: Arc<dyn VsyncSource>,
    hw_vsync: Arc<dyn HwVsyncControl>,
    time_stats: Arc<dyn TimeStats>,
    clock: Arc<dyn Clock>,

    features: Mutex<FeatureState>,
    hw_vsync_state: Mutex<HwVsyncState>,
    last_resync_time: AtomicI64,
    vsync_timeline: Mutex<Option<VsyncPeriodChangeTimeline>>,
    rate_stats: Mutex<RateStats>,

    layer_history: Mutex<LayerHistory>,
    connections: Mutex<Connections>,
    displays: Mutex<DisplayRegistry>,
    timers: Mutex<Timers>,
}

impl Scheduler {
    /// Creates the scheduler and starts the configured timers.
    pub fn new(
        settings: SchedulerSettings,
        phase_offsets: PhaseOffsets,
        refresh_rate_configs: Arc<RefreshRateConfigs>,
        deps: SchedulerDeps,
    ) -> anyhow::Result<Arc<Self>> {
        let current = refresh_rate_configs.current_refresh_rate();
        let now = deps.clock.now();

        let scheduler = Arc::new(Self {
            settings,
            phase_offsets,
            refresh_rate_configs,
            callback: deps.callback,
            vsync: deps.vsync,
            hw_vsync: deps.hw_vsync,
            time_stats: deps.time_stats,
            clock: deps.clock,
            features: Mutex::new(FeatureState {
                content_detection: ContentDetectionState::Off,
                idle_timer: TimerState::Reset,
                touch: TouchState::Inactive,
                display_power_timer: TimerState::Expired,
                is_display_power_state_normal: true,
                content_refresh_rate: 0,
                layer_requirements: Vec::new(),
                config_id: current.config_id,
            }),
            hw_vsync_state: Mutex::new(HwVsyncState::default()),
            last_resync_time: AtomicI64::new(Nsecs::MIN),
            vsync_timeline: Mutex::new(None),
            rate_stats: Mutex::new(RateStats {
                fps: current.fps,
                since: now,
            }),
            layer_history: Mutex::new(LayerHistory::new()),
            connections: Mutex::new(Connections::default()),
            displays: Mutex::new(DisplayRegistry::new()),
            timers: Mutex::new(Timers::default()),
        });

        scheduler.start_timers()?;
        Ok(scheduler)
    }

    fn start_timers(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut timers = self.timers.lock().unwrap();

        if let Some(interval) = self.settings.idle_timer {
            let kernel = self.settings.kernel_idle_timer;
            let callback = move |state| {
                move |this: &Self| {
                    if kernel {
                        this.kernel_idle_timer_callback(state);
                    } else {
                        this.idle_timer_callback(state);
                    }
                }
            };
            timers.idle = Some(OneShotTimer::start(
                "idle",
                interval,
                self.timer_callback(callback(TimerState::Reset)),
                self.timer_callback(callback(TimerState::Expired)),
            )?);
        }

        if let Some(interval) = self.settings.touch_timer {
            timers.touch = Some(OneShotTimer::start(
                "touch",
                interval,
                self.timer_callback(|this| this.touch_timer_callback(TimerState::Reset)),
                self.timer_callback(|this| this.touch_timer_callback(TimerState::Expired)),
            )?);
        }

        if let Some(interval) = self.settings.display_power_timer {
            timers.display_power = Some(OneShotTimer::start(
                "display power",
                interval,
                self.timer_callback(|this| this.display_power_timer_callback(TimerState::Reset)),
                self.timer_callback(|this| {
                    this.display_power_timer_callback(TimerState::Expired)
                }),
            )?);
        }

        Ok(())
    }

    fn timer_callback(
        self: &Arc<Self>,
        f: impl Fn(&Self) + Send + 'static,
    ) -> timer::TimerCallback {
        let weak: Weak<Self> = Arc::downgrade(self);
        Box::new(move || {
            if let Some(this) = weak.upgrade() {
                f(&this);
            }
        })
    }

    pub fn refresh_rate_configs(&self) -> &Arc<RefreshRateConfigs> {
        &self.refresh_rate_configs
    }

    // ===========================================================================================
    // Connections
    // ===========================================================================================

    pub fn create_connection(&self, name: &str, thread: Box<dyn EventThread>) -> ConnectionHandle {
        self.connections.lock().unwrap().insert(name, thread)
    }

    pub fn connection_name(&self, handle: ConnectionHandle) -> Option<String> {
        self.connections
            .lock()
            .unwrap()
            .name(handle)
            .map(str::to_owned)
    }

    pub fn on_screen_acquired(&self, handle: ConnectionHandle) {
        self.connections
            .lock()
            .unwrap()
            .with(handle, |thread| thread.on_screen_acquired());
    }

    pub fn on_screen_released(&self, handle: ConnectionHandle) {
        self.connections
            .lock()
            .unwrap()
            .with(handle, |thread| thread.on_screen_released());
    }

    /// Forwards a hotplug event. Repeated events with the same state are dropped.
    pub fn on_hotplug_received(
        &self,
        handle: ConnectionHandle,
        display_id: PhysicalDisplayId,
        connected: bool,
    ) {
        if !self
            .displays
            .lock()
            .unwrap()
            .set_connected(display_id, connected)
        {
            debug!("display {display_id} already has connected={connected}");
            return;
        }

        self.connections
            .lock()
            .unwrap()
            .with(handle, |thread| thread.on_hotplug_received(display_id, connected));
    }

    pub fn on_config_changed(
        &self,
        handle: ConnectionHandle,
        display: PhysicalDisplayId,
        config: ConfigId,
    ) {
        self.connections
            .lock()
            .unwrap()
            .with(handle, |thread| thread.on_config_changed(display, config));
    }

    pub fn set_phase_offset(&self, handle: ConnectionHandle, offset: Nsecs) {
        self.connections
            .lock()
            .unwrap()
            .with(handle, |thread| thread.set_phase_offset(offset));
    }

    pub fn set_display_orientation(&self, display_id: PhysicalDisplayId, orientation: Orientation) {
        if self
            .displays
            .lock()
            .unwrap()
            .set_orientation(display_id, orientation)
        {
            debug!("display {display_id} orientation changed to {orientation:?}");
        }
    }

    pub fn display_context(&self, display: PhysicalDisplayId) -> Option<DisplayContext> {
        self.displays.lock().unwrap().get(display)
    }

    pub fn primary_display(&self) -> Option<DisplayContext> {
        self.displays.lock().unwrap().primary()
    }

    // ===========================================================================================
    // Vsync
    // ===========================================================================================

    pub fn get_display_stat_info(&self) -> DisplayStatInfo {
        DisplayStatInfo {
            vsync_time: self.vsync.compute_next_refresh(0),
            vsync_period: self.vsync.period(),
        }
    }

    pub fn expected_present_time(&self) -> Nsecs {
        self.vsync.expected_present_time()
    }

    pub fn current_phase_offsets(&self) -> OffsetSet {
        let fps = self.refresh_rate_configs.current_refresh_rate().fps;
        self.phase_offsets.offsets_for_refresh_rate(fps)
    }

    pub fn phase_offsets(&self) -> &PhaseOffsets {
        &self.phase_offsets
    }

    pub fn is_hardware_vsync_enabled(&self) -> bool {
        self.hw_vsync_state.lock().unwrap().enabled
    }

    pub fn enable_hardware_vsync(&self) {
        let mut state = self.hw_vsync_state.lock().unwrap();
        if !state.enabled && state.available {
            trace!("enabling hardware vsync");
            self.vsync.enable();
            self.hw_vsync.set_vsync_enabled(true);
            state.enabled = true;
        }
    }

    pub fn disable_hardware_vsync(&self, make_unavailable: bool) {
        let mut state = self.hw_vsync_state.lock().unwrap();
        if state.enabled {
            trace!("disabling hardware vsync");
            self.hw_vsync.set_vsync_enabled(false);
            self.vsync.disable();
            state.enabled = false;
        }
        if make_unavailable {
            state.available = false;
        }
    }

    pub fn resync_to_hardware_vsync(&self, make_available: bool, period: Nsecs) {
        {
            let mut state = self.hw_vsync_state.lock().unwrap();
            if make_available {
                state.available = true;
            } else if !state.available {
                return;
            }
        }

        if period <= 0 {
            return;
        }

        self.set_vsync_period(period);
    }

    /// Resyncs to hardware vsync at the current config's period, at most once per 750ms.
    pub fn resync(&self) {
        let now = self.clock.now();
        let last = self.last_resync_time.swap(now, Ordering::AcqRel);
        let since_last = now.saturating_sub(last);
        if since_last > IGNORE_RESYNC_DELAY {
            let period = self.refresh_rate_configs.current_refresh_rate().vsync_period;
            self.resync_to_hardware_vsync(false, period);
        } else {
            trace!("ignoring resync {since_last}ns after the previous one");
        }
    }

    fn set_vsync_period(&self, period: Nsecs) {
        let mut state = self.hw_vsync_state.lock().unwrap();
        self.vsync.set_period(period);

        if !state.enabled {
            self.vsync.enable();
            self.hw_vsync.set_vsync_enabled(true);
            state.enabled = true;
        }
    }

    /// Feeds a hardware vsync sample. Returns whether a pending period change took effect.
    pub fn add_resync_sample(&self, timestamp: Nsecs) -> bool {
        let _span = tracy_client::span!("Scheduler::add_resync_sample");

        let mut needs_hw_vsync = false;
        let mut period_flushed = false;
        {
            let state = self.hw_vsync_state.lock().unwrap();
            if state.enabled {
                let outcome = self.vsync.add_resync_sample(timestamp);
                needs_hw_vsync = outcome.needs_hw_vsync;
                period_flushed = outcome.period_flushed;
            }
        }

        if needs_hw_vsync {
            self.enable_hardware_vsync();
        } else {
            self.disable_hardware_vsync(false);
        }

        period_flushed
    }

    pub fn add_present_fence(&self, fence: Arc<PresentFence>) {
        if self.vsync.add_present_fence(fence) {
            self.enable_hardware_vsync();
        } else {
            self.disable_hardware_vsync(false);
        }
    }

    pub fn set_ignore_present_fences(&self, ignore: bool) {
        self.vsync.set_ignore_present_fences(ignore);
    }

    pub fn on_new_vsync_period_change_timeline(&self, timeline: VsyncPeriodChangeTimeline) {
        if timeline.refresh_required {
            self.callback.repaint_everything_for_hwc();
        }

        let max_applied_time = self.clock.now() + MAX_VSYNC_APPLIED_TIME;
        let mut timeline = timeline;
        if timeline.new_vsync_applied_time > max_applied_time {
            debug!(
                "clamping vsync applied time {} to {max_applied_time}",
                timeline.new_vsync_applied_time
            );
            timeline.new_vsync_applied_time = max_applied_time;
        }

        *self.vsync_timeline.lock().unwrap() = Some(timeline);
    }

    pub fn last_vsync_period_change_timeline(&self) -> Option<VsyncPeriodChangeTimeline> {
        *self.vsync_timeline.lock().unwrap()
    }

    pub fn on_display_refreshed(&self, timestamp: Nsecs) {
        let mut repaint = false;
        {
            let mut timeline = self.vsync_timeline.lock().unwrap();
            if let Some(timeline) = timeline.as_mut().filter(|t| t.refresh_required) {
                if timeline.refresh_time < timestamp {
                    timeline.refresh_required = false;
                } else {
                    // The refresh is still in the future.
                    repaint = true;
                }
            }
        }

        if repaint {
            self.callback.repaint_everything_for_hwc();
        }
    }

    // ===========================================================================================
    // Layer history
    // ===========================================================================================

    pub fn register_layer(&self, id: LayerId, name: &str, kind: LayerKind) {
        let min_fps = self.refresh_rate_configs.min_refresh_rate().fps;
        let max_fps = self.refresh_rate_configs.max_refresh_rate().fps;

        let mut history = self.layer_history.lock().unwrap();
        match kind {
            LayerKind::Wallpaper => {
                history.register_layer(id, name, min_fps, min_fps);
                history.set_layer_vote(id, Some(LayerVote::Min));
            }
            LayerKind::Normal => {
                history.register_layer(id, name, min_fps, max_fps);
                if !self.settings.content_detection {
                    history.set_layer_vote(id, Some(LayerVote::Max));
                }
            }
        }
    }

    pub fn unregister_layer(&self, id: LayerId) {
        self.layer_history.lock().unwrap().unregister_layer(id);
    }

    pub fn set_layer_vote(&self, id: LayerId, vote: Option<LayerVote>) {
        self.layer_history.lock().unwrap().set_layer_vote(id, vote);
    }

    pub fn set_layer_weight(&self, id: LayerId, weight: f32) {
        self.layer_history
            .lock()
            .unwrap()
            .set_layer_weight(id, weight);
    }

    pub fn record_layer_history(&self, id: LayerId, present_time: Nsecs, now: Nsecs) {
        if !self.settings.content_detection {
            return;
        }
        self.layer_history
            .lock()
            .unwrap()
            .record(id, present_time, now);
    }

    /// Polls the layer history and switches config if the content asks for it.
    pub fn choose_refresh_rate_for_content(&self) {
        let _span = tracy_client::span!("Scheduler::choose_refresh_rate_for_content");

        if !self.settings.content_detection {
            return;
        }

        let now = self.clock.now();
        let (content_fps, requirements) = {
            let mut history = self.layer_history.lock().unwrap();
            (history.summarize(now), history.requirements(now))
        };
        let content_refresh_rate = content_fps.round() as u32;

        let new_rate = {
            let mut features = self.features.lock().unwrap();
            if features.content_refresh_rate == content_refresh_rate
                && features.layer_requirements == requirements
            {
                return;
            }

            trace!("content refresh rate {content_refresh_rate}fps");
            features.content_refresh_rate = content_refresh_rate;
            features.content_detection = if requirements.is_empty() {
                ContentDetectionState::Off
            } else {
                ContentDetectionState::On
            };
            features.layer_requirements = requirements;

            let new_config = self.calculate_refresh_rate_type(&features);
            if features.config_id == new_config {
                return;
            }
            features.config_id = new_config;
            self.refresh_rate_configs
                .refresh_rate_from_config_id(new_config)
        };

        if let Some(rate) = new_rate {
            self.notify_refresh_rate_change(&rate, ConfigEvent::Changed);
        }
    }

    pub fn content_refresh_rate(&self) -> u32 {
        self.features.lock().unwrap().content_refresh_rate
    }

    // ===========================================================================================
    // Timers and power state
    // ===========================================================================================

    pub fn reset_idle_timer(&self) {
        if let Some(timer) = &self.timers.lock().unwrap().idle {
            timer.reset();
        }
    }

    pub fn notify_touch_event(&self) {
        let timers = self.timers.lock().unwrap();
        if let Some(touch) = &timers.touch {
            touch.reset();

            if self.settings.kernel_idle_timer {
                if let Some(idle) = &timers.idle {
                    idle.reset();
                }
            }
        }
    }

    pub fn set_display_power_state(&self, normal: bool) {
        self.features.lock().unwrap().is_display_power_state_normal = normal;

        if let Some(timer) = &self.timers.lock().unwrap().display_power {
            timer.reset();
        }

        // Power changes boost the rate; start content detection over.
        self.layer_history.lock().unwrap().clear();
    }

    pub fn idle_timer_callback(&self, state: TimerState) {
        self.handle_timer_state_changed(|f| &mut f.idle_timer, state, false);
    }

    pub fn touch_timer_callback(&self, state: TimerState) {
        let touch = match state {
            TimerState::Reset => TouchState::Active,
            TimerState::Expired => TouchState::Inactive,
        };

        if self.handle_timer_state_changed(|f| &mut f.touch, touch, true)
            && touch == TouchState::Active
        {
            self.layer_history.lock().unwrap().clear();
        }
    }

    pub fn display_power_timer_callback(&self, state: TimerState) {
        self.handle_timer_state_changed(|f| &mut f.display_power_timer, state, true);
    }

    pub fn kernel_idle_timer_callback(&self, state: TimerState) {
        let rate = self.refresh_rate_configs.current_refresh_rate();

        match state {
            TimerState::Reset if rate.fps > FPS_THRESHOLD_FOR_KERNEL_TIMER => {
                self.resync_to_hardware_vsync(true, rate.vsync_period);
            }
            TimerState::Expired if rate.fps <= FPS_THRESHOLD_FOR_KERNEL_TIMER => {
                // Nothing is being pushed, so the vsync model does not need hardware samples.
                self.disable_hardware_vsync(false);
            }
            _ => (),
        }

        self.callback
            .kernel_timer_changed(state == TimerState::Expired);
    }

    /// Updates one feature flag and switches config if the decision changes.
    ///
    /// Returns whether the flag changed.
    fn handle_timer_state_changed<T: PartialEq + std::fmt::Debug>(
        &self,
        field: impl FnOnce(&mut FeatureState) -> &mut T,
        new_state: T,
        event_on_content_detection: bool,
    ) -> bool {
        let _span = tracy_client::span!("Scheduler::handle_timer_state_changed");

        let (rate, event) = {
            let mut features = self.features.lock().unwrap();
            let current = field(&mut features);
            if *current == new_state {
                return false;
            }
            trace!("feature state {current:?} -> {new_state:?}");
            *current = new_state;

            let new_config = self.calculate_refresh_rate_type(&features);
            if features.config_id == new_config {
                return true;
            }
            features.config_id = new_config;

            let event = if event_on_content_detection
                && features.content_detection == ContentDetectionState::On
            {
                ConfigEvent::Changed
            } else {
                ConfigEvent::None
            };
            (
                self.refresh_rate_configs
                    .refresh_rate_from_config_id(new_config),
                event,
            )
        };

        if let Some(rate) = rate {
            self.notify_refresh_rate_change(&rate, event);
        }
        true
    }

    fn calculate_refresh_rate_type(&self, features: &FeatureState) -> ConfigId {
        let configs = &self.refresh_rate_configs;

        if !configs.refresh_rate_switching_supported() {
            return configs.current_refresh_rate().config_id;
        }

        // Performance bias while the display power state changes.
        if !features.is_display_power_state_normal
            || features.display_power_timer == TimerState::Reset
        {
            return configs.max_refresh_rate_by_policy().config_id;
        }

        if features.touch == TouchState::Active {
            return configs.max_refresh_rate_by_policy().config_id;
        }

        if features.idle_timer == TimerState::Expired {
            return configs.min_refresh_rate_by_policy().config_id;
        }

        if features.content_detection == ContentDetectionState::Off {
            return configs.max_refresh_rate_by_policy().config_id;
        }

        configs
            .refresh_rate_for_content_v2(
                &features.layer_requirements,
                features.touch == TouchState::Active,
            )
            .config_id
    }

    /// The config the scheduler currently wants the display at.
    pub fn preferred_config_id(&self) -> ConfigId {
        self.features.lock().unwrap().config_id
    }

    fn notify_refresh_rate_change(&self, rate: &RefreshRate, event: ConfigEvent) {
        let now = self.clock.now();
        {
            let mut stats = self.rate_stats.lock().unwrap();
            self.time_stats
                .record_refresh_rate(stats.fps, now - stats.since);
            stats.fps = rate.fps;
            stats.since = now;
        }

        debug!("changing refresh rate to {} ({event:?})", rate.name);
        self.callback.change_refresh_rate(rate, event);
    }
}
