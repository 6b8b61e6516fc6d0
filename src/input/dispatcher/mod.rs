//! Routes input events to windows.
//!
//! Producers push events into the inbound queue with the `notify_*` methods and
//! [`InputDispatcher::inject_input_event`]. [`InputDispatcher::dispatch_once`] drains it in order:
//! keys and non-pointer motions follow focus, pointer motions follow the per-display touch state,
//! and every event is published on the [`InputChannel`] of each target. An event that cannot be
//! routed yet (a key while the focused application has no focused window) stays at the head of
//! the queue and blocks everything behind it, so ordering is preserved.
//!
//! The dispatcher is single-threaded. [`thread::InputDispatcherThread`] runs it on a dedicated
//! thread with a `calloop` event loop.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::input::channel::{FocusEvent, InputChannel, Waker, DEAD_OBJECT};
use crate::input::event::{
    validate_key_event, validate_motion_event, DeviceId, DisplayId, IdGenerator, IdSource,
    InputEvent, KeyAction, KeyEvent, MotionAction, MotionEvent, PointerIdBits, PolicyFlags,
    Source,
};
use crate::input::window::{InputApplicationInfo, InputWindowInfo, Token, WindowHandle};
use crate::stats::{NoopTimeStats, TimeStats};
use crate::utils::{duration_to_ns, Clock, Nsecs, NS_PER_MS, NS_PER_SEC};

mod connection;
mod entry;
mod injection;
mod input_state;
pub mod policy;
mod resolver;
pub mod thread;
mod touch;


use connection::{Connection, ConnectionStatus};
use entry::{
    DispatchEvent, DropReason, EventEntry, FocusEntry, InputTarget, KeyEntry, MotionEntry,
    TargetFlags,
};
pub use injection::{
    prepare_injection, InjectionResult, InjectionWaiter, Injector, PreparedInjection, SyncMode,
};
use injection::{has_injection_permission, InjectionState, SharedInjectionState};
use input_state::{CancelMode, CancelOptions, SynthesizedEvent};
pub use policy::{AnrResponse, InputDispatcherPolicy};
use resolver::{find_focused_window, find_touched_window_at, FocusState};
pub use thread::{InputDispatcherHandle, InputDispatcherThread};
use touch::TouchState;

const BAD_VALUE: i32 = -22;
const NAME_NOT_FOUND: i32 = -2;

/// Key and motion events older than this are dropped instead of dispatched.
const STALE_EVENT_TIMEOUT: Nsecs = 10 * NS_PER_SEC;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    #[error("{0} is already registered")]
    AlreadyRegistered(Token),
    #[error("{0} is not registered")]
    UnknownToken(Token),
    #[error("no pointer stream is active on display {0}")]
    NoActiveStream(DisplayId),
    #[error("the channel of {0} is broken")]
    Broken(Token),
}

impl DispatchError {
    pub fn code(self) -> i32 {
        match self {
            DispatchError::AlreadyRegistered(_) | DispatchError::NoActiveStream(_) => BAD_VALUE,
            DispatchError::UnknownToken(_) => NAME_NOT_FOUND,
            DispatchError::Broken(_) => DEAD_OBJECT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherSettings {
    /// Used for windows and applications that do not set their own.
    pub dispatching_timeout: Duration,
    /// Delay before the first synthesized key repeat.
    pub key_repeat_timeout: Duration,
    /// Delay between subsequent repeats.
    pub key_repeat_delay: Duration,
    pub key_repeat_enabled: bool,
    pub in_touch_mode: bool,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from(&cadence_config::Dispatcher::default())
    }
}

impl From<&cadence_config::Dispatcher> for DispatcherSettings {
    fn from(config: &cadence_config::Dispatcher) -> Self {
        Self {
            dispatching_timeout: Duration::from_millis(config.dispatching_timeout_ms.into()),
            key_repeat_timeout: Duration::from_millis(config.key_repeat_timeout_ms.into()),
            key_repeat_delay: Duration::from_millis(config.key_repeat_delay_ms.into()),
            key_repeat_enabled: !config.key_repeat_off,
            in_touch_mode: !config.touch_mode_off,
        }
    }
}

#[derive(Debug, Default)]
struct KeyRepeatState {
    /// The last trusted key that went down.
    last_key: Option<KeyEvent>,
    /// `None` when the device repeats the key by itself.
    next_repeat_time: Option<Nsecs>,
}

impl KeyRepeatState {
    fn reset(&mut self) {
        self.last_key = None;
        self.next_repeat_time = None;
    }

    fn next_repeat_time(&self) -> Option<Nsecs> {
        self.last_key.as_ref().and(self.next_repeat_time)
    }
}

/// Whether the head of the inbound queue was handled.
enum Progress {
    Done,
    /// The entry stays at the head of the queue. Retry at the given time, or when something
    /// changes if there is none.
    Blocked(Option<Nsecs>),
}

enum FocusTargets {
    Found(Vec<InputTarget>),
    Pending(Option<Nsecs>),
    Failed(InjectionResult),
}

struct TouchTargets {
    result: InjectionResult,
    targets: Vec<InputTarget>,
    /// The new event contradicts the stream in progress.
    conflicting: bool,
}

pub struct InputDispatcher {
    settings: DispatcherSettings,
    policy: Arc<dyn InputDispatcherPolicy>,
    clock: Arc<dyn Clock>,
    time_stats: Arc<dyn TimeStats>,
    ids: IdGenerator,
    waker: Option<Waker>,

    inbound_queue: VecDeque<EventEntry>,
    connections: BTreeMap<Token, Connection>,
    /// Per display, ordered top to bottom.
    windows: BTreeMap<DisplayId, Vec<WindowHandle>>,
    focus: FocusState,
    touch_states: BTreeMap<DisplayId, TouchState>,
    global_monitors: BTreeMap<DisplayId, Vec<Token>>,
    gesture_monitors: BTreeMap<DisplayId, Vec<Token>>,

    key_repeat: KeyRepeatState,
    in_touch_mode: bool,
    input_filter_enabled: bool,

    /// When a key waiting for a focused window gives up.
    no_focused_window_timeout: Option<Nsecs>,
    /// The application that was given until `no_focused_window_timeout` to focus a window. Taken
    /// once it is reported as not responding.
    awaited_focused_application: Option<InputApplicationInfo>,
}

impl InputDispatcher {
    pub fn new(
        settings: DispatcherSettings,
        policy: Arc<dyn InputDispatcherPolicy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            policy,
            clock,
            time_stats: Arc::new(NoopTimeStats),
            ids: IdGenerator::new(IdSource::InputDispatcher),
            waker: None,
            inbound_queue: VecDeque::new(),
            connections: BTreeMap::new(),
            windows: BTreeMap::new(),
            focus: FocusState::default(),
            touch_states: BTreeMap::new(),
            global_monitors: BTreeMap::new(),
            gesture_monitors: BTreeMap::new(),
            key_repeat: KeyRepeatState::default(),
            in_touch_mode: settings.in_touch_mode,
            input_filter_enabled: false,
            no_focused_window_timeout: None,
            awaited_focused_application: None,
        }
    }

    pub fn with_time_stats(mut self, time_stats: Arc<dyn TimeStats>) -> Self {
        self.time_stats = time_stats;
        self
    }

    /// Called whenever a registered channel receives a finished signal or breaks.
    pub fn set_waker(&mut self, waker: Waker) {
        for connection in self.connections.values() {
            connection.channel.set_waker(waker.clone());
        }
        self.waker = Some(waker);
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    pub fn in_touch_mode(&self) -> bool {
        self.in_touch_mode
    }

    pub fn focused_display(&self) -> DisplayId {
        self.focus.focused_display
    }

    pub fn has_pending_inbound(&self) -> bool {
        !self.inbound_queue.is_empty()
    }

    /// Runs one dispatch pass and returns when the next one is due. `None` means nothing is
    /// scheduled: the next pass only needs to run after new input or a finished signal.
    pub fn dispatch_once(&mut self) -> Option<Nsecs> {
        let _span = tracy_client::span!("InputDispatcher::dispatch_once");

        let now = self.clock.now();
        self.poll_connections();

        self.process_anrs(now);
        let dispatch_wakeup = self.dispatch_inbound(now);
        let anr_wakeup = self.next_anr_time();

        match (anr_wakeup, dispatch_wakeup) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // Producers.

    pub fn notify_configuration_changed(&mut self, event_time: Nsecs) {
        trace!("configuration changed at {event_time}");
        self.enqueue_inbound(EventEntry::ConfigurationChanged { event_time });
    }

    pub fn notify_key(&mut self, mut event: KeyEvent) {
        let _span = tracy_client::span!("InputDispatcher::notify_key");

        if let Err(err) = validate_key_event(event.action) {
            warn!("dropping invalid key event: {err}");
            return;
        }

        let mut flags = event.policy_flags | PolicyFlags::TRUSTED;
        event.repeat_count = 0;
        self.policy.intercept_key_before_queueing(&event, &mut flags);

        if self.input_filter_enabled {
            flags |= PolicyFlags::FILTERED;
            event.policy_flags = flags;
            if !self
                .policy
                .filter_input_event(&InputEvent::Key(event.clone()), flags)
            {
                trace!("key event {} consumed by the input filter", event.id);
                return;
            }
        }

        event.policy_flags = flags;
        self.enqueue_inbound(EventEntry::Key(KeyEntry::new(event, None)));
    }

    pub fn notify_motion(&mut self, mut event: MotionEvent) {
        let _span = tracy_client::span!("InputDispatcher::notify_motion");

        if let Err(err) = validate_motion_event(event.action, &event.pointers) {
            warn!("dropping invalid motion event: {err}");
            return;
        }

        let mut flags = event.policy_flags | PolicyFlags::TRUSTED;
        self.policy
            .intercept_motion_before_queueing(&event, &mut flags);

        if self.input_filter_enabled {
            flags |= PolicyFlags::FILTERED;
            event.policy_flags = flags;
            if !self
                .policy
                .filter_input_event(&InputEvent::Motion(event.clone()), flags)
            {
                trace!("motion event {} consumed by the input filter", event.id);
                return;
            }
        }

        event.policy_flags = flags;
        self.enqueue_inbound(EventEntry::Motion(MotionEntry {
            event,
            injection: None,
        }));
    }

    pub fn notify_switch(
        &mut self,
        when: Nsecs,
        switch_values: u32,
        switch_mask: u32,
        policy_flags: PolicyFlags,
    ) {
        let flags = policy_flags | PolicyFlags::TRUSTED;
        self.policy
            .notify_switch(when, switch_values, switch_mask, flags);
    }

    pub fn notify_device_reset(&mut self, event_time: Nsecs, device_id: DeviceId) {
        trace!("device {device_id} reset at {event_time}");
        self.enqueue_inbound(EventEntry::DeviceReset {
            event_time,
            device_id,
        });
    }

    /// Validates and queues an injected event. The returned waiter reports the outcome.
    pub fn inject_input_event(
        &mut self,
        event: InputEvent,
        injector: Injector,
        sync_mode: SyncMode,
        policy_flags: PolicyFlags,
    ) -> Result<InjectionWaiter, InjectionResult> {
        let prepared = prepare_injection(self.policy.as_ref(), event, injector, policy_flags)?;
        let (waiter, sender) = InjectionWaiter::new(sync_mode);
        self.enqueue_injection(prepared, sync_mode, sender);
        Ok(waiter)
    }

    /// Queues an injection that was prepared with [`prepare_injection`], possibly on another
    /// thread.
    pub fn enqueue_injection(
        &mut self,
        prepared: PreparedInjection,
        sync_mode: SyncMode,
        sender: Option<mpsc::Sender<InjectionResult>>,
    ) {
        let injection = InjectionState::new(prepared.injector, sync_mode, sender);
        let entry = match prepared.event {
            InputEvent::Key(event) => EventEntry::Key(KeyEntry::new(event, Some(injection))),
            InputEvent::Motion(event) => EventEntry::Motion(MotionEntry {
                event,
                injection: Some(injection),
            }),
        };
        self.enqueue_inbound(entry);
    }

    // Window manager.

    /// Replaces the window list of `display_id`, ordered top to bottom.
    ///
    /// Windows on another display or without a registered channel are ignored.
    pub fn set_input_windows(&mut self, display_id: DisplayId, windows: Vec<InputWindowInfo>) {
        let _span = tracy_client::span!("InputDispatcher::set_input_windows");

        let now = self.clock.now();
        // Pick up broken channels first so their windows are filtered out below.
        self.poll_connections();

        let handles: Vec<WindowHandle> = windows
            .into_iter()
            .filter(|window| {
                if window.display_id != display_id {
                    warn!(
                        "ignoring window {} for display {} in the window list of display {display_id}",
                        window.name, window.display_id
                    );
                    return false;
                }
                if !self
                    .connections
                    .get(&window.token)
                    .is_some_and(Connection::is_normal)
                {
                    debug!("ignoring window {} without a registered channel", window.name);
                    return false;
                }
                true
            })
            .map(Arc::new)
            .collect();

        let new_focused = find_focused_window(&handles);

        let mut removed = Vec::new();
        if let Some(state) = self.touch_states.get_mut(&display_id) {
            state.windows.retain_mut(|touched| {
                let current = handles
                    .iter()
                    .find(|w| w.token == touched.window.token && w.id == touched.window.id);
                match current {
                    Some(window) => {
                        touched.window = window.clone();
                        true
                    }
                    None => {
                        removed.push(touched.window.token);
                        false
                    }
                }
            });
            removed.retain(|token| !state.windows.iter().any(|w| w.window.token == *token));
        }

        self.windows.insert(display_id, handles);

        for token in removed {
            debug!("touched window of {token} was removed from display {display_id}");
            let options = CancelOptions::new(CancelMode::Pointer, "touched window was removed");
            self.synthesize_cancellation_events_for_connection(now, token, options);
        }

        let old_token = self.focus.focused_token(display_id);
        let new_token = new_focused.as_ref().map(|w| w.token);
        if old_token == new_token {
            // Same window, possibly a newer snapshot of it.
            self.focus.set_focused_window(display_id, new_focused);
            return;
        }

        if let Some(old) = self.focus.set_focused_window(display_id, new_focused.clone()) {
            debug!("focus left window {} on display {display_id}", old.name);
            let options = CancelOptions::new(CancelMode::NonPointer, "focus left window");
            self.synthesize_cancellation_events_for_connection(now, old.token, options);
            self.enqueue_focus_event(now, old.token, false);
        }
        if let Some(new) = &new_focused {
            debug!("focus entered window {} on display {display_id}", new.name);
            self.enqueue_focus_event(now, new.token, true);
        }

        self.policy.notify_focus_changed(old_token, new_token);
    }

    pub fn set_focused_application(
        &mut self,
        display_id: DisplayId,
        application: Option<InputApplicationInfo>,
    ) {
        if self.focus.set_focused_application(display_id, application) {
            debug!("focused application of display {display_id} changed");
            self.reset_no_focused_window_timeout();
        }
    }

    /// Sets the display that receives events without a display of their own.
    pub fn set_focused_display(&mut self, display_id: DisplayId) {
        let old_display = self.focus.focused_display;
        if old_display == display_id {
            return;
        }

        let now = self.clock.now();
        let old_token = self.focus.focused_token(old_display);
        if let Some(token) = old_token {
            let mut options = CancelOptions::new(
                CancelMode::NonPointer,
                "the display which contains this window lost focus",
            );
            options.display_id = Some(DisplayId::NONE);
            self.synthesize_cancellation_events_for_connection(now, token, options);
        }

        debug!("focused display changed from {old_display} to {display_id}");
        self.focus.focused_display = display_id;
        let new_token = self.focus.focused_token(display_id);
        self.policy.notify_focus_changed(old_token, new_token);
    }

    pub fn set_in_touch_mode(&mut self, in_touch_mode: bool) {
        self.in_touch_mode = in_touch_mode;
    }

    /// Toggling the filter drops everything in flight.
    pub fn set_input_filter_enabled(&mut self, enabled: bool) {
        if self.input_filter_enabled == enabled {
            return;
        }
        self.input_filter_enabled = enabled;

        let now = self.clock.now();
        self.reset_and_drop_everything(now, "input filter was enabled or disabled");
    }

    pub fn register_input_channel(&mut self, channel: InputChannel) -> Result<(), DispatchError> {
        self.register_connection(channel, false)
    }

    /// Registers a monitor that receives every motion, and every key if it is a global monitor,
    /// on `display`.
    ///
    /// Gesture monitors only receive pointer events, but can take the pointer stream away from
    /// windows with [`Self::pilfer_pointers`].
    pub fn register_input_monitor(
        &mut self,
        channel: InputChannel,
        display: DisplayId,
        is_gesture_monitor: bool,
    ) -> Result<(), DispatchError> {
        let token = channel.token();
        self.register_connection(channel, true)?;

        let monitors = if is_gesture_monitor {
            &mut self.gesture_monitors
        } else {
            &mut self.global_monitors
        };
        monitors.entry(display).or_default().push(token);
        Ok(())
    }

    fn register_connection(
        &mut self,
        channel: InputChannel,
        is_monitor: bool,
    ) -> Result<(), DispatchError> {
        let token = channel.token();
        if self.connections.contains_key(&token) {
            warn!("{} is already registered", channel.name());
            return Err(DispatchError::AlreadyRegistered(token));
        }

        if let Some(waker) = &self.waker {
            channel.set_waker(waker.clone());
        }

        debug!("registered channel {} for {token}", channel.name());
        self.connections
            .insert(token, Connection::new(channel, is_monitor));
        Ok(())
    }

    pub fn unregister_input_channel(&mut self, token: Token) -> Result<(), DispatchError> {
        if !self.connections.contains_key(&token) {
            warn!("cannot unregister {token}: not registered");
            return Err(DispatchError::UnknownToken(token));
        }

        self.abort_broken_dispatch_cycle(token, false);

        if let Some(connection) = self.connections.remove(&token) {
            debug!("unregistered channel {}", connection.name());
        }
        for monitors in self
            .global_monitors
            .values_mut()
            .chain(self.gesture_monitors.values_mut())
        {
            monitors.retain(|t| *t != token);
        }
        Ok(())
    }

    /// Takes the pointer stream of a display away from its windows, leaving it to the gesture
    /// monitors.
    pub fn pilfer_pointers(&mut self, token: Token) -> Result<(), DispatchError> {
        let display_id = self
            .gesture_monitors
            .iter()
            .find(|(_, tokens)| tokens.contains(&token))
            .map(|(display_id, _)| *display_id);
        let Some(display_id) = display_id else {
            warn!("cannot pilfer pointers: {token} is not a gesture monitor");
            return Err(DispatchError::UnknownToken(token));
        };

        let Some(state) = self.touch_states.get(&display_id) else {
            warn!("cannot pilfer pointers: no pointers on display {display_id}");
            return Err(DispatchError::NoActiveStream(display_id));
        };
        if !state.down || !state.gesture_monitors.contains(&token) {
            warn!("cannot pilfer pointers: {token} has no pointer stream in progress");
            return Err(DispatchError::NoActiveStream(display_id));
        }

        let mut options =
            CancelOptions::new(CancelMode::Pointer, "gesture monitor stole the pointer stream");
        options.device_id = state.device_id;
        options.display_id = Some(display_id);

        let mut tokens: Vec<Token> = state.windows.iter().map(|w| w.window.token).collect();
        tokens.dedup();

        let now = self.clock.now();
        for window in tokens {
            self.synthesize_cancellation_events_for_connection(now, window, options);
        }
        if let Some(state) = self.touch_states.get_mut(&display_id) {
            state.filter_non_monitors();
        }
        Ok(())
    }

    /// Moves the pointers touching `from` over to `to` without breaking the stream.
    ///
    /// `from` gets a cancellation, and `to` gets pointer downs replaying the current pointers.
    /// Both must be windows on the same display.
    pub fn transfer_touch_focus(&mut self, from: Token, to: Token) -> bool {
        let _span = tracy_client::span!("InputDispatcher::transfer_touch_focus");

        if from == to {
            debug!("not transferring touch focus: {from} already has it");
            return true;
        }

        let (Some(from_window), Some(to_window)) =
            (self.window_for_token(from), self.window_for_token(to))
        else {
            warn!("cannot transfer touch focus from {from} to {to}: window not found");
            return false;
        };
        if from_window.display_id != to_window.display_id {
            warn!("cannot transfer touch focus from {from} to {to}: different displays");
            return false;
        }
        let to_window = to_window.clone();

        let mut found = false;
        for state in self.touch_states.values_mut() {
            let Some(index) = state.windows.iter().position(|w| w.window.token == from) else {
                continue;
            };
            let touched = state.windows.remove(index);
            let flags = touched.flags & (TargetFlags::FOREGROUND | TargetFlags::SPLIT);
            state.add_or_update_window(to_window.clone(), flags, touched.pointer_ids);
            found = true;
            break;
        }
        if !found {
            debug!("not transferring touch focus: {from} is not touched");
            return false;
        }

        debug!("transferring touch focus from {from} to {to}");
        let now = self.clock.now();
        if self.connections.contains_key(&from) && self.connections.contains_key(&to) {
            let from_state = self
                .connections
                .get_mut(&from)
                .map(|c| std::mem::take(&mut c.input_state));
            if let Some(from_state) = from_state {
                if let Some(to_connection) = self.connections.get_mut(&to) {
                    from_state.merge_pointer_state_to(&mut to_connection.input_state);
                }
                if let Some(from_connection) = self.connections.get_mut(&from) {
                    from_connection.input_state = from_state;
                }
            }

            let options = CancelOptions::new(
                CancelMode::Pointer,
                "transferring touch focus from this window to another window",
            );
            self.synthesize_cancellation_events_for_connection(now, from, options);
            self.synthesize_pointer_down_events_for_connection(now, to);
        }
        true
    }

    // Inbound queue.

    fn enqueue_inbound(&mut self, entry: EventEntry) {
        trace!("enqueueing {entry:?}");
        self.inbound_queue.push_back(entry);
    }

    fn enqueue_focus_event(&mut self, now: Nsecs, token: Token, has_focus: bool) {
        let entry = FocusEntry {
            id: self.ids.next_id(),
            token,
            has_focus,
            in_touch_mode: self.in_touch_mode,
            event_time: now,
        };
        self.enqueue_inbound(EventEntry::Focus(entry));
    }

    fn dispatch_inbound(&mut self, now: Nsecs) -> Option<Nsecs> {
        loop {
            if self.inbound_queue.is_empty() {
                match self.key_repeat.next_repeat_time() {
                    Some(time) if now >= time => {
                        if let Some(entry) = self.synthesize_key_repeat(now) {
                            self.inbound_queue.push_back(EventEntry::Key(entry));
                        }
                    }
                    next => return next,
                }
            }

            let mut entry = self.inbound_queue.pop_front()?;
            match self.dispatch_entry(now, &mut entry) {
                Progress::Done => {
                    // Dropping the entry resolves injections that never got a result.
                    drop(entry);
                }
                Progress::Blocked(wakeup) => {
                    self.inbound_queue.push_front(entry);
                    return wakeup;
                }
            }
        }
    }

    fn dispatch_entry(&mut self, now: Nsecs, entry: &mut EventEntry) -> Progress {
        let policy_flags = match entry {
            EventEntry::Key(key) => Some(key.event.policy_flags),
            EventEntry::Motion(motion) => Some(motion.event.policy_flags),
            _ => None,
        };
        if let Some(policy_flags) = policy_flags {
            if now.saturating_sub(entry.event_time()) >= STALE_EVENT_TIMEOUT {
                self.drop_inbound_event(now, entry, DropReason::Stale);
                return Progress::Done;
            }
            if !policy_flags.contains(PolicyFlags::PASS_TO_USER) {
                self.drop_inbound_event(now, entry, DropReason::Policy);
                return Progress::Done;
            }
        }

        match entry {
            EventEntry::ConfigurationChanged { event_time } => {
                self.key_repeat.reset();
                self.policy.notify_configuration_changed(*event_time);
                Progress::Done
            }
            EventEntry::DeviceReset { device_id, .. } => {
                self.dispatch_device_reset(now, *device_id);
                Progress::Done
            }
            EventEntry::Focus(focus) => {
                self.dispatch_focus(now, focus);
                Progress::Done
            }
            EventEntry::Key(key) => self.dispatch_key(now, key),
            EventEntry::Motion(motion) => self.dispatch_motion(now, motion),
        }
    }

    fn drop_inbound_event(&mut self, now: Nsecs, entry: &EventEntry, reason: DropReason) {
        info!("dropping {entry:?}: {}", reason.as_str());

        let mode = match entry {
            EventEntry::Key(_) => CancelMode::NonPointer,
            EventEntry::Motion(motion) if motion.event.source.is_pointer() => CancelMode::Pointer,
            EventEntry::Motion(_) => CancelMode::NonPointer,
            _ => return,
        };
        let options = CancelOptions::new(mode, reason.as_str());
        self.synthesize_cancellation_events_for_all_connections(now, options);
    }

    fn dispatch_device_reset(&mut self, now: Nsecs, device_id: DeviceId) {
        if self
            .key_repeat
            .last_key
            .as_ref()
            .is_some_and(|key| key.device_id == device_id)
        {
            self.key_repeat.reset();
        }

        let mut options = CancelOptions::new(CancelMode::All, "device was reset");
        options.device_id = Some(device_id);
        self.synthesize_cancellation_events_for_all_connections(now, options);

        self.touch_states
            .retain(|_, state| state.device_id != Some(device_id));
    }

    fn dispatch_focus(&mut self, now: Nsecs, entry: &FocusEntry) {
        if !self.connections.contains_key(&entry.token) {
            debug!("dropping focus event for {}: window is gone", entry.token);
            return;
        }

        let event = DispatchEvent::Focus(FocusEvent {
            id: entry.id,
            has_focus: entry.has_focus,
            in_touch_mode: entry.in_touch_mode,
        });
        let target = InputTarget::monitor(entry.token);
        self.prepare_dispatch_cycle(now, &target, &event, None);
    }

    fn dispatch_key(&mut self, now: Nsecs, entry: &mut KeyEntry) -> Progress {
        if !entry.dispatch_in_progress {
            self.update_key_repeat(entry);
            entry.dispatch_in_progress = true;
        }

        let display = self.focus.target_display(entry.event.display_id);
        let injection = entry.injection.as_ref();
        let mut targets = match self.find_focused_window_targets(now, display, injection) {
            FocusTargets::Pending(wakeup) => return Progress::Blocked(wakeup),
            FocusTargets::Failed(result) => {
                set_injection_result(injection, result);
                return Progress::Done;
            }
            FocusTargets::Found(targets) => targets,
        };

        self.add_global_monitor_targets(&mut targets, display);
        trace!("dispatching key {:?} to {} targets", entry.event, targets.len());
        let event = DispatchEvent::Key(entry.event.clone());
        self.dispatch_event_to_targets(now, &event, &targets, injection);
        set_injection_result(injection, InjectionResult::Succeeded);
        Progress::Done
    }

    fn update_key_repeat(&mut self, entry: &mut KeyEntry) {
        let event = &mut entry.event;
        let repeatable = self.settings.key_repeat_enabled
            && event.repeat_count == 0
            && event.action == KeyAction::DOWN
            && event.policy_flags.contains(PolicyFlags::TRUSTED)
            && !event.policy_flags.contains(PolicyFlags::DISABLE_KEY_REPEAT);

        if repeatable {
            let same_key = self
                .key_repeat
                .last_key
                .as_ref()
                .filter(|last| last.key_code == event.key_code);
            match same_key {
                Some(last) => {
                    // The device repeats the key by itself, so only count.
                    event.repeat_count = last.repeat_count + 1;
                    self.key_repeat.next_repeat_time = None;
                }
                None => {
                    let timeout = duration_to_ns(self.settings.key_repeat_timeout);
                    self.key_repeat.next_repeat_time =
                        Some(event.event_time.saturating_add(timeout));
                }
            }
            self.key_repeat.last_key = Some(event.clone());
        } else if !entry.synthetic_repeat {
            self.key_repeat.reset();
        }
    }

    fn synthesize_key_repeat(&mut self, now: Nsecs) -> Option<KeyEntry> {
        let last = self.key_repeat.last_key.as_mut()?;

        last.id = self.ids.next_id();
        last.repeat_count += 1;
        last.event_time = now;
        last.policy_flags |= PolicyFlags::PASS_TO_USER | PolicyFlags::TRUSTED;

        let delay = duration_to_ns(self.settings.key_repeat_delay);
        self.key_repeat.next_repeat_time = Some(now.saturating_add(delay));

        trace!("synthesized repeat {} of key {}", last.repeat_count, last.key_code);
        let mut entry = KeyEntry::new(last.clone(), None);
        entry.synthetic_repeat = true;
        Some(entry)
    }

    fn dispatch_motion(&mut self, now: Nsecs, entry: &MotionEntry) -> Progress {
        let event = &entry.event;
        let injection = entry.injection.as_ref();
        let is_pointer = event.source.is_pointer();
        let display = self.focus.target_display(event.display_id);

        let TouchTargets {
            result,
            mut targets,
            conflicting,
        } = if is_pointer {
            self.find_touched_window_targets(event, display, injection)
        } else {
            match self.find_focused_window_targets(now, display, injection) {
                FocusTargets::Pending(wakeup) => return Progress::Blocked(wakeup),
                FocusTargets::Failed(result) => TouchTargets {
                    result,
                    targets: Vec::new(),
                    conflicting: false,
                },
                FocusTargets::Found(targets) => TouchTargets {
                    result: InjectionResult::Succeeded,
                    targets,
                    conflicting: false,
                },
            }
        };

        if result != InjectionResult::Succeeded {
            if result != InjectionResult::PermissionDenied {
                let mode = if is_pointer {
                    CancelMode::Pointer
                } else {
                    CancelMode::NonPointer
                };
                let options = CancelOptions::new(mode, "input event injection failed");
                self.synthesize_cancellation_events_for_monitors(now, options);
            }
            set_injection_result(injection, result);
            return Progress::Done;
        }

        if is_pointer && event.action == MotionAction::DOWN {
            self.check_pointer_down_outside_focus(display);
        }

        self.add_global_monitor_targets(&mut targets, display);
        if conflicting {
            let options = CancelOptions::new(CancelMode::Pointer, "conflicting pointer actions");
            self.synthesize_cancellation_events_for_all_connections(now, options);
        }

        trace!("dispatching motion {:?} to {} targets", event.action, targets.len());
        let dispatch = DispatchEvent::Motion(event.clone());
        self.dispatch_event_to_targets(now, &dispatch, &targets, injection);
        set_injection_result(injection, InjectionResult::Succeeded);
        Progress::Done
    }

    fn check_pointer_down_outside_focus(&self, display: DisplayId) {
        let Some(touched) = self
            .touch_states
            .get(&display)
            .and_then(TouchState::first_foreground_window)
        else {
            return;
        };

        let focused = self.focus.focused_token(self.focus.focused_display);
        if focused != Some(touched.token) {
            trace!("pointer down outside focus on {}", touched.token);
            self.policy.on_pointer_down_outside_focus(touched.token);
        }
    }

    // Target resolution.

    fn find_focused_window_targets(
        &mut self,
        now: Nsecs,
        display_id: DisplayId,
        injection: Option<&SharedInjectionState>,
    ) -> FocusTargets {
        let Some(window) = self.focus.focused_window(display_id).cloned() else {
            let Some(application) = self.focus.focused_application(display_id).cloned() else {
                info!("dropping event: display {display_id} has no focused window or application");
                return FocusTargets::Failed(InjectionResult::Failed);
            };

            return match self.no_focused_window_timeout {
                None => {
                    let timeout = duration_to_ns(application.dispatching_timeout);
                    let deadline = now.saturating_add(timeout);
                    debug!(
                        "waiting up to {}ms for {} to focus a window",
                        timeout / NS_PER_MS,
                        application.name
                    );
                    self.no_focused_window_timeout = Some(deadline);
                    self.awaited_focused_application = Some(application);
                    FocusTargets::Pending(Some(deadline))
                }
                Some(deadline) if now >= deadline => {
                    error!(
                        "dropping event: {} did not focus a window in time",
                        application.name
                    );
                    self.reset_no_focused_window_timeout();
                    FocusTargets::Failed(InjectionResult::TimedOut)
                }
                Some(deadline) => FocusTargets::Pending(Some(deadline)),
            };
        };

        self.reset_no_focused_window_timeout();

        if !self.check_injection_permission(Some(&*window), injection) {
            return FocusTargets::Failed(InjectionResult::PermissionDenied);
        }
        if window.paused {
            trace!("waiting because focused window {} is paused", window.name);
            return FocusTargets::Pending(None);
        }

        let mut targets = Vec::new();
        add_window_target(
            &mut targets,
            &window,
            TargetFlags::FOREGROUND,
            PointerIdBits::default(),
        );
        FocusTargets::Found(targets)
    }

    fn find_touched_window_targets(
        &mut self,
        event: &MotionEvent,
        display_id: DisplayId,
        injection: Option<&SharedInjectionState>,
    ) -> TouchTargets {
        let masked = event.action.masked();
        let old_down = self.touch_states.get(&display_id).is_some_and(|s| s.down);
        let mut state = self.touch_states.get(&display_id).cloned().unwrap_or_default();
        let mut is_split = state.split;
        let mut switched_device =
            state.is_switched_device(event.device_id, event.source, display_id);
        let is_hover = event.action.is_hover();
        let new_gesture =
            masked == MotionAction::DOWN || masked == MotionAction::SCROLL || is_hover;
        let is_from_mouse = event.source == Source::MOUSE;

        let mut wrong_device = false;
        let mut permission = None;
        let mut result = InjectionResult::Failed;
        let mut targets = Vec::new();

        'resolve: {
            if new_gesture {
                let down = masked == MotionAction::DOWN;
                if switched_device && state.down && !down && !is_hover {
                    info!(
                        "dropping event: a pointer of another device is already down on display {display_id}"
                    );
                    switched_device = false;
                    wrong_device = true;
                    break 'resolve;
                }

                state.reset();
                state.down = down;
                state.device_id = Some(event.device_id);
                state.source = Some(event.source);
                state.display_id = Some(display_id);
                is_split = false;
            } else if switched_device && masked == MotionAction::MOVE {
                info!("dropping move event: a pointer of another device is down on display {display_id}");
                result = InjectionResult::PermissionDenied;
                switched_device = false;
                wrong_device = true;
                break 'resolve;
            }

            if new_gesture || (is_split && masked == MotionAction::POINTER_DOWN) {
                let pointer_index = event.action.pointer_index();
                let Some(pointer) = event.pointers.get(pointer_index) else {
                    break 'resolve;
                };
                let (x, y) = match event.cursor_position {
                    Some(position) if is_from_mouse => position,
                    _ => (pointer.coords.x, pointer.coords.y),
                };

                let mut new_window = find_touched_window_at(self.windows_on(display_id), x, y);
                let new_monitors = if masked == MotionAction::DOWN {
                    self.gesture_monitors
                        .get(&display_id)
                        .cloned()
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };

                if new_window.as_ref().is_some_and(|w| w.supports_split_touch()) {
                    is_split = !is_from_mouse;
                } else if is_split {
                    // A window that does not split cannot join a split stream.
                    new_window = None;
                }
                if new_window.is_none() {
                    new_window = state.first_foreground_window().cloned();
                }

                if new_window.is_none() && new_monitors.is_empty() {
                    info!(
                        "dropping event: no touchable window or gesture monitor at ({x}, {y}) on display {display_id}"
                    );
                    break 'resolve;
                }

                if let Some(window) = new_window {
                    let mut flags = TargetFlags::FOREGROUND;
                    let mut pointer_ids = PointerIdBits::default();
                    if is_split {
                        flags |= TargetFlags::SPLIT;
                        pointer_ids = PointerIdBits::from_id(pointer.id());
                    }
                    state.add_or_update_window(window, flags, pointer_ids);
                }
                state.add_gesture_monitors(&new_monitors);
            } else if !state.down {
                debug!("dropping event: no pointer is down on display {display_id}");
                break 'resolve;
            }

            let denied = state
                .windows
                .iter()
                .filter(|w| w.flags.contains(TargetFlags::FOREGROUND))
                .any(|w| !self.check_injection_permission(Some(&*w.window), injection));
            if denied {
                result = InjectionResult::PermissionDenied;
                permission = Some(false);
                break 'resolve;
            }

            if state.first_foreground_window().is_none() && state.gesture_monitors.is_empty() {
                info!(
                    "dropping event: no touched foreground window or gesture monitor on display {display_id}"
                );
                break 'resolve;
            }

            permission = Some(true);
            result = InjectionResult::Succeeded;

            for touched in &state.windows {
                add_window_target(
                    &mut targets,
                    &touched.window,
                    touched.flags,
                    touched.pointer_ids,
                );
            }
            for monitor in &state.gesture_monitors {
                targets.push(InputTarget::monitor(*monitor));
            }
        }

        let permission =
            permission.unwrap_or_else(|| self.check_injection_permission(None, injection));
        let mut conflicting = false;
        if !permission || wrong_device {
            return TouchTargets {
                result,
                targets,
                conflicting,
            };
        }

        if switched_device {
            debug!("conflicting pointer actions: switched to a different device");
            conflicting = true;
        }

        if is_hover {
            if old_down {
                debug!("conflicting pointer actions: hover received while a pointer was down");
                conflicting = true;
            }
            state.reset();
            if masked == MotionAction::HOVER_ENTER || masked == MotionAction::HOVER_MOVE {
                state.device_id = Some(event.device_id);
                state.source = Some(event.source);
                state.display_id = Some(display_id);
            }
        } else if masked == MotionAction::UP || masked == MotionAction::CANCEL {
            state.reset();
        } else if masked == MotionAction::DOWN {
            if old_down {
                debug!("conflicting pointer actions: down received while already down");
                conflicting = true;
            }
        } else if masked == MotionAction::POINTER_UP && is_split {
            if let Some(pointer) = event.action_pointer() {
                state.remove_split_pointer(pointer.id());
            }
        }

        // Scrolling does not change who owns the pointers.
        if masked != MotionAction::SCROLL {
            if state.display_id.is_some() {
                self.touch_states.insert(display_id, state);
            } else {
                self.touch_states.remove(&display_id);
            }
        }

        TouchTargets {
            result,
            targets,
            conflicting,
        }
    }

    fn add_global_monitor_targets(&self, targets: &mut Vec<InputTarget>, display: DisplayId) {
        let Some(monitors) = self.global_monitors.get(&display) else {
            return;
        };
        targets.extend(monitors.iter().map(|token| InputTarget::monitor(*token)));
    }

    fn check_injection_permission(
        &self,
        window: Option<&InputWindowInfo>,
        injection: Option<&SharedInjectionState>,
    ) -> bool {
        let Some(injection) = injection else {
            return true;
        };
        let injector = injection.borrow().injector;

        if window.is_some_and(|w| w.owner_uid == injector.uid) {
            return true;
        }
        if has_injection_permission(self.policy.as_ref(), injector) {
            return true;
        }

        match window {
            Some(window) => warn!(
                "permission denied: pid {} uid {} may not inject into {} owned by uid {}",
                injector.pid, injector.uid, window.name, window.owner_uid
            ),
            None => warn!(
                "permission denied: pid {} uid {} may not inject events",
                injector.pid, injector.uid
            ),
        }
        false
    }

    fn reset_no_focused_window_timeout(&mut self) {
        self.no_focused_window_timeout = None;
        self.awaited_focused_application = None;
    }

    fn windows_on(&self, display: DisplayId) -> &[WindowHandle] {
        self.windows.get(&display).map_or(&[], Vec::as_slice)
    }

    fn window_for_token(&self, token: Token) -> Option<&WindowHandle> {
        self.windows.values().flatten().find(|w| w.token == token)
    }

    // Delivery.

    fn dispatch_event_to_targets(
        &mut self,
        now: Nsecs,
        event: &DispatchEvent,
        targets: &[InputTarget],
        injection: Option<&SharedInjectionState>,
    ) {
        let _span = tracy_client::span!("InputDispatcher::dispatch_event_to_targets");

        for target in targets {
            if !self.connections.contains_key(&target.token) {
                debug!("not delivering to {}: not registered", target.token);
                continue;
            }
            self.prepare_dispatch_cycle(now, target, event, injection);
        }
    }

    fn prepare_dispatch_cycle(
        &mut self,
        now: Nsecs,
        target: &InputTarget,
        event: &DispatchEvent,
        injection: Option<&SharedInjectionState>,
    ) {
        let Some(connection) = self.connections.get_mut(&target.token) else {
            return;
        };
        if !connection.is_normal() {
            debug!("not delivering to {}: channel is broken", connection.name());
            return;
        }

        let event = match event {
            DispatchEvent::Motion(motion)
                if target.flags.contains(TargetFlags::SPLIT)
                    && target.pointer_ids.count() != motion.pointers.len() =>
            {
                let Some(split) = split_motion_event(motion, target.pointer_ids, &self.ids) else {
                    return;
                };
                DispatchEvent::Motion(split)
            }
            other => other.clone(),
        };

        connection.enqueue(event, target, injection.cloned());
        self.start_dispatch_cycle(now, target.token);
    }

    fn start_dispatch_cycle(&mut self, now: Nsecs, token: Token) {
        let timeout = self.dispatching_timeout_for(token);
        let Some(connection) = self.connections.get_mut(&token) else {
            return;
        };
        if !connection.is_normal() {
            return;
        }

        if let Err(err) = connection.publish_outbound(now, timeout, self.time_stats.as_ref()) {
            error!("error publishing to {}: {err}", connection.name());
            self.abort_broken_dispatch_cycle(token, true);
        }
    }

    fn dispatching_timeout_for(&self, token: Token) -> Nsecs {
        let timeout = self
            .window_for_token(token)
            .map_or(self.settings.dispatching_timeout, |w| w.dispatching_timeout);
        duration_to_ns(timeout)
    }

    /// Collects finished signals and notices channels that broke.
    fn poll_connections(&mut self) {
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            let Some(connection) = self.connections.get_mut(&token) else {
                continue;
            };
            if !connection.is_normal() {
                continue;
            }

            let broken = loop {
                match connection.channel.receive_finished() {
                    Ok(Some(finished)) => {
                        trace!(
                            "{}: finished seq {} handled={}",
                            connection.name(),
                            finished.seq,
                            finished.handled
                        );
                        if connection.finish(finished.seq).is_none() {
                            warn!("{}: finished unknown seq {}", connection.name(), finished.seq);
                        }
                    }
                    Ok(None) => break false,
                    Err(_) => break true,
                }
            };

            if broken {
                error!("{}: channel is broken", connection.name());
                self.abort_broken_dispatch_cycle(token, true);
            }
        }
    }

    fn abort_broken_dispatch_cycle(&mut self, token: Token, notify: bool) {
        let Some(connection) = self.connections.get_mut(&token) else {
            return;
        };
        if !connection.is_normal() {
            return;
        }

        connection.status = ConnectionStatus::Broken;
        connection.drain_queues();
        // Nothing can be delivered to it any more, cancellations included.
        connection.input_state.clear();

        if notify {
            self.policy.notify_input_channel_broken(token);
        }

        for state in self.touch_states.values_mut() {
            state.remove_token(token);
            state.gesture_monitors.retain(|t| *t != token);
        }

        for display_id in self.focus.displays_focused_on(token) {
            debug!("focused window on display {display_id} went away");
            self.focus.set_focused_window(display_id, None);
            self.policy.notify_focus_changed(Some(token), None);
        }
    }

    fn process_anrs(&mut self, now: Nsecs) {
        if let (Some(deadline), Some(application)) = (
            self.no_focused_window_timeout,
            &self.awaited_focused_application,
        ) {
            if now >= deadline {
                let reason = format!("{} does not have a focused window", application.name);
                error!("application not responding: {reason}");
                match self.policy.notify_anr(Some(application), None, &reason) {
                    AnrResponse::Wait(extra) => {
                        let deadline = now.saturating_add(duration_to_ns(extra));
                        self.no_focused_window_timeout = Some(deadline);
                    }
                    AnrResponse::Abort => {
                        self.awaited_focused_application = None;
                    }
                }
            }
        }

        let expired: Vec<Token> = self
            .connections
            .values()
            .filter(|c| c.next_timeout().is_some_and(|timeout| now >= timeout))
            .map(Connection::token)
            .collect();
        for token in expired {
            self.on_connection_anr(now, token);
        }
    }

    /// The earliest time something may stop responding.
    fn next_anr_time(&self) -> Option<Nsecs> {
        let no_focused_window = self
            .awaited_focused_application
            .as_ref()
            .and(self.no_focused_window_timeout);
        self.connections
            .values()
            .filter_map(Connection::next_timeout)
            .chain(no_focused_window)
            .min()
    }

    fn on_connection_anr(&mut self, now: Nsecs, token: Token) {
        let window = self.window_for_token(token).cloned();
        let application = window.as_ref().and_then(|w| {
            w.application
                .clone()
                .or_else(|| self.focus.focused_application(w.display_id).cloned())
        });

        let Some(connection) = self.connections.get(&token) else {
            return;
        };
        let Some(head) = connection.wait_queue.front() else {
            return;
        };
        let kind = match head.event {
            DispatchEvent::Key(_) => "key",
            DispatchEvent::Motion(_) => "motion",
            DispatchEvent::Focus(_) => "focus",
        };
        let reason = format!(
            "{} is not responding: waited {}ms for a {kind} event",
            connection.name(),
            (now - head.delivery_time) / NS_PER_MS
        );
        warn!("{reason}");

        match self.policy.notify_anr(application.as_ref(), Some(token), &reason) {
            AnrResponse::Wait(extra) => {
                let deadline = now.saturating_add(duration_to_ns(extra));
                if let Some(connection) = self.connections.get_mut(&token) {
                    for entry in &mut connection.wait_queue {
                        entry.timeout_time = entry.timeout_time.max(deadline);
                    }
                }
            }
            AnrResponse::Abort => {
                if let Some(connection) = self.connections.get_mut(&token) {
                    connection.responsive = false;
                    connection.drain_queues();
                }
                let options = CancelOptions::new(CancelMode::All, "application not responding");
                self.synthesize_cancellation_events_for_connection(now, token, options);
            }
        }
    }

    fn reset_and_drop_everything(&mut self, now: Nsecs, reason: &'static str) {
        debug!("resetting and dropping all events: {reason}");

        let options = CancelOptions::new(CancelMode::All, reason);
        self.synthesize_cancellation_events_for_all_connections(now, options);

        self.key_repeat.reset();
        self.inbound_queue.clear();
        self.touch_states.clear();
        self.reset_no_focused_window_timeout();
    }

    // Synthesized events.

    fn synthesize_cancellation_events_for_all_connections(
        &mut self,
        now: Nsecs,
        options: CancelOptions,
    ) {
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.synthesize_cancellation_events_for_connection(now, token, options);
        }
    }

    fn synthesize_cancellation_events_for_monitors(&mut self, now: Nsecs, options: CancelOptions) {
        let tokens: Vec<Token> = self
            .global_monitors
            .values()
            .chain(self.gesture_monitors.values())
            .flatten()
            .copied()
            .collect();
        for token in tokens {
            self.synthesize_cancellation_events_for_connection(now, token, options);
        }
    }

    fn synthesize_cancellation_events_for_connection(
        &mut self,
        now: Nsecs,
        token: Token,
        options: CancelOptions,
    ) {
        let window = self.window_for_token(token).cloned();
        let Some(connection) = self.connections.get_mut(&token) else {
            return;
        };
        if !connection.is_normal() {
            return;
        }

        let events = connection
            .input_state
            .synthesize_cancellation_events(now, &options, &self.ids);
        if events.is_empty() {
            return;
        }
        debug!(
            "{}: synthesized {} cancellation events: {}",
            connection.name(),
            events.len(),
            options.reason
        );

        let target = match &window {
            Some(window) if !connection.is_monitor => {
                InputTarget::window(window, TargetFlags::empty())
            }
            _ => InputTarget::monitor(token),
        };
        for event in events {
            let event = match event {
                SynthesizedEvent::Key(key) => DispatchEvent::Key(key),
                SynthesizedEvent::Motion(motion) => DispatchEvent::Motion(motion),
            };
            connection.enqueue(event, &target, None);
        }

        self.start_dispatch_cycle(now, token);
    }

    fn synthesize_pointer_down_events_for_connection(&mut self, now: Nsecs, token: Token) {
        let window = self.window_for_token(token).cloned();
        let Some(connection) = self.connections.get_mut(&token) else {
            return;
        };
        if !connection.is_normal() {
            return;
        }

        let events = connection
            .input_state
            .synthesize_pointer_down_events(now, &self.ids);
        if events.is_empty() {
            return;
        }
        debug!(
            "{}: synthesized {} pointer down events",
            connection.name(),
            events.len()
        );

        let target = match &window {
            Some(window) => InputTarget::window(window, TargetFlags::empty()),
            None => InputTarget::monitor(token),
        };
        for event in events {
            connection.enqueue(DispatchEvent::Motion(event), &target, None);
        }

        self.start_dispatch_cycle(now, token);
    }
}

fn set_injection_result(injection: Option<&SharedInjectionState>, result: InjectionResult) {
    if let Some(injection) = injection {
        trace!("injection finished with {result:?}");
        injection.borrow_mut().set_result(result);
    }
}

/// Adds a target for `window`, merging it into an existing target for the same token.
fn add_window_target(
    targets: &mut Vec<InputTarget>,
    window: &InputWindowInfo,
    flags: TargetFlags,
    pointer_ids: PointerIdBits,
) {
    let index = match targets.iter().position(|t| t.token == window.token) {
        Some(index) => {
            targets[index].flags |= flags;
            index
        }
        None => {
            targets.push(InputTarget::window(window, flags));
            targets.len() - 1
        }
    };
    targets[index].add_pointers(pointer_ids, window);
}

/// Rewrites `event` for a target that owns only `pointer_ids`.
fn split_motion_event(
    event: &MotionEvent,
    pointer_ids: PointerIdBits,
    ids: &IdGenerator,
) -> Option<MotionEvent> {
    let pointers: Vec<_> = event
        .pointers
        .iter()
        .filter(|p| pointer_ids.has(p.id()))
        .copied()
        .collect();
    if pointers.len() != pointer_ids.count() {
        warn!(
            "cannot split motion event: target expects {} pointers, event has {} of them",
            pointer_ids.count(),
            pointers.len()
        );
        return None;
    }

    let masked = event.action.masked();
    let action = if masked == MotionAction::POINTER_DOWN || masked == MotionAction::POINTER_UP {
        let action_id = event.action_pointer()?.id();
        if !pointer_ids.has(action_id) {
            // Someone else's pointer went down or up.
            MotionAction::MOVE
        } else if pointers.len() == 1 {
            if masked == MotionAction::POINTER_DOWN {
                MotionAction::DOWN
            } else {
                MotionAction::UP
            }
        } else {
            let index = pointers.iter().position(|p| p.id() == action_id)?;
            MotionAction::with_pointer_index(masked, index)
        }
    } else {
        event.action
    };

    let mut split = event.clone();
    split.id = ids.next_id();
    split.action = action;
    split.pointers = pointers;
    Some(split)
}
