//! What one connection believes is currently down.
//!
//! Every key and motion delivered to a connection passes through [`InputState`] first. It keeps
//! a memento of each key that is down and of each pointer stream in progress, so the dispatcher
//! can later tell the connection to forget them (cancellation) or bring a new connection up to
//! date (pointer-down replay after a touch focus transfer).

use crate::input::event::{
    DeviceId, DisplayId, IdGenerator, KeyAction, KeyEvent, KeyFlags, MotionAction, MotionEvent,
    Pointer, PolicyFlags, Source,
};
use crate::utils::Nsecs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelMode {
    All,
    Pointer,
    NonPointer,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CancelOptions {
    pub mode: CancelMode,
    pub reason: &'static str,
    pub device_id: Option<DeviceId>,
    pub display_id: Option<DisplayId>,
}

impl CancelOptions {
    pub fn new(mode: CancelMode, reason: &'static str) -> Self {
        Self {
            mode,
            reason,
            device_id: None,
            display_id: None,
        }
    }
}

#[derive(Debug, Clone)]
struct KeyMemento {
    device_id: DeviceId,
    source: Source,
    display_id: DisplayId,
    key_code: i32,
    scan_code: i32,
    meta_state: i32,
    flags: KeyFlags,
    down_time: Nsecs,
    policy_flags: PolicyFlags,
}

impl KeyMemento {
    fn matches(&self, event: &KeyEvent) -> bool {
        self.device_id == event.device_id
            && self.source == event.source
            && self.display_id == event.display_id
            && self.key_code == event.key_code
            && self.scan_code == event.scan_code
    }

    fn should_cancel(&self, options: &CancelOptions) -> bool {
        if options.device_id.is_some_and(|id| id != self.device_id)
            || options.display_id.is_some_and(|id| id != self.display_id)
        {
            return false;
        }
        matches!(options.mode, CancelMode::All | CancelMode::NonPointer)
    }
}

#[derive(Debug, Clone)]
struct MotionMemento {
    device_id: DeviceId,
    source: Source,
    display_id: DisplayId,
    flags: u32,
    down_time: Nsecs,
    pointers: Vec<Pointer>,
    hovering: bool,
    policy_flags: PolicyFlags,
    /// Pointers from this index on were merged in and the connection has not seen them go down.
    first_new_pointer: Option<usize>,
}

impl MotionMemento {
    fn new(event: &MotionEvent, hovering: bool) -> Self {
        Self {
            device_id: event.device_id,
            source: event.source,
            display_id: event.display_id,
            flags: event.flags,
            down_time: event.down_time,
            pointers: event.pointers.clone(),
            hovering,
            policy_flags: event.policy_flags,
            first_new_pointer: None,
        }
    }

    fn matches(&self, event: &MotionEvent, hovering: bool) -> bool {
        self.device_id == event.device_id
            && self.source == event.source
            && self.display_id == event.display_id
            && self.hovering == hovering
    }

    fn should_cancel(&self, options: &CancelOptions) -> bool {
        if options.device_id.is_some_and(|id| id != self.device_id)
            || options.display_id.is_some_and(|id| id != self.display_id)
        {
            return false;
        }
        match options.mode {
            CancelMode::All => true,
            CancelMode::Pointer => self.source.is_pointer(),
            CancelMode::NonPointer => !self.source.is_pointer(),
        }
    }

    fn event(
        &self,
        id: i32,
        now: Nsecs,
        action: MotionAction,
        pointers: Vec<Pointer>,
    ) -> MotionEvent {
        MotionEvent {
            id,
            device_id: self.device_id,
            source: self.source,
            display_id: self.display_id,
            action,
            flags: self.flags,
            meta_state: 0,
            button_state: 0,
            down_time: self.down_time,
            event_time: now,
            policy_flags: self.policy_flags,
            cursor_position: None,
            pointers,
        }
    }
}

/// A synthesized event, ready to be dispatched to the connection that owns the state.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SynthesizedEvent {
    Key(KeyEvent),
    Motion(MotionEvent),
}

#[derive(Debug, Default)]
pub(crate) struct InputState {
    keys: Vec<KeyMemento>,
    motions: Vec<MotionMemento>,
}

impl InputState {
    pub fn is_neutral(&self) -> bool {
        self.keys.is_empty() && self.motions.is_empty()
    }

    /// Records a key about to be delivered. Returns `false` if the connection should not get it.
    pub fn track_key(&mut self, event: &KeyEvent) -> bool {
        let index = self.keys.iter().position(|m| m.matches(event));
        match event.action {
            KeyAction::UP => match index {
                Some(index) => {
                    self.keys.remove(index);
                    true
                }
                None => false,
            },
            KeyAction::DOWN => {
                if let Some(index) = index {
                    self.keys.remove(index);
                }
                self.keys.push(KeyMemento {
                    device_id: event.device_id,
                    source: event.source,
                    display_id: event.display_id,
                    key_code: event.key_code,
                    scan_code: event.scan_code,
                    meta_state: event.meta_state,
                    flags: event.flags,
                    down_time: event.down_time,
                    policy_flags: event.policy_flags,
                });
                true
            }
            _ => true,
        }
    }

    /// Records a motion about to be delivered. Returns `false` if the connection should not get
    /// it because it would be inconsistent with what the connection has already seen.
    pub fn track_motion(&mut self, event: &MotionEvent) -> bool {
        let find = |motions: &[MotionMemento], hovering| {
            motions.iter().position(|m| m.matches(event, hovering))
        };

        match event.action.masked() {
            MotionAction::UP | MotionAction::CANCEL => match find(&self.motions, false) {
                Some(index) => {
                    self.motions.remove(index);
                    true
                }
                None => false,
            },
            MotionAction::DOWN => {
                if let Some(index) = find(&self.motions, false) {
                    self.motions.remove(index);
                }
                self.motions.push(MotionMemento::new(event, false));
                true
            }
            MotionAction::POINTER_UP | MotionAction::POINTER_DOWN | MotionAction::MOVE => {
                // Trackballs move without going down first.
                if event.source.is_navigation() {
                    return true;
                }
                match find(&self.motions, false) {
                    Some(index) if self.motions[index].first_new_pointer.is_none() => {
                        self.motions[index].pointers = event.pointers.clone();
                        true
                    }
                    _ => false,
                }
            }
            MotionAction::HOVER_EXIT => match find(&self.motions, true) {
                Some(index) => {
                    self.motions.remove(index);
                    true
                }
                None => false,
            },
            MotionAction::HOVER_ENTER | MotionAction::HOVER_MOVE => {
                if let Some(index) = find(&self.motions, true) {
                    self.motions.remove(index);
                }
                self.motions.push(MotionMemento::new(event, true));
                true
            }
            _ => true,
        }
    }

    /// Events that bring the connection back to neutral for everything `options` selects.
    ///
    /// The mementos are left in place. Tracking the returned events removes them.
    pub fn synthesize_cancellation_events(
        &self,
        now: Nsecs,
        options: &CancelOptions,
        ids: &IdGenerator,
    ) -> Vec<SynthesizedEvent> {
        let keys = self
            .keys
            .iter()
            .filter(|m| m.should_cancel(options))
            .map(|m| {
                SynthesizedEvent::Key(KeyEvent {
                    id: ids.next_id(),
                    device_id: m.device_id,
                    source: m.source,
                    display_id: m.display_id,
                    action: KeyAction::UP,
                    flags: m.flags | KeyFlags::CANCELED,
                    key_code: m.key_code,
                    scan_code: m.scan_code,
                    meta_state: m.meta_state,
                    repeat_count: 0,
                    down_time: m.down_time,
                    event_time: now,
                    policy_flags: m.policy_flags,
                })
            });

        let motions = self
            .motions
            .iter()
            .filter(|m| m.should_cancel(options))
            .map(|m| {
                let action = if m.hovering {
                    MotionAction::HOVER_EXIT
                } else {
                    MotionAction::CANCEL
                };
                SynthesizedEvent::Motion(m.event(ids.next_id(), now, action, m.pointers.clone()))
            });

        keys.chain(motions).collect()
    }

    /// Replays pointer downs for pointers that were merged in by [`Self::merge_pointer_state_to`].
    pub fn synthesize_pointer_down_events(
        &mut self,
        now: Nsecs,
        ids: &IdGenerator,
    ) -> Vec<MotionEvent> {
        let mut events = Vec::new();

        for memento in &mut self.motions {
            if !memento.source.is_pointer() {
                continue;
            }
            let Some(first_new) = memento.first_new_pointer.take() else {
                continue;
            };

            for index in first_new..memento.pointers.len() {
                let action = if index == 0 {
                    MotionAction::DOWN
                } else {
                    MotionAction::pointer_down(index)
                };
                let pointers = memento.pointers[..=index].to_vec();
                events.push(memento.event(ids.next_id(), now, action, pointers));
            }
        }

        events
    }

    /// Hands this connection's pointer streams over to `other`.
    ///
    /// Pointers of a stream `other` already has are appended to it. Streams it does not have
    /// are copied. Either way the new pointers are marked for a pointer-down replay.
    pub fn merge_pointer_state_to(&self, other: &mut InputState) {
        for memento in &self.motions {
            if !memento.source.is_pointer() || memento.hovering {
                continue;
            }

            let existing = other.motions.iter_mut().find(|m| {
                m.device_id == memento.device_id
                    && m.source == memento.source
                    && m.display_id == memento.display_id
                    && !m.hovering
            });
            match existing {
                Some(existing) => {
                    if existing.first_new_pointer.is_none() {
                        existing.first_new_pointer = Some(existing.pointers.len());
                    }
                    existing.pointers.extend_from_slice(&memento.pointers);
                }
                None => {
                    let mut copy = memento.clone();
                    copy.first_new_pointer = Some(0);
                    other.motions.push(copy);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.motions.clear();
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_debug_snapshot;

    use super::*;
    use crate::input::event::IdSource;

    fn key(action: KeyAction) -> KeyEvent {
        KeyEvent {
            id: 1,
            device_id: 1,
            source: Source::KEYBOARD,
            display_id: DisplayId::NONE,
            action,
            flags: KeyFlags::empty(),
            key_code: 29,
            scan_code: 30,
            meta_state: 0,
            repeat_count: 0,
            down_time: 10,
            event_time: 10,
            policy_flags: PolicyFlags::TRUSTED,
        }
    }

    fn motion(action: MotionAction, pointers: &[(i32, f32, f32)]) -> MotionEvent {
        MotionEvent {
            id: 1,
            device_id: 1,
            source: Source::TOUCHSCREEN,
            display_id: DisplayId::DEFAULT,
            action,
            flags: 0,
            meta_state: 0,
            button_state: 0,
            down_time: 10,
            event_time: 10,
            policy_flags: PolicyFlags::TRUSTED,
            cursor_position: None,
            pointers: pointers
                .iter()
                .map(|&(id, x, y)| Pointer::finger(id, x, y))
                .collect(),
        }
    }

    fn cancel(state: &InputState, mode: CancelMode) -> Vec<SynthesizedEvent> {
        let ids = IdGenerator::new(IdSource::InputDispatcher);
        state.synthesize_cancellation_events(20, &CancelOptions::new(mode, "test"), &ids)
    }

    #[test]
    fn key_up_without_down_is_refused() {
        let mut state = InputState::default();
        assert!(!state.track_key(&key(KeyAction::UP)));

        assert!(state.track_key(&key(KeyAction::DOWN)));
        assert!(state.track_key(&key(KeyAction::UP)));
        assert!(state.is_neutral());
    }

    #[test]
    fn motion_stream_needs_down_first() {
        let mut state = InputState::default();
        assert!(!state.track_motion(&motion(MotionAction::MOVE, &[(0, 1., 1.)])));
        assert!(!state.track_motion(&motion(MotionAction::UP, &[(0, 1., 1.)])));

        assert!(state.track_motion(&motion(MotionAction::DOWN, &[(0, 1., 1.)])));
        assert!(state.track_motion(&motion(MotionAction::MOVE, &[(0, 2., 2.)])));
        assert!(state.track_motion(&motion(MotionAction::CANCEL, &[(0, 2., 2.)])));
        assert!(state.is_neutral());
    }

    #[test]
    fn trackball_moves_without_down() {
        let mut state = InputState::default();
        let mut event = motion(MotionAction::MOVE, &[(0, 1., 1.)]);
        event.source = Source::TRACKBALL;
        assert!(state.track_motion(&event));
        assert!(state.is_neutral());
    }

    #[test]
    fn cancellation_selects_by_mode() {
        let mut state = InputState::default();
        state.track_key(&key(KeyAction::DOWN));
        state.track_motion(&motion(MotionAction::DOWN, &[(0, 1., 1.)]));

        let non_pointer = cancel(&state, CancelMode::NonPointer);
        assert_eq!(non_pointer.len(), 1);
        let SynthesizedEvent::Key(up) = &non_pointer[0] else {
            panic!("expected a key");
        };
        assert_eq!(up.action, KeyAction::UP);
        assert!(up.flags.contains(KeyFlags::CANCELED));
        assert_eq!(up.event_time, 20);

        let pointer = cancel(&state, CancelMode::Pointer);
        assert_eq!(pointer.len(), 1);
        let SynthesizedEvent::Motion(canceled) = &pointer[0] else {
            panic!("expected a motion");
        };
        assert_eq!(canceled.action, MotionAction::CANCEL);

        assert_eq!(cancel(&state, CancelMode::All).len(), 2);
    }

    #[test]
    fn cancellation_filters_by_device() {
        let mut state = InputState::default();
        state.track_key(&key(KeyAction::DOWN));

        let ids = IdGenerator::new(IdSource::InputDispatcher);
        let mut options = CancelOptions::new(CancelMode::All, "test");
        options.device_id = Some(2);
        assert!(state
            .synthesize_cancellation_events(0, &options, &ids)
            .is_empty());
    }

    #[test]
    fn merge_then_replay_new_pointers() {
        let mut from = InputState::default();
        from.track_motion(&motion(MotionAction::DOWN, &[(0, 10., 20.)]));

        // The receiving side already knows about pointer 1.
        let mut to = InputState::default();
        to.track_motion(&motion(MotionAction::DOWN, &[(1, 110., 120.)]));

        from.merge_pointer_state_to(&mut to);
        // Moves are held back until the replay happened.
        assert!(!to.track_motion(&motion(MotionAction::MOVE, &[(1, 110., 120.)])));

        let ids = IdGenerator::new(IdSource::InputDispatcher);
        let replay = to.synthesize_pointer_down_events(30, &ids);
        let summary: Vec<_> = replay
            .iter()
            .map(|e| (e.action, e.pointers.iter().map(|p| p.id()).collect::<Vec<_>>()))
            .collect();
        assert_debug_snapshot!(summary, @r"
        [
            (
                POINTER_DOWN(1),
                [
                    1,
                    0,
                ],
            ),
        ]
        ");

        for event in &replay {
            assert!(to.track_motion(event));
        }
    }

    #[test]
    fn merge_into_empty_state_replays_from_down() {
        let mut from = InputState::default();
        from.track_motion(&motion(MotionAction::DOWN, &[(0, 10., 20.)]));
        from.track_motion(&motion(
            MotionAction::pointer_down(1),
            &[(0, 10., 20.), (1, 30., 40.)],
        ));

        let mut to = InputState::default();
        from.merge_pointer_state_to(&mut to);

        let ids = IdGenerator::new(IdSource::InputDispatcher);
        let replay = to.synthesize_pointer_down_events(30, &ids);
        let actions: Vec<_> = replay.iter().map(|e| e.action).collect();
        assert_eq!(actions, [MotionAction::DOWN, MotionAction::pointer_down(1)]);
        assert_eq!(replay[0].pointers.len(), 1);
        assert_eq!(replay[1].pointers.len(), 2);
    }
}
