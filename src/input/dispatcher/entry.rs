//! Queue entries and dispatch targets.

use std::collections::BTreeMap;
use std::fmt;

use bitflags::bitflags;

use super::injection::SharedInjectionState;
use crate::input::channel::{FocusEvent, InputMessageBody};
use crate::input::event::{DeviceId, KeyEvent, MotionEvent, PointerIdBits, MAX_POINTER_ID};
use crate::input::window::{InputWindowInfo, Token, WindowTransform};
use crate::utils::Nsecs;

/// An entry in the dispatcher's inbound queue.
pub(crate) enum EventEntry {
    Key(KeyEntry),
    Motion(MotionEntry),
    DeviceReset {
        event_time: Nsecs,
        device_id: DeviceId,
    },
    Focus(FocusEntry),
    ConfigurationChanged {
        event_time: Nsecs,
    },
}

impl EventEntry {
    pub fn event_time(&self) -> Nsecs {
        match self {
            EventEntry::Key(entry) => entry.event.event_time,
            EventEntry::Motion(entry) => entry.event.event_time,
            EventEntry::DeviceReset { event_time, .. } => *event_time,
            EventEntry::Focus(entry) => entry.event_time,
            EventEntry::ConfigurationChanged { event_time } => *event_time,
        }
    }
}

impl fmt::Debug for EventEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventEntry::Key(entry) => write!(
                f,
                "Key {{ id: {}, action: {:?}, key_code: {}, display: {} }}",
                entry.event.id, entry.event.action, entry.event.key_code, entry.event.display_id
            ),
            EventEntry::Motion(entry) => write!(
                f,
                "Motion {{ id: {}, action: {:?}, pointers: {}, display: {} }}",
                entry.event.id,
                entry.event.action,
                entry.event.pointers.len(),
                entry.event.display_id
            ),
            EventEntry::DeviceReset { device_id, .. } => {
                write!(f, "DeviceReset {{ device: {device_id} }}")
            }
            EventEntry::Focus(entry) => write!(
                f,
                "Focus {{ {}, has_focus: {} }}",
                entry.token, entry.has_focus
            ),
            EventEntry::ConfigurationChanged { .. } => f.write_str("ConfigurationChanged"),
        }
    }
}

pub(crate) struct KeyEntry {
    pub event: KeyEvent,
    pub injection: Option<SharedInjectionState>,
    /// Generated by the dispatcher's key repeat.
    pub synthetic_repeat: bool,
    /// Set once key repeat bookkeeping ran, so a key that has to wait is not counted twice.
    pub dispatch_in_progress: bool,
}

impl KeyEntry {
    pub fn new(event: KeyEvent, injection: Option<SharedInjectionState>) -> Self {
        Self {
            event,
            injection,
            synthetic_repeat: false,
            dispatch_in_progress: false,
        }
    }
}

pub(crate) struct MotionEntry {
    pub event: MotionEvent,
    pub injection: Option<SharedInjectionState>,
}

pub(crate) struct FocusEntry {
    pub id: i32,
    pub token: Token,
    pub has_focus: bool,
    pub in_touch_mode: bool,
    pub event_time: Nsecs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DropReason {
    /// The policy did not pass the event to the user.
    Policy,
    /// The event sat in the queue for too long.
    Stale,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::Policy => "inbound event was dropped because the policy consumed it",
            DropReason::Stale => "inbound event was dropped because it is stale",
        }
    }
}

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TargetFlags: u32 {
        /// The target is the one the event was meant for, as opposed to an observer.
        const FOREGROUND = 0x1;
        /// Only the target's own pointers are delivered.
        const SPLIT = 0x4;
    }
}

/// Where one event goes, and how its coordinates map into the receiver's space.
#[derive(Debug, Clone)]
pub(crate) struct InputTarget {
    pub token: Token,
    pub flags: TargetFlags,
    /// Empty for targets that get every pointer.
    pub pointer_ids: PointerIdBits,
    pub transforms: PointerTransforms,
}

impl InputTarget {
    pub fn window(window: &InputWindowInfo, flags: TargetFlags) -> Self {
        Self {
            token: window.token,
            flags,
            pointer_ids: PointerIdBits::default(),
            transforms: PointerTransforms::new(window.transform()),
        }
    }

    pub fn monitor(token: Token) -> Self {
        Self {
            token,
            flags: TargetFlags::empty(),
            pointer_ids: PointerIdBits::default(),
            transforms: PointerTransforms::new(WindowTransform::IDENTITY),
        }
    }

    /// Adds pointers that belong to `window`, which may be one of several windows sharing
    /// this target's token.
    pub fn add_pointers(&mut self, pointer_ids: PointerIdBits, window: &InputWindowInfo) {
        let transform = window.transform();
        if pointer_ids.is_empty() {
            self.transforms.default = transform;
            return;
        }

        self.pointer_ids = self.pointer_ids.union(pointer_ids);
        for id in 0..=MAX_POINTER_ID {
            if pointer_ids.has(id) {
                self.transforms.per_pointer.insert(id, transform);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PointerTransforms {
    pub default: WindowTransform,
    pub per_pointer: BTreeMap<i32, WindowTransform>,
}

impl PointerTransforms {
    pub fn new(default: WindowTransform) -> Self {
        Self {
            default,
            per_pointer: BTreeMap::new(),
        }
    }

    pub fn for_pointer(&self, id: i32) -> &WindowTransform {
        self.per_pointer.get(&id).unwrap_or(&self.default)
    }

    pub fn apply(&self, event: &mut MotionEvent) {
        for pointer in &mut event.pointers {
            let (x, y) = self
                .for_pointer(pointer.id())
                .apply(pointer.coords.x, pointer.coords.y);
            pointer.coords.x = x;
            pointer.coords.y = y;
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum DispatchEvent {
    Key(KeyEvent),
    Motion(MotionEvent),
    Focus(FocusEvent),
}

/// An event queued for, or awaiting acknowledgment from, one connection.
///
/// Foreground entries of an injected event count as pending dispatches of that injection for
/// as long as they live.
pub(crate) struct DispatchEntry {
    pub event: DispatchEvent,
    pub flags: TargetFlags,
    pub transforms: PointerTransforms,
    pub injection: Option<SharedInjectionState>,
    /// Assigned when published.
    pub seq: u32,
    pub delivery_time: Nsecs,
    pub timeout_time: Nsecs,
}

impl DispatchEntry {
    pub fn new(
        event: DispatchEvent,
        target: &InputTarget,
        injection: Option<SharedInjectionState>,
    ) -> Self {
        if target.flags.contains(TargetFlags::FOREGROUND) {
            if let Some(injection) = &injection {
                injection.borrow_mut().increment_pending();
            }
        }

        Self {
            event,
            flags: target.flags,
            transforms: target.transforms.clone(),
            injection,
            seq: 0,
            delivery_time: 0,
            timeout_time: 0,
        }
    }

    pub fn has_foreground_target(&self) -> bool {
        self.flags.contains(TargetFlags::FOREGROUND)
    }

    pub fn event_time(&self) -> Option<Nsecs> {
        match &self.event {
            DispatchEvent::Key(event) => Some(event.event_time),
            DispatchEvent::Motion(event) => Some(event.event_time),
            DispatchEvent::Focus(_) => None,
        }
    }

    /// The message as the window sees it, in window coordinates.
    pub fn to_message(&self) -> InputMessageBody {
        match &self.event {
            DispatchEvent::Key(event) => InputMessageBody::Key(event.clone()),
            DispatchEvent::Motion(event) => {
                let mut event = event.clone();
                self.transforms.apply(&mut event);
                InputMessageBody::Motion(event)
            }
            DispatchEvent::Focus(event) => InputMessageBody::Focus(*event),
        }
    }
}

impl Drop for DispatchEntry {
    fn drop(&mut self) {
        if self.has_foreground_target() {
            if let Some(injection) = &self.injection {
                injection.borrow_mut().decrement_pending();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::input::event::{DisplayId, MotionAction, Pointer, PolicyFlags, Source};
    use crate::input::window::Rect;

    fn window_at(token: Token, left: i32, top: i32, scale: f32) -> InputWindowInfo {
        let mut window = InputWindowInfo::new(token, "w", DisplayId::DEFAULT);
        window.frame = Rect::new(left, top, left + 100, top + 100);
        window.window_x_scale = scale;
        window.window_y_scale = scale;
        window
    }

    #[test]
    fn shared_token_windows_transform_their_own_pointers() {
        let token = Token::new();
        let first = window_at(token, 0, 0, 2.);
        let second = window_at(token, 100, 100, 4.);

        let mut target = InputTarget::window(&first, TargetFlags::FOREGROUND);
        target.add_pointers(PointerIdBits::from_id(0), &first);
        target.add_pointers(PointerIdBits::from_id(1), &second);
        assert_eq!(target.pointer_ids.count(), 2);

        let mut event = MotionEvent {
            id: 1,
            device_id: 1,
            source: Source::TOUCHSCREEN,
            display_id: DisplayId::DEFAULT,
            action: MotionAction::pointer_down(1),
            flags: 0,
            meta_state: 0,
            button_state: 0,
            down_time: 0,
            event_time: 0,
            policy_flags: PolicyFlags::empty(),
            cursor_position: None,
            pointers: vec![Pointer::finger(0, 50., 50.), Pointer::finger(1, 150., 150.)],
        };
        target.transforms.apply(&mut event);

        assert_relative_eq!(event.pointers[0].coords.x, 100.);
        assert_relative_eq!(event.pointers[1].coords.x, 200.);
        assert_relative_eq!(event.pointers[1].coords.y, 200.);
    }
}
