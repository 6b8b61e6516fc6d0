//! Input events as they flow from producers through the dispatcher to windows.
//!
//! Action codes are kept raw ([`KeyAction`], [`MotionAction`]) so that malformed events coming
//! from injectors can be represented and then rejected by [`validate_key_event`] and
//! [`validate_motion_event`].

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use thiserror::Error;

use crate::utils::Nsecs;

pub const MAX_POINTERS: usize = 16;
pub const MAX_POINTER_ID: i32 = 31;

pub type DeviceId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DisplayId(pub i32);

impl DisplayId {
    /// Events that are not tied to a display. Keys and trackballs follow focus instead.
    pub const NONE: Self = Self(-1);
    pub const DEFAULT: Self = Self(0);

    pub fn is_none(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags! {
    /// Input source. The low byte is the source class.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Source: u32 {
        const KEYBOARD = 0x0000_0101;
        const DPAD = 0x0000_0201;
        const TOUCHSCREEN = 0x0000_1002;
        const MOUSE = 0x0000_2002;
        const STYLUS = 0x0000_4002;
        const TRACKBALL = 0x0001_0004;
    }
}

impl Source {
    const CLASS_POINTER: u32 = 0x2;
    const CLASS_NAVIGATION: u32 = 0x4;

    /// Pointer sources are routed by hit-testing, everything else follows focus.
    pub fn is_pointer(self) -> bool {
        self.bits() & Self::CLASS_POINTER != 0
    }

    pub fn is_navigation(self) -> bool {
        self.bits() & Self::CLASS_NAVIGATION != 0
    }
}

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PolicyFlags: u32 {
        const INJECTED = 0x0100_0000;
        const TRUSTED = 0x0200_0000;
        const FILTERED = 0x0400_0000;
        const DISABLE_KEY_REPEAT = 0x0800_0000;
        const PASS_TO_USER = 0x4000_0000;
    }
}

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KeyFlags: u32 {
        const WOKE_HERE = 0x1;
        const SOFT_KEYBOARD = 0x2;
        const CANCELED = 0x20;
        const LONG_PRESS = 0x80;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyAction(pub i32);

impl KeyAction {
    pub const DOWN: Self = Self(0);
    pub const UP: Self = Self(1);
    /// Legacy batched action. Never accepted.
    pub const MULTIPLE: Self = Self(2);
}

impl fmt::Debug for KeyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::DOWN => f.write_str("DOWN"),
            Self::UP => f.write_str("UP"),
            Self::MULTIPLE => f.write_str("MULTIPLE"),
            Self(code) => write!(f, "KeyAction({code})"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MotionAction(pub i32);

impl MotionAction {
    pub const DOWN: Self = Self(0);
    pub const UP: Self = Self(1);
    pub const MOVE: Self = Self(2);
    pub const CANCEL: Self = Self(3);
    pub const OUTSIDE: Self = Self(4);
    pub const POINTER_DOWN: Self = Self(5);
    pub const POINTER_UP: Self = Self(6);
    pub const HOVER_MOVE: Self = Self(7);
    pub const SCROLL: Self = Self(8);
    pub const HOVER_ENTER: Self = Self(9);
    pub const HOVER_EXIT: Self = Self(10);

    const MASK: i32 = 0xff;
    const POINTER_INDEX_MASK: i32 = 0xff00;
    const POINTER_INDEX_SHIFT: u32 = 8;

    pub fn pointer_down(index: usize) -> Self {
        Self::with_pointer_index(Self::POINTER_DOWN, index)
    }

    pub fn pointer_up(index: usize) -> Self {
        Self::with_pointer_index(Self::POINTER_UP, index)
    }

    /// `action` with the pointer index bits set to `index`.
    pub fn with_pointer_index(action: Self, index: usize) -> Self {
        let index = (index as i32) << Self::POINTER_INDEX_SHIFT;
        Self((action.0 & Self::MASK) | (index & Self::POINTER_INDEX_MASK))
    }

    /// The action without the pointer index bits.
    pub fn masked(self) -> Self {
        Self(self.0 & Self::MASK)
    }

    pub fn pointer_index(self) -> usize {
        ((self.0 & Self::POINTER_INDEX_MASK) >> Self::POINTER_INDEX_SHIFT) as usize
    }

    pub fn is_hover(self) -> bool {
        matches!(
            self.masked(),
            Self::HOVER_MOVE | Self::HOVER_ENTER | Self::HOVER_EXIT
        )
    }
}

impl fmt::Debug for MotionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.masked() {
            Self::DOWN => "DOWN",
            Self::UP => "UP",
            Self::MOVE => "MOVE",
            Self::CANCEL => "CANCEL",
            Self::OUTSIDE => "OUTSIDE",
            Self::POINTER_DOWN => return write!(f, "POINTER_DOWN({})", self.pointer_index()),
            Self::POINTER_UP => return write!(f, "POINTER_UP({})", self.pointer_index()),
            Self::HOVER_MOVE => "HOVER_MOVE",
            Self::SCROLL => "SCROLL",
            Self::HOVER_ENTER => "HOVER_ENTER",
            Self::HOVER_EXIT => "HOVER_EXIT",
            _ => return write!(f, "MotionAction({})", self.0),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolType {
    #[default]
    Unknown,
    Finger,
    Stylus,
    Mouse,
    Eraser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerProperties {
    pub id: i32,
    pub tool_type: ToolType,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PointerCoords {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pointer {
    pub properties: PointerProperties,
    pub coords: PointerCoords,
}

impl Pointer {
    pub fn finger(id: i32, x: f32, y: f32) -> Self {
        Self {
            properties: PointerProperties {
                id,
                tool_type: ToolType::Finger,
            },
            coords: PointerCoords { x, y },
        }
    }

    pub fn id(&self) -> i32 {
        self.properties.id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyEvent {
    pub id: i32,
    pub device_id: DeviceId,
    pub source: Source,
    pub display_id: DisplayId,
    pub action: KeyAction,
    pub flags: KeyFlags,
    pub key_code: i32,
    pub scan_code: i32,
    pub meta_state: i32,
    pub repeat_count: i32,
    pub down_time: Nsecs,
    pub event_time: Nsecs,
    pub policy_flags: PolicyFlags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MotionEvent {
    pub id: i32,
    pub device_id: DeviceId,
    pub source: Source,
    pub display_id: DisplayId,
    pub action: MotionAction,
    pub flags: u32,
    pub meta_state: i32,
    pub button_state: i32,
    pub down_time: Nsecs,
    pub event_time: Nsecs,
    pub policy_flags: PolicyFlags,
    /// Mouse events are hit-tested at the cursor rather than at the pointer coordinates.
    pub cursor_position: Option<(f32, f32)>,
    pub pointers: Vec<Pointer>,
}

impl MotionEvent {
    pub fn pointer_index_of(&self, id: i32) -> Option<usize> {
        self.pointers.iter().position(|p| p.id() == id)
    }

    /// The pointer the action refers to, for POINTER_DOWN and POINTER_UP.
    pub fn action_pointer(&self) -> Option<&Pointer> {
        self.pointers.get(self.action.pointer_index())
    }
}

/// An event handed to the dispatcher by an injector.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    Key(KeyEvent),
    Motion(MotionEvent),
}

impl InputEvent {
    pub fn event_time(&self) -> Nsecs {
        match self {
            InputEvent::Key(event) => event.event_time,
            InputEvent::Motion(event) => event.event_time,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidEventError {
    #[error("invalid key action {0:?}")]
    KeyAction(KeyAction),
    #[error("invalid motion action {0:?}")]
    MotionAction(MotionAction),
    #[error("pointer index {index} out of range for {count} pointers")]
    PointerIndex { index: usize, count: usize },
    #[error("invalid pointer count {0}, must be between 1 and {MAX_POINTERS}")]
    PointerCount(usize),
    #[error("invalid pointer id {0}, must be between 0 and {MAX_POINTER_ID}")]
    PointerId(i32),
    #[error("duplicate pointer id {0}")]
    DuplicatePointerId(i32),
}

pub fn validate_key_event(action: KeyAction) -> Result<(), InvalidEventError> {
    match action {
        KeyAction::DOWN | KeyAction::UP => Ok(()),
        _ => Err(InvalidEventError::KeyAction(action)),
    }
}

pub fn validate_motion_event(
    action: MotionAction,
    pointers: &[Pointer],
) -> Result<(), InvalidEventError> {
    match action.masked() {
        MotionAction::DOWN
        | MotionAction::UP
        | MotionAction::CANCEL
        | MotionAction::MOVE
        | MotionAction::OUTSIDE
        | MotionAction::HOVER_ENTER
        | MotionAction::HOVER_MOVE
        | MotionAction::HOVER_EXIT
        | MotionAction::SCROLL => (),
        MotionAction::POINTER_DOWN | MotionAction::POINTER_UP => {
            let index = action.pointer_index();
            if index >= pointers.len() {
                return Err(InvalidEventError::PointerIndex {
                    index,
                    count: pointers.len(),
                });
            }
        }
        _ => return Err(InvalidEventError::MotionAction(action)),
    }

    if pointers.is_empty() || pointers.len() > MAX_POINTERS {
        return Err(InvalidEventError::PointerCount(pointers.len()));
    }

    let mut seen = PointerIdBits::default();
    for pointer in pointers {
        let id = pointer.id();
        if !(0..=MAX_POINTER_ID).contains(&id) {
            return Err(InvalidEventError::PointerId(id));
        }
        if seen.has(id) {
            return Err(InvalidEventError::DuplicatePointerId(id));
        }
        seen.mark(id);
    }

    Ok(())
}

/// Set of pointer ids, each in `0..=MAX_POINTER_ID`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PointerIdBits(u32);

impl PointerIdBits {
    pub fn from_id(id: i32) -> Self {
        let mut bits = Self::default();
        bits.mark(id);
        bits
    }

    pub fn mark(&mut self, id: i32) {
        self.0 |= 1 << id;
    }

    pub fn clear(&mut self, id: i32) {
        self.0 &= !(1 << id);
    }

    pub fn has(self, id: i32) -> bool {
        (0..=MAX_POINTER_ID).contains(&id) && self.0 & (1 << id) != 0
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Which component issued an event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSource {
    InputReader = 0,
    InputDispatcher = 1,
    Other = 3,
}

/// Issues event ids that are unique per generator and carry their source in the top two bits.
#[derive(Debug)]
pub struct IdGenerator {
    source: IdSource,
    next: AtomicU32,
}

impl IdGenerator {
    const SOURCE_SHIFT: u32 = 30;
    const SOURCE_MASK: u32 = 0x3 << Self::SOURCE_SHIFT;

    pub fn new(source: IdSource) -> Self {
        Self {
            source,
            next: AtomicU32::new(1),
        }
    }

    pub fn next_id(&self) -> i32 {
        let seq = self.next.fetch_add(1, Ordering::Relaxed) & !Self::SOURCE_MASK;
        let source = (self.source as u32) << Self::SOURCE_SHIFT;
        (seq | source) as i32
    }

    pub fn source_of(id: i32) -> IdSource {
        match (id as u32) >> Self::SOURCE_SHIFT {
            0 => IdSource::InputReader,
            1 => IdSource::InputDispatcher,
            _ => IdSource::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use proptest_derive::Arbitrary;

    use super::*;

    fn fingers(ids: &[i32]) -> Vec<Pointer> {
        ids.iter().map(|&id| Pointer::finger(id, 0., 0.)).collect()
    }

    #[test]
    fn key_actions() {
        assert!(validate_key_event(KeyAction::DOWN).is_ok());
        assert!(validate_key_event(KeyAction::UP).is_ok());
        assert_eq!(
            validate_key_event(KeyAction::MULTIPLE),
            Err(InvalidEventError::KeyAction(KeyAction::MULTIPLE))
        );
        assert!(validate_key_event(KeyAction(-1)).is_err());
    }

    #[test]
    fn undefined_motion_actions() {
        let pointers = fingers(&[0]);
        assert!(validate_motion_event(MotionAction(-1), &pointers).is_err());
        assert!(validate_motion_event(MotionAction(11), &pointers).is_err());
        assert!(validate_motion_event(MotionAction::DOWN, &pointers).is_ok());
    }

    #[test]
    fn pointer_index_must_be_in_range() {
        let pointers = fingers(&[0]);

        assert_eq!(
            validate_motion_event(MotionAction::pointer_down(1), &pointers),
            Err(InvalidEventError::PointerIndex { index: 1, count: 1 })
        );
        // All index bits set.
        let all_bits = MotionAction(MotionAction::POINTER_UP.0 | !0xff);
        assert!(validate_motion_event(all_bits, &pointers).is_err());

        assert!(validate_motion_event(MotionAction::pointer_up(1), &fingers(&[0, 1])).is_ok());
    }

    #[test]
    fn pointer_count_limits() {
        assert_eq!(
            validate_motion_event(MotionAction::DOWN, &[]),
            Err(InvalidEventError::PointerCount(0))
        );

        let ids: Vec<i32> = (0..=MAX_POINTERS as i32).collect();
        assert_eq!(
            validate_motion_event(MotionAction::DOWN, &fingers(&ids)),
            Err(InvalidEventError::PointerCount(MAX_POINTERS + 1))
        );
    }

    #[test]
    fn pointer_id_limits() {
        assert_eq!(
            validate_motion_event(MotionAction::DOWN, &fingers(&[-1])),
            Err(InvalidEventError::PointerId(-1))
        );
        assert_eq!(
            validate_motion_event(MotionAction::DOWN, &fingers(&[MAX_POINTER_ID + 1])),
            Err(InvalidEventError::PointerId(MAX_POINTER_ID + 1))
        );
        assert_eq!(
            validate_motion_event(MotionAction::pointer_down(1), &fingers(&[1, 1])),
            Err(InvalidEventError::DuplicatePointerId(1))
        );
    }

    #[test]
    fn action_debug_names() {
        assert_eq!(format!("{:?}", MotionAction::pointer_down(2)), "POINTER_DOWN(2)");
        assert_eq!(format!("{:?}", MotionAction::HOVER_EXIT), "HOVER_EXIT");
        assert_eq!(format!("{:?}", MotionAction(42)), "MotionAction(42)");
        assert_eq!(format!("{:?}", KeyAction(7)), "KeyAction(7)");
    }

    #[test]
    fn source_classes() {
        assert!(Source::TOUCHSCREEN.is_pointer());
        assert!(Source::MOUSE.is_pointer());
        assert!(!Source::KEYBOARD.is_pointer());
        assert!(!Source::TRACKBALL.is_pointer());
        assert!(Source::TRACKBALL.is_navigation());
    }

    #[test]
    fn id_generator_tags_source() {
        let generator = IdGenerator::new(IdSource::InputDispatcher);
        let a = generator.next_id();
        let b = generator.next_id();
        assert_ne!(a, b);
        assert_eq!(IdGenerator::source_of(a), IdSource::InputDispatcher);

        let other = IdGenerator::new(IdSource::Other);
        assert_eq!(IdGenerator::source_of(other.next_id()), IdSource::Other);
    }

    #[derive(Debug, Arbitrary)]
    struct GeneratedPointers {
        #[proptest(strategy = "proptest::collection::vec(-2i32..40, 0..20)")]
        ids: Vec<i32>,
    }

    proptest! {
        #[test]
        fn validation_matches_pointer_rules(generated: GeneratedPointers) {
            let ids = &generated.ids;
            let in_range = ids.iter().all(|id| (0..=MAX_POINTER_ID).contains(id));
            let mut unique = ids.clone();
            unique.sort_unstable();
            unique.dedup();
            let expected = !ids.is_empty()
                && ids.len() <= MAX_POINTERS
                && in_range
                && unique.len() == ids.len();

            let result = validate_motion_event(MotionAction::MOVE, &fingers(ids));
            prop_assert_eq!(result.is_ok(), expected);
        }
    }
}
