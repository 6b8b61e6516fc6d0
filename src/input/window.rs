//! Window information provided by the window manager.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;

use super::event::DisplayId;

/// Identifies one input connection. Several windows may share a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(u64);

impl Token {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token {}", self.0)
    }
}

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LayoutFlags: u32 {
        const NOT_FOCUSABLE = 0x0000_0008;
        const NOT_TOUCHABLE = 0x0000_0010;
        const NOT_TOUCH_MODAL = 0x0000_0020;
        const SPLIT_TOUCH = 0x0080_0000;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        (self.left as f32) <= x
            && x < self.right as f32
            && (self.top as f32) <= y
            && y < self.bottom as f32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputApplicationInfo {
    pub token: Token,
    pub name: String,
    pub dispatching_timeout: Duration,
}

impl InputApplicationInfo {
    pub fn new(name: &str) -> Self {
        Self {
            token: Token::new(),
            name: name.to_owned(),
            dispatching_timeout: default_dispatching_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputWindowInfo {
    pub token: Token,
    pub id: i32,
    pub name: String,
    pub display_id: DisplayId,
    pub frame: Rect,
    /// Empty means the frame.
    pub touchable_region: Vec<Rect>,
    pub layout_flags: LayoutFlags,
    pub visible: bool,
    pub paused: bool,
    pub focusable: bool,
    pub has_focus: bool,
    pub owner_pid: i32,
    pub owner_uid: i32,
    pub global_scale: f32,
    pub window_x_scale: f32,
    pub window_y_scale: f32,
    pub dispatching_timeout: Duration,
    pub application: Option<InputApplicationInfo>,
}

/// Snapshots are shared between the window list and touch states.
pub type WindowHandle = Arc<InputWindowInfo>;

fn default_dispatching_timeout() -> Duration {
    Duration::from_millis(u64::from(cadence_config::DEFAULT_DISPATCHING_TIMEOUT_MS))
}

impl InputWindowInfo {
    pub fn new(token: Token, name: &str, display_id: DisplayId) -> Self {
        Self {
            token,
            id: 0,
            name: name.to_owned(),
            display_id,
            frame: Rect::default(),
            touchable_region: Vec::new(),
            layout_flags: LayoutFlags::NOT_TOUCH_MODAL | LayoutFlags::SPLIT_TOUCH,
            visible: true,
            paused: false,
            focusable: true,
            has_focus: false,
            owner_pid: 0,
            owner_uid: 0,
            global_scale: 1.,
            window_x_scale: 1.,
            window_y_scale: 1.,
            dispatching_timeout: default_dispatching_timeout(),
            application: None,
        }
    }

    pub fn touchable_region_contains(&self, x: f32, y: f32) -> bool {
        if self.touchable_region.is_empty() {
            self.frame.contains(x, y)
        } else {
            self.touchable_region.iter().any(|rect| rect.contains(x, y))
        }
    }

    pub fn is_touchable(&self) -> bool {
        !self.layout_flags.contains(LayoutFlags::NOT_TOUCHABLE)
    }

    /// Touch-modal windows claim every touch on their display.
    pub fn is_touch_modal(&self) -> bool {
        !self
            .layout_flags
            .intersects(LayoutFlags::NOT_FOCUSABLE | LayoutFlags::NOT_TOUCH_MODAL)
    }

    pub fn supports_split_touch(&self) -> bool {
        self.layout_flags.contains(LayoutFlags::SPLIT_TOUCH)
    }

    pub fn can_receive_keys(&self) -> bool {
        self.focusable && !self.layout_flags.contains(LayoutFlags::NOT_FOCUSABLE)
    }

    pub fn transform(&self) -> WindowTransform {
        WindowTransform {
            left: self.frame.left as f32,
            top: self.frame.top as f32,
            x_scale: self.window_x_scale,
            y_scale: self.window_y_scale,
        }
    }
}

/// Maps display coordinates into a window's coordinate space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowTransform {
    pub left: f32,
    pub top: f32,
    pub x_scale: f32,
    pub y_scale: f32,
}

impl WindowTransform {
    pub const IDENTITY: Self = Self {
        left: 0.,
        top: 0.,
        x_scale: 1.,
        y_scale: 1.,
    };

    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.left) * self.x_scale, (y - self.top) * self.y_scale)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn frame_excludes_right_and_bottom_edges() {
        let rect = Rect::new(0, 0, 100, 100);
        assert!(rect.contains(0., 0.));
        assert!(rect.contains(99.5, 99.5));
        assert!(!rect.contains(100., 50.));
        assert!(!rect.contains(50., 100.));
    }

    #[test]
    fn touchable_region_overrides_frame() {
        let mut window = InputWindowInfo::new(Token::new(), "w", DisplayId::DEFAULT);
        window.frame = Rect::new(0, 0, 100, 100);
        assert!(window.touchable_region_contains(80., 80.));

        window.touchable_region = vec![Rect::new(0, 0, 50, 50)];
        assert!(window.touchable_region_contains(10., 10.));
        assert!(!window.touchable_region_contains(80., 80.));
    }

    #[test]
    fn touch_modal_flags() {
        let mut window = InputWindowInfo::new(Token::new(), "w", DisplayId::DEFAULT);
        assert!(!window.is_touch_modal());

        window.layout_flags = LayoutFlags::empty();
        assert!(window.is_touch_modal());

        window.layout_flags = LayoutFlags::NOT_FOCUSABLE;
        assert!(!window.is_touch_modal());
        assert!(!window.can_receive_keys());
    }

    #[test]
    fn transform_offsets_then_scales() {
        let mut window = InputWindowInfo::new(Token::new(), "w", DisplayId::DEFAULT);
        window.frame = Rect::new(100, 100, 200, 200);
        window.window_x_scale = 2.;
        window.window_y_scale = 0.5;

        let (x, y) = window.transform().apply(150., 160.);
        assert_relative_eq!(x, 100.);
        assert_relative_eq!(y, 30.);
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(Token::new(), Token::new());
    }
}
