//! Hit-testing and focus.
//!
//! Window lists are ordered top to bottom, and the first match wins everywhere here.

use std::collections::BTreeMap;

use crate::input::event::DisplayId;
use crate::input::window::{InputApplicationInfo, Token, WindowHandle};

/// The topmost window that takes a touch at `(x, y)`.
///
/// Touch-modal windows take every touch that reaches them, others only touches inside their
/// touchable region.
pub(crate) fn find_touched_window_at(
    windows: &[WindowHandle],
    x: f32,
    y: f32,
) -> Option<WindowHandle> {
    windows
        .iter()
        .find(|w| {
            w.visible
                && !w.paused
                && w.is_touchable()
                && (w.is_touch_modal() || w.touchable_region_contains(x, y))
        })
        .cloned()
}

/// The first window in the list that holds focus and can take keys.
pub(crate) fn find_focused_window(windows: &[WindowHandle]) -> Option<WindowHandle> {
    windows
        .iter()
        .find(|w| w.has_focus && w.can_receive_keys())
        .cloned()
}

#[derive(Debug)]
pub(crate) struct FocusState {
    /// Where keys without a display go.
    pub focused_display: DisplayId,
    windows: BTreeMap<DisplayId, WindowHandle>,
    applications: BTreeMap<DisplayId, InputApplicationInfo>,
}

impl Default for FocusState {
    fn default() -> Self {
        Self {
            focused_display: DisplayId::DEFAULT,
            windows: BTreeMap::new(),
            applications: BTreeMap::new(),
        }
    }
}

impl FocusState {
    /// Resolves events without a display to the focused display.
    pub fn target_display(&self, display: DisplayId) -> DisplayId {
        if display.is_none() {
            self.focused_display
        } else {
            display
        }
    }

    pub fn focused_window(&self, display: DisplayId) -> Option<&WindowHandle> {
        self.windows.get(&display)
    }

    pub fn focused_token(&self, display: DisplayId) -> Option<Token> {
        self.focused_window(display).map(|w| w.token)
    }

    pub fn focused_application(&self, display: DisplayId) -> Option<&InputApplicationInfo> {
        self.applications.get(&display)
    }

    /// Replaces the focused window of `display` and returns the previous one.
    pub fn set_focused_window(
        &mut self,
        display: DisplayId,
        window: Option<WindowHandle>,
    ) -> Option<WindowHandle> {
        match window {
            Some(window) => self.windows.insert(display, window),
            None => self.windows.remove(&display),
        }
    }

    /// Returns whether the focused application changed.
    pub fn set_focused_application(
        &mut self,
        display: DisplayId,
        application: Option<InputApplicationInfo>,
    ) -> bool {
        let old = match application {
            Some(application) => {
                let changed = self.applications.get(&display) != Some(&application);
                self.applications.insert(display, application);
                return changed;
            }
            None => self.applications.remove(&display),
        };
        old.is_some()
    }

    /// Displays whose focused window belongs to `token`.
    pub fn displays_focused_on(&self, token: Token) -> Vec<DisplayId> {
        self.windows
            .iter()
            .filter(|(_, w)| w.token == token)
            .map(|(display, _)| *display)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::input::window::{InputWindowInfo, LayoutFlags, Rect};

    fn window(name: &str, frame: Rect) -> InputWindowInfo {
        let mut info = InputWindowInfo::new(Token::new(), name, DisplayId::DEFAULT);
        info.frame = frame;
        info
    }

    #[test]
    fn topmost_containing_window_wins() {
        let top = window("top", Rect::new(0, 0, 100, 100));
        let bottom = window("bottom", Rect::new(0, 0, 600, 800));
        let windows = [Arc::new(top), Arc::new(bottom)];

        let hit = find_touched_window_at(&windows, 50., 50.).unwrap();
        assert_eq!(hit.name, "top");
        let hit = find_touched_window_at(&windows, 300., 300.).unwrap();
        assert_eq!(hit.name, "bottom");
        assert!(find_touched_window_at(&windows, 700., 700.).is_none());
    }

    #[test]
    fn hidden_paused_and_untouchable_windows_are_skipped() {
        let mut hidden = window("hidden", Rect::new(0, 0, 100, 100));
        hidden.visible = false;
        let mut paused = window("paused", Rect::new(0, 0, 100, 100));
        paused.paused = true;
        let mut untouchable = window("untouchable", Rect::new(0, 0, 100, 100));
        untouchable.layout_flags |= LayoutFlags::NOT_TOUCHABLE;
        let below = window("below", Rect::new(0, 0, 100, 100));

        let windows = [hidden, paused, untouchable, below].map(Arc::new);
        assert_eq!(find_touched_window_at(&windows, 10., 10.).unwrap().name, "below");
    }

    #[test]
    fn touch_modal_window_claims_outside_touches() {
        let mut modal = window("modal", Rect::new(0, 0, 100, 100));
        modal.layout_flags = LayoutFlags::empty();
        let below = window("below", Rect::new(0, 0, 600, 800));

        let windows = [modal, below].map(Arc::new);
        assert_eq!(find_touched_window_at(&windows, 300., 300.).unwrap().name, "modal");
    }

    #[test]
    fn first_focused_window_wins() {
        let mut a = window("a", Rect::default());
        a.has_focus = true;
        let mut b = window("b", Rect::default());
        b.has_focus = true;
        let mut unfocusable = window("unfocusable", Rect::default());
        unfocusable.has_focus = true;
        unfocusable.focusable = false;

        let windows = [unfocusable, a, b].map(Arc::new);
        assert_eq!(find_focused_window(&windows).unwrap().name, "a");
    }

    #[test]
    fn events_without_display_follow_focused_display() {
        let mut focus = FocusState::default();
        assert_eq!(focus.target_display(DisplayId::NONE), DisplayId::DEFAULT);

        focus.focused_display = DisplayId(1);
        assert_eq!(focus.target_display(DisplayId::NONE), DisplayId(1));
        assert_eq!(focus.target_display(DisplayId(0)), DisplayId(0));
    }

    #[test]
    fn focused_application_changes() {
        let mut focus = FocusState::default();
        let app = InputApplicationInfo::new("app");

        assert!(focus.set_focused_application(DisplayId::DEFAULT, Some(app.clone())));
        assert!(!focus.set_focused_application(DisplayId::DEFAULT, Some(app)));
        assert!(focus.set_focused_application(DisplayId::DEFAULT, None));
        assert!(!focus.set_focused_application(DisplayId::DEFAULT, None));
    }
}
