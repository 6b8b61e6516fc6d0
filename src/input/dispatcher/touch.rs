//! Which windows own the pointers of the touch stream on one display.

use super::entry::TargetFlags;
use crate::input::event::{DeviceId, DisplayId, PointerIdBits, Source};
use crate::input::window::{Token, WindowHandle};

#[derive(Debug, Clone)]
pub(crate) struct TouchedWindow {
    pub window: WindowHandle,
    pub flags: TargetFlags,
    /// Empty unless the stream is split.
    pub pointer_ids: PointerIdBits,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct TouchState {
    pub down: bool,
    pub split: bool,
    pub device_id: Option<DeviceId>,
    pub source: Option<Source>,
    pub display_id: Option<DisplayId>,
    pub windows: Vec<TouchedWindow>,
    pub gesture_monitors: Vec<Token>,
}

impl TouchState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether `device_id`/`source`/`display_id` differs from the stream in progress.
    pub fn is_switched_device(
        &self,
        device_id: DeviceId,
        source: Source,
        display_id: DisplayId,
    ) -> bool {
        match (self.device_id, self.source, self.display_id) {
            (Some(d), Some(s), Some(disp)) => d != device_id || s != source || disp != display_id,
            _ => false,
        }
    }

    /// Adds `window` or updates it if it is already touched. Windows are matched by token and
    /// id, so several windows of one token stay separate entries.
    pub fn add_or_update_window(
        &mut self,
        window: WindowHandle,
        flags: TargetFlags,
        pointer_ids: PointerIdBits,
    ) {
        if flags.contains(TargetFlags::SPLIT) {
            self.split = true;
        }

        let existing = self
            .windows
            .iter_mut()
            .find(|w| w.window.token == window.token && w.window.id == window.id);
        match existing {
            Some(touched) => {
                touched.flags |= flags;
                if flags.contains(TargetFlags::SPLIT) {
                    touched.pointer_ids = touched.pointer_ids.union(pointer_ids);
                }
            }
            None => self.windows.push(TouchedWindow {
                window,
                flags,
                pointer_ids,
            }),
        }
    }

    pub fn add_gesture_monitors(&mut self, monitors: &[Token]) {
        for monitor in monitors {
            if !self.gesture_monitors.contains(monitor) {
                self.gesture_monitors.push(*monitor);
            }
        }
    }

    /// Removes every window of `token`. Returns whether any was touched.
    pub fn remove_token(&mut self, token: Token) -> bool {
        let before = self.windows.len();
        self.windows.retain(|w| w.window.token != token);
        before != self.windows.len()
    }

    /// Stops dispatching to windows while the gesture monitors keep the stream.
    pub fn filter_non_monitors(&mut self) {
        self.windows.clear();
    }

    pub fn first_foreground_window(&self) -> Option<&WindowHandle> {
        self.windows
            .iter()
            .find(|w| w.flags.contains(TargetFlags::FOREGROUND))
            .map(|w| &w.window)
    }

    /// Drops `pointer_id` from split windows, removing windows left without pointers.
    pub fn remove_split_pointer(&mut self, pointer_id: i32) {
        self.windows.retain_mut(|w| {
            if !w.flags.contains(TargetFlags::SPLIT) {
                return true;
            }
            w.pointer_ids.clear(pointer_id);
            !w.pointer_ids.is_empty()
        });
    }
}
