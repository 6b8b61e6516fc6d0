//! Decisions the dispatcher delegates to the window manager.

use std::time::Duration;

use crate::input::event::{InputEvent, KeyEvent, MotionEvent, PolicyFlags};
use crate::input::window::{InputApplicationInfo, Token};
use crate::utils::Nsecs;

/// What to do about a window or application that stopped acknowledging input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnrResponse {
    /// Give it this much more time.
    Wait(Duration),
    /// Drop everything outstanding for it.
    Abort,
}

pub trait InputDispatcherPolicy: Send + Sync {
    fn notify_configuration_changed(&self, when: Nsecs) {
        let _ = when;
    }

    fn notify_switch(&self, when: Nsecs, switch_values: u32, switch_mask: u32, flags: PolicyFlags) {
        let _ = (when, switch_values, switch_mask, flags);
    }

    /// `window` is `None` when the application has no focused window to deliver to.
    fn notify_anr(
        &self,
        application: Option<&InputApplicationInfo>,
        window: Option<Token>,
        reason: &str,
    ) -> AnrResponse;

    fn notify_input_channel_broken(&self, token: Token) {
        let _ = token;
    }

    fn notify_focus_changed(&self, old: Option<Token>, new: Option<Token>) {
        let _ = (old, new);
    }

    /// Returns `false` to consume the event. Only called while the input filter is enabled.
    fn filter_input_event(&self, event: &InputEvent, policy_flags: PolicyFlags) -> bool {
        let _ = (event, policy_flags);
        true
    }

    fn intercept_key_before_queueing(&self, event: &KeyEvent, policy_flags: &mut PolicyFlags) {
        let _ = (event, policy_flags);
    }

    fn intercept_motion_before_queueing(&self, event: &MotionEvent, policy_flags: &mut PolicyFlags) {
        let _ = (event, policy_flags);
    }

    fn check_inject_events_permission(&self, injector_pid: i32, injector_uid: i32) -> bool;

    /// A touch went down on a window that does not have focus.
    fn on_pointer_down_outside_focus(&self, token: Token) {
        let _ = token;
    }
}
