//! Events injected by other processes, and how their outcome gets back to the injector.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use tracing::warn;

use super::policy::InputDispatcherPolicy;
use crate::input::event::{validate_key_event, validate_motion_event, InputEvent, PolicyFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionResult {
    Succeeded,
    Failed,
    PermissionDenied,
    /// The injector stopped waiting. The event may still be delivered.
    TimedOut,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Return as soon as the event is queued.
    #[default]
    None,
    /// Wait until the event has been published to its targets.
    WaitForResult,
    /// Wait until every foreground target has acknowledged the event.
    WaitForFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Injector {
    pub pid: i32,
    pub uid: i32,
}

/// An injected event that passed validation and permission checks.
#[derive(Debug, Clone)]
pub struct PreparedInjection {
    pub event: InputEvent,
    pub injector: Injector,
}

pub(crate) fn has_injection_permission(policy: &dyn InputDispatcherPolicy, injector: Injector) -> bool {
    injector.uid == 0 || policy.check_inject_events_permission(injector.pid, injector.uid)
}

/// Validates an injected event and resolves its policy flags. Runs on the injector's thread.
pub fn prepare_injection(
    policy: &dyn InputDispatcherPolicy,
    mut event: InputEvent,
    injector: Injector,
    policy_flags: PolicyFlags,
) -> Result<PreparedInjection, InjectionResult> {
    let valid = match &event {
        InputEvent::Key(key) => validate_key_event(key.action),
        InputEvent::Motion(motion) => validate_motion_event(motion.action, &motion.pointers),
    };
    if let Err(err) = valid {
        warn!("rejecting injected event from pid {}: {err}", injector.pid);
        return Err(InjectionResult::Failed);
    }

    let has_permission = has_injection_permission(policy, injector);
    if policy_flags.contains(PolicyFlags::TRUSTED) && !has_permission {
        warn!(
            "pid {} uid {} may not inject trusted events",
            injector.pid, injector.uid
        );
        return Err(InjectionResult::PermissionDenied);
    }

    let mut flags = policy_flags | PolicyFlags::INJECTED;
    if has_permission {
        flags |= PolicyFlags::TRUSTED;
    }

    match &mut event {
        InputEvent::Key(key) => {
            if !flags.contains(PolicyFlags::FILTERED) {
                policy.intercept_key_before_queueing(key, &mut flags);
            }
            key.policy_flags = flags;
        }
        InputEvent::Motion(motion) => {
            if !flags.contains(PolicyFlags::FILTERED) {
                policy.intercept_motion_before_queueing(motion, &mut flags);
            }
            motion.policy_flags = flags;
        }
    }

    Ok(PreparedInjection { event, injector })
}

/// Lets an injector wait for the outcome of its injection.
#[derive(Debug)]
pub struct InjectionWaiter {
    receiver: Option<mpsc::Receiver<InjectionResult>>,
}

impl InjectionWaiter {
    pub(crate) fn new(sync_mode: SyncMode) -> (Self, Option<mpsc::Sender<InjectionResult>>) {
        if sync_mode == SyncMode::None {
            return (Self { receiver: None }, None);
        }
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                receiver: Some(receiver),
            },
            Some(sender),
        )
    }

    /// Blocks until the result arrives or `timeout` passes. Injections without a sync mode
    /// succeed as soon as they are queued.
    pub fn wait(self, timeout: Duration) -> InjectionResult {
        let Some(receiver) = self.receiver else {
            return InjectionResult::Succeeded;
        };
        match receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => InjectionResult::TimedOut,
            Err(RecvTimeoutError::Disconnected) => InjectionResult::Failed,
        }
    }

    /// The result, if it already arrived.
    pub fn try_result(&self) -> Option<InjectionResult> {
        self.receiver.as_ref()?.try_recv().ok()
    }
}

/// Outcome tracking for one injected event, shared by every entry that carries it.
///
/// The result is sent at most once. An injection that is dropped before it resolves reports
/// [`InjectionResult::Failed`].
#[derive(Debug)]
pub(crate) struct InjectionState {
    pub injector: Injector,
    sync_mode: SyncMode,
    result: Option<InjectionResult>,
    pending_foreground_dispatches: usize,
    sender: Option<mpsc::Sender<InjectionResult>>,
}

pub(crate) type SharedInjectionState = Rc<RefCell<InjectionState>>;

impl InjectionState {
    pub fn new(
        injector: Injector,
        sync_mode: SyncMode,
        sender: Option<mpsc::Sender<InjectionResult>>,
    ) -> SharedInjectionState {
        Rc::new(RefCell::new(Self {
            injector,
            sync_mode,
            result: None,
            pending_foreground_dispatches: 0,
            sender,
        }))
    }

    pub fn result(&self) -> Option<InjectionResult> {
        self.result
    }

    pub fn set_result(&mut self, result: InjectionResult) {
        if self.result.is_some() {
            return;
        }
        self.result = Some(result);

        let done = match self.sync_mode {
            SyncMode::WaitForFinished => {
                result != InjectionResult::Succeeded || self.pending_foreground_dispatches == 0
            }
            SyncMode::None | SyncMode::WaitForResult => true,
        };
        if done {
            self.send();
        }
    }

    pub fn increment_pending(&mut self) {
        self.pending_foreground_dispatches += 1;
    }

    pub fn decrement_pending(&mut self) {
        self.pending_foreground_dispatches = self.pending_foreground_dispatches.saturating_sub(1);
        if self.pending_foreground_dispatches == 0
            && self.result == Some(InjectionResult::Succeeded)
        {
            self.send();
        }
    }

    fn send(&mut self) {
        if let Some(sender) = self.sender.take() {
            // The injector may have stopped waiting.
            let _ = sender.send(self.result.unwrap_or(InjectionResult::Failed));
        }
    }
}

impl Drop for InjectionState {
    fn drop(&mut self) {
        if self.result.is_none() {
            self.result = Some(InjectionResult::Failed);
        }
        self.send();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::dispatcher::policy::AnrResponse;
    use crate::input::event::{DisplayId, KeyAction, KeyEvent, KeyFlags, Source};
    use crate::input::window::{InputApplicationInfo, Token};

    struct Policy {
        allow: bool,
    }

    impl InputDispatcherPolicy for Policy {
        fn notify_anr(
            &self,
            _application: Option<&InputApplicationInfo>,
            _window: Option<Token>,
            _reason: &str,
        ) -> AnrResponse {
            AnrResponse::Abort
        }

        fn check_inject_events_permission(&self, _pid: i32, _uid: i32) -> bool {
            self.allow
        }
    }

    fn key(action: KeyAction) -> InputEvent {
        InputEvent::Key(KeyEvent {
            id: 1,
            device_id: 1,
            source: Source::KEYBOARD,
            display_id: DisplayId::NONE,
            action,
            flags: KeyFlags::empty(),
            key_code: 29,
            scan_code: 0,
            meta_state: 0,
            repeat_count: 0,
            down_time: 0,
            event_time: 0,
            policy_flags: PolicyFlags::empty(),
        })
    }

    const INJECTOR: Injector = Injector {
        pid: 999,
        uid: 1001,
    };

    #[test]
    fn invalid_event_fails() {
        let policy = Policy { allow: true };
        let result = prepare_injection(
            &policy,
            key(KeyAction::MULTIPLE),
            INJECTOR,
            PolicyFlags::empty(),
        );
        assert_eq!(result.unwrap_err(), InjectionResult::Failed);
    }

    #[test]
    fn trusted_flag_needs_permission() {
        let policy = Policy { allow: false };
        let result = prepare_injection(&policy, key(KeyAction::DOWN), INJECTOR, PolicyFlags::TRUSTED);
        assert_eq!(result.unwrap_err(), InjectionResult::PermissionDenied);

        let prepared =
            prepare_injection(&policy, key(KeyAction::DOWN), INJECTOR, PolicyFlags::empty())
                .unwrap();
        let InputEvent::Key(event) = prepared.event else {
            panic!("expected a key");
        };
        assert_eq!(event.policy_flags, PolicyFlags::INJECTED);
    }

    #[test]
    fn permitted_injector_is_trusted() {
        let policy = Policy { allow: true };
        let prepared = prepare_injection(
            &policy,
            key(KeyAction::DOWN),
            INJECTOR,
            PolicyFlags::PASS_TO_USER,
        )
        .unwrap();
        let InputEvent::Key(event) = prepared.event else {
            panic!("expected a key");
        };
        assert_eq!(
            event.policy_flags,
            PolicyFlags::PASS_TO_USER | PolicyFlags::INJECTED | PolicyFlags::TRUSTED
        );
    }

    #[test]
    fn wait_for_finished_waits_for_pending_dispatches() {
        let (tx, rx) = mpsc::channel();
        let state = InjectionState::new(INJECTOR, SyncMode::WaitForFinished, Some(tx));

        state.borrow_mut().increment_pending();
        state.borrow_mut().set_result(InjectionResult::Succeeded);
        assert!(rx.try_recv().is_err());

        state.borrow_mut().decrement_pending();
        assert_eq!(rx.try_recv(), Ok(InjectionResult::Succeeded));
    }

    #[test]
    fn unresolved_injection_fails_on_drop() {
        let (tx, rx) = mpsc::channel();
        let state = InjectionState::new(INJECTOR, SyncMode::WaitForResult, Some(tx));
        drop(state);
        assert_eq!(rx.try_recv(), Ok(InjectionResult::Failed));
    }

    #[test]
    fn result_is_sent_once() {
        let (tx, rx) = mpsc::channel();
        let state = InjectionState::new(INJECTOR, SyncMode::WaitForResult, Some(tx));
        state.borrow_mut().set_result(InjectionResult::Succeeded);
        state.borrow_mut().set_result(InjectionResult::Failed);
        drop(state);

        assert_eq!(rx.try_iter().collect::<Vec<_>>(), [InjectionResult::Succeeded]);
    }
}
