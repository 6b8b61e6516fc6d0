//! The dispatcher's own thread.
//!
//! [`InputDispatcherThread`] owns an [`InputDispatcher`] on a dedicated thread running a
//! `calloop` event loop. Everything else talks to it through [`InputDispatcherHandle`], which
//! forwards calls over a `calloop` channel. Finished signals from windows wake the loop through a
//! `calloop` ping, and the loop otherwise sleeps until the next wakeup the dispatcher asks for.

use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context};
use calloop::channel::{self, Channel};
use calloop::EventLoop;
use tracing::{debug, error, warn};

use super::{
    prepare_injection, DispatchError, DispatcherSettings, InjectionResult, InjectionWaiter,
    InputDispatcher, InputDispatcherPolicy, Injector, SyncMode,
};
use crate::input::channel::InputChannel;
use crate::input::event::{DeviceId, DisplayId, InputEvent, KeyEvent, MotionEvent, PolicyFlags};
use crate::input::window::{InputApplicationInfo, InputWindowInfo, Token};
use crate::utils::{ns_to_duration, Clock, Nsecs};

type Call = Box<dyn FnOnce(&mut InputDispatcher) + Send>;

enum Command {
    Run(Call),
    Stop,
}

struct LoopState {
    dispatcher: InputDispatcher,
    running: bool,
}

pub struct InputDispatcherThread {
    handle: InputDispatcherHandle,
    thread: Option<JoinHandle<()>>,
}

/// Cheap to clone, and usable from any thread.
#[derive(Clone)]
pub struct InputDispatcherHandle {
    sender: channel::Sender<Command>,
    policy: Arc<dyn InputDispatcherPolicy>,
}

impl InputDispatcherThread {
    pub fn start(
        settings: DispatcherSettings,
        policy: Arc<dyn InputDispatcherPolicy>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let (sender, commands) = channel::channel();
        let (started_tx, started_rx) = mpsc::channel();

        let thread_policy = policy.clone();
        let thread = thread::Builder::new()
            .name("input dispatcher".to_owned())
            .spawn(move || {
                let (mut event_loop, mut state) =
                    match setup(settings, thread_policy, clock.clone(), commands) {
                        Ok(setup) => {
                            let _ = started_tx.send(Ok(()));
                            setup
                        }
                        Err(err) => {
                            let _ = started_tx.send(Err(err));
                            return;
                        }
                    };

                if let Err(err) = run(&mut event_loop, &mut state, clock.as_ref()) {
                    error!("input dispatcher thread failed: {err:?}");
                }
                debug!("input dispatcher thread exiting");
            })
            .context("error spawning the input dispatcher thread")?;

        started_rx
            .recv()
            .context("input dispatcher thread exited during startup")??;

        Ok(Self {
            handle: InputDispatcherHandle { sender, policy },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> InputDispatcherHandle {
        self.handle.clone()
    }

    /// Stops the event loop and waits for the thread to exit. Handles fail from then on.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        let _ = self.handle.sender.send(Command::Stop);
        if thread.join().is_err() {
            warn!("input dispatcher thread panicked");
        }
    }
}

impl Drop for InputDispatcherThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn setup(
    settings: DispatcherSettings,
    policy: Arc<dyn InputDispatcherPolicy>,
    clock: Arc<dyn Clock>,
    commands: Channel<Command>,
) -> anyhow::Result<(EventLoop<'static, LoopState>, LoopState)> {
    let event_loop: EventLoop<LoopState> =
        EventLoop::try_new().context("error creating the input dispatcher event loop")?;
    let handle = event_loop.handle();

    handle
        .insert_source(commands, |event, _, state| match event {
            channel::Event::Msg(Command::Run(call)) => call(&mut state.dispatcher),
            channel::Event::Msg(Command::Stop) | channel::Event::Closed => state.running = false,
        })
        .map_err(|err| anyhow!("error inserting the command channel: {}", err.error))?;

    let (ping, ping_source) =
        calloop::ping::make_ping().context("error creating the input dispatcher waker")?;
    handle
        .insert_source(ping_source, |(), _, _| ())
        .map_err(|err| anyhow!("error inserting the waker: {}", err.error))?;

    let mut dispatcher = InputDispatcher::new(settings, policy, clock);
    dispatcher.set_waker(Arc::new(move || ping.ping()));

    let state = LoopState {
        dispatcher,
        running: true,
    };
    Ok((event_loop, state))
}

fn run(
    event_loop: &mut EventLoop<'static, LoopState>,
    state: &mut LoopState,
    clock: &dyn Clock,
) -> anyhow::Result<()> {
    while state.running {
        let next_wakeup = state.dispatcher.dispatch_once();
        let timeout = next_wakeup.map(|wakeup| ns_to_duration(wakeup - clock.now()));
        event_loop
            .dispatch(timeout, state)
            .context("error dispatching the input dispatcher event loop")?;
    }
    Ok(())
}

impl InputDispatcherHandle {
    fn send(&self, call: impl FnOnce(&mut InputDispatcher) + Send + 'static) -> bool {
        if self.sender.send(Command::Run(Box::new(call))).is_err() {
            warn!("input dispatcher thread is gone");
            return false;
        }
        true
    }

    /// Runs `call` on the dispatcher thread and waits for its result.
    fn call<T: Send + 'static>(
        &self,
        call: impl FnOnce(&mut InputDispatcher) -> T + Send + 'static,
    ) -> Option<T> {
        let (tx, rx) = mpsc::channel();
        let sent = self.send(move |dispatcher| {
            let _ = tx.send(call(dispatcher));
        });
        if !sent {
            return None;
        }
        rx.recv().ok()
    }

    pub fn notify_configuration_changed(&self, event_time: Nsecs) {
        self.send(move |d| d.notify_configuration_changed(event_time));
    }

    pub fn notify_key(&self, event: KeyEvent) {
        self.send(move |d| d.notify_key(event));
    }

    pub fn notify_motion(&self, event: MotionEvent) {
        self.send(move |d| d.notify_motion(event));
    }

    pub fn notify_switch(
        &self,
        when: Nsecs,
        switch_values: u32,
        switch_mask: u32,
        policy_flags: PolicyFlags,
    ) {
        self.send(move |d| d.notify_switch(when, switch_values, switch_mask, policy_flags));
    }

    pub fn notify_device_reset(&self, event_time: Nsecs, device_id: DeviceId) {
        self.send(move |d| d.notify_device_reset(event_time, device_id));
    }

    /// Injects an event on behalf of `pid`/`uid`.
    ///
    /// Validation and the permission check run on the calling thread. With a sync mode, this
    /// blocks for up to `timeout` waiting for the outcome.
    pub fn inject_input_event(
        &self,
        event: InputEvent,
        pid: i32,
        uid: i32,
        sync_mode: SyncMode,
        timeout: Duration,
        policy_flags: PolicyFlags,
    ) -> InjectionResult {
        let injector = Injector { pid, uid };
        let prepared = match prepare_injection(self.policy.as_ref(), event, injector, policy_flags)
        {
            Ok(prepared) => prepared,
            Err(result) => return result,
        };

        let (waiter, sender) = InjectionWaiter::new(sync_mode);
        if !self.send(move |d| d.enqueue_injection(prepared, sync_mode, sender)) {
            return InjectionResult::Failed;
        }
        waiter.wait(timeout)
    }

    pub fn set_input_windows(&self, display: DisplayId, windows: Vec<InputWindowInfo>) {
        self.send(move |d| d.set_input_windows(display, windows));
    }

    pub fn set_focused_application(
        &self,
        display: DisplayId,
        application: Option<InputApplicationInfo>,
    ) {
        self.send(move |d| d.set_focused_application(display, application));
    }

    pub fn set_focused_display(&self, display: DisplayId) {
        self.send(move |d| d.set_focused_display(display));
    }

    pub fn set_in_touch_mode(&self, in_touch_mode: bool) {
        self.send(move |d| d.set_in_touch_mode(in_touch_mode));
    }

    pub fn set_input_filter_enabled(&self, enabled: bool) {
        self.send(move |d| d.set_input_filter_enabled(enabled));
    }

    pub fn register_input_channel(&self, channel: InputChannel) -> Result<(), DispatchError> {
        let token = channel.token();
        self.call(move |d| d.register_input_channel(channel))
            .unwrap_or(Err(DispatchError::Broken(token)))
    }

    pub fn register_input_monitor(
        &self,
        channel: InputChannel,
        display: DisplayId,
        is_gesture_monitor: bool,
    ) -> Result<(), DispatchError> {
        let token = channel.token();
        self.call(move |d| d.register_input_monitor(channel, display, is_gesture_monitor))
            .unwrap_or(Err(DispatchError::Broken(token)))
    }

    pub fn unregister_input_channel(&self, token: Token) -> Result<(), DispatchError> {
        self.call(move |d| d.unregister_input_channel(token))
            .unwrap_or(Err(DispatchError::Broken(token)))
    }

    pub fn pilfer_pointers(&self, token: Token) -> Result<(), DispatchError> {
        self.call(move |d| d.pilfer_pointers(token))
            .unwrap_or(Err(DispatchError::Broken(token)))
    }

    pub fn transfer_touch_focus(&self, from: Token, to: Token) -> bool {
        self.call(move |d| d.transfer_touch_focus(from, to))
            .unwrap_or(false)
    }
}
