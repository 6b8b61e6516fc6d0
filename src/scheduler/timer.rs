//! One-shot timers for idle, touch and display power tracking.
//!
//! Each timer runs its callbacks on a dedicated thread. A timer counts down from the last
//! [`OneShotTimer::reset`]; when the interval passes without a reset it fires `on_timeout` and
//! goes idle. The next reset fires `on_reset` and starts counting again.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{trace, warn};

pub type TimerCallback = Box<dyn Fn() + Send + 'static>;

enum Message {
    Reset,
    Stop,
}

pub struct OneShotTimer {
    name: String,
    interval: Duration,
    sender: mpsc::Sender<Message>,
    thread: Option<JoinHandle<()>>,
}

impl OneShotTimer {
    /// Starts the timer. `on_reset` runs right away since a fresh timer counts as reset.
    pub fn start(
        name: &str,
        interval: Duration,
        on_reset: TimerCallback,
        on_timeout: TimerCallback,
    ) -> anyhow::Result<Self> {
        let (sender, receiver) = mpsc::channel();

        let thread = thread::Builder::new()
            .name(format!("{name} timer"))
            .spawn(move || run(interval, &receiver, &on_reset, &on_timeout))
            .with_context(|| format!("error spawning the {name} timer thread"))?;

        Ok(Self {
            name: name.to_owned(),
            interval,
            sender,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Restarts the countdown.
    pub fn reset(&self) {
        if self.sender.send(Message::Reset).is_err() {
            warn!("{} timer thread is gone", self.name);
        }
    }

    /// Stops the timer and waits for its thread to exit.
    pub fn stop(&mut self) {
        let _ = self.sender.send(Message::Stop);

        let Some(thread) = self.thread.take() else {
            return;
        };

        // The last reference to the owner can be dropped from inside a callback.
        if thread.thread().id() == thread::current().id() {
            return;
        }

        if thread.join().is_err() {
            warn!("{} timer thread panicked", self.name);
        }
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    interval: Duration,
    receiver: &mpsc::Receiver<Message>,
    on_reset: &TimerCallback,
    on_timeout: &TimerCallback,
) {
    loop {
        on_reset();

        // Counting down.
        let mut deadline = Instant::now() + interval;
        loop {
            let timeout = deadline.saturating_duration_since(Instant::now());
            match receiver.recv_timeout(timeout) {
                Ok(Message::Reset) => deadline = Instant::now() + interval,
                Ok(Message::Stop) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => break,
            }
        }

        trace!("timer expired");
        on_timeout();

        // Idle until the next reset.
        match receiver.recv() {
            Ok(Message::Reset) => (),
            Ok(Message::Stop) | Err(_) => return,
        }
    }
}
