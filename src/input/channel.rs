//! Transport between the dispatcher and one window.
//!
//! A channel is a pair of ordered queues: messages go from the dispatcher to the window, and
//! finished signals come back. Each published message gets a sequence number, starting at 1,
//! that the window echoes back when it is done with the message. Dropping either end breaks the
//! pair.

use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::trace;

use super::event::{KeyEvent, MotionEvent};
use super::window::Token;

pub const DEAD_OBJECT: i32 = -32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FocusEvent {
    pub id: i32,
    pub has_focus: bool,
    pub in_touch_mode: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputMessageBody {
    Key(KeyEvent),
    Motion(MotionEvent),
    Focus(FocusEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputMessage {
    pub seq: u32,
    pub body: InputMessageBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finished {
    pub seq: u32,
    pub handled: bool,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
    #[error("input channel is broken")]
    Broken,
}

impl PublishError {
    pub fn code(self) -> i32 {
        match self {
            PublishError::Broken => DEAD_OBJECT,
        }
    }
}

/// Called whenever the window side has something for the dispatcher to look at.
pub type Waker = Arc<dyn Fn() + Send + Sync>;

type SharedWaker = Arc<Mutex<Option<Waker>>>;

fn wake(waker: &SharedWaker) {
    let waker = waker.lock().unwrap().clone();
    if let Some(waker) = waker {
        waker();
    }
}

/// Dispatcher end of the pair.
pub struct InputChannel {
    name: String,
    token: Token,
    to_client: mpsc::Sender<InputMessage>,
    from_client: mpsc::Receiver<Finished>,
    next_seq: u32,
    waker: SharedWaker,
}

/// Window end of the pair.
pub struct InputConsumer {
    name: String,
    token: Token,
    from_server: mpsc::Receiver<InputMessage>,
    to_server: Option<mpsc::Sender<Finished>>,
    waker: SharedWaker,
}

impl InputChannel {
    pub fn open_pair(name: &str) -> (InputChannel, InputConsumer) {
        let token = Token::new();
        let (to_client, from_server) = mpsc::channel();
        let (to_server, from_client) = mpsc::channel();
        let waker = SharedWaker::default();

        let channel = InputChannel {
            name: name.to_owned(),
            token,
            to_client,
            from_client,
            next_seq: 1,
            waker: waker.clone(),
        };
        let consumer = InputConsumer {
            name: name.to_owned(),
            token,
            from_server,
            to_server: Some(to_server),
            waker,
        };
        (channel, consumer)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn set_waker(&self, waker: Waker) {
        *self.waker.lock().unwrap() = Some(waker);
    }

    /// Sends a message and returns the sequence number it was given.
    pub fn publish(&mut self, body: InputMessageBody) -> Result<u32, PublishError> {
        let seq = self.next_seq;
        trace!("{}: publishing seq {seq}", self.name);
        self.to_client
            .send(InputMessage { seq, body })
            .map_err(|_| PublishError::Broken)?;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        Ok(seq)
    }

    /// Returns the next finished signal, if the window has sent one.
    pub fn receive_finished(&self) -> Result<Option<Finished>, PublishError> {
        match self.from_client.try_recv() {
            Ok(finished) => Ok(Some(finished)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(PublishError::Broken),
        }
    }
}

impl InputConsumer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn receive(&self) -> Result<Option<InputMessage>, PublishError> {
        match self.from_server.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(PublishError::Broken),
        }
    }

    /// Waits up to `timeout` for the next message.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<InputMessage>, PublishError> {
        match self.from_server.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(PublishError::Broken),
        }
    }

    pub fn send_finished(&self, seq: u32, handled: bool) -> Result<(), PublishError> {
        let Some(to_server) = &self.to_server else {
            return Err(PublishError::Broken);
        };
        to_server
            .send(Finished { seq, handled })
            .map_err(|_| PublishError::Broken)?;
        wake(&self.waker);
        Ok(())
    }
}

impl Drop for InputConsumer {
    fn drop(&mut self) {
        // Disconnect before waking so the dispatcher sees the pair as broken.
        self.to_server = None;
        wake(&self.waker);
    }
}
