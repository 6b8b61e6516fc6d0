//! Per-channel delivery state.

use std::collections::VecDeque;

use tracing::{debug, trace};

use super::entry::{DispatchEntry, DispatchEvent, InputTarget};
use super::injection::SharedInjectionState;
use super::input_state::InputState;
use crate::input::channel::{InputChannel, PublishError};
use crate::input::window::Token;
use crate::stats::TimeStats;
use crate::utils::Nsecs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionStatus {
    Normal,
    /// The other end went away.
    Broken,
}

pub(crate) struct Connection {
    pub channel: InputChannel,
    pub is_monitor: bool,
    pub status: ConnectionStatus,
    /// Cleared when the policy gave up on the connection after it stopped responding, until
    /// it acknowledges something again.
    pub responsive: bool,
    /// Waiting to be published.
    pub outbound_queue: VecDeque<DispatchEntry>,
    /// Published, waiting to be finished.
    pub wait_queue: VecDeque<DispatchEntry>,
    pub input_state: InputState,
}

impl Connection {
    pub fn new(channel: InputChannel, is_monitor: bool) -> Self {
        Self {
            channel,
            is_monitor,
            status: ConnectionStatus::Normal,
            responsive: true,
            outbound_queue: VecDeque::new(),
            wait_queue: VecDeque::new(),
            input_state: InputState::default(),
        }
    }

    pub fn token(&self) -> Token {
        self.channel.token()
    }

    pub fn name(&self) -> &str {
        self.channel.name()
    }

    pub fn is_normal(&self) -> bool {
        self.status == ConnectionStatus::Normal
    }

    /// Queues `event` for publishing. Events that would leave the connection with an
    /// inconsistent view of what is down are dropped.
    pub fn enqueue(
        &mut self,
        event: DispatchEvent,
        target: &InputTarget,
        injection: Option<SharedInjectionState>,
    ) -> bool {
        let consistent = match &event {
            DispatchEvent::Key(key) => self.input_state.track_key(key),
            DispatchEvent::Motion(motion) => self.input_state.track_motion(motion),
            DispatchEvent::Focus(_) => true,
        };
        if !consistent {
            debug!("{}: dropping inconsistent event {event:?}", self.name());
            return false;
        }

        self.outbound_queue
            .push_back(DispatchEntry::new(event, target, injection));
        true
    }

    /// Publishes everything in the outbound queue, moving it to the wait queue.
    pub fn publish_outbound(
        &mut self,
        now: Nsecs,
        timeout: Nsecs,
        stats: &dyn TimeStats,
    ) -> Result<(), PublishError> {
        while let Some(mut entry) = self.outbound_queue.pop_front() {
            let seq = match self.channel.publish(entry.to_message()) {
                Ok(seq) => seq,
                Err(err) => {
                    self.outbound_queue.push_front(entry);
                    return Err(err);
                }
            };
            trace!("{}: published {:?} as seq {seq}", self.name(), entry.event);

            if let Some(event_time) = entry.event_time() {
                stats.record_dispatch_latency(now.saturating_sub(event_time));
            }
            entry.seq = seq;
            entry.delivery_time = now;
            entry.timeout_time = now.saturating_add(timeout);
            self.wait_queue.push_back(entry);
        }
        Ok(())
    }

    /// Handles a finished signal. Returns the acknowledged entry.
    pub fn finish(&mut self, seq: u32) -> Option<DispatchEntry> {
        self.responsive = true;
        let index = self.wait_queue.iter().position(|entry| entry.seq == seq)?;
        self.wait_queue.remove(index)
    }

    pub fn drain_queues(&mut self) {
        self.outbound_queue.clear();
        self.wait_queue.clear();
    }

    /// When the oldest unacknowledged event times out.
    pub fn next_timeout(&self) -> Option<Nsecs> {
        if !self.responsive || !self.is_normal() {
            return None;
        }
        self.wait_queue.front().map(|entry| entry.timeout_time)
    }
}
