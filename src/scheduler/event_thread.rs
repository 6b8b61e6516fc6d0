//! Connections from the scheduler to vsync event consumers.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, error};

use super::refresh_rate::ConfigId;
use crate::display::PhysicalDisplayId;
use crate::utils::Nsecs;

/// Distributes vsync and display events to one group of clients, such as apps or the
/// compositor itself.
pub trait EventThread: Send {
    fn on_screen_acquired(&mut self);
    fn on_screen_released(&mut self);
    fn on_hotplug_received(&mut self, display: PhysicalDisplayId, connected: bool);
    fn on_config_changed(&mut self, display: PhysicalDisplayId, config: ConfigId);
    fn set_phase_offset(&mut self, offset: Nsecs);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionHandle(u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection {}", self.0)
    }
}

pub(super) struct Connection {
    name: String,
    thread: Box<dyn EventThread>,
}

#[derive(Default)]
pub(super) struct Connections {
    next_id: u64,
    connections: BTreeMap<ConnectionHandle, Connection>,
}

impl Connections {
    pub fn insert(&mut self, name: &str, thread: Box<dyn EventThread>) -> ConnectionHandle {
        let handle = ConnectionHandle(self.next_id);
        self.next_id += 1;

        debug!("creating {handle} ({name})");
        self.connections.insert(
            handle,
            Connection {
                name: name.to_owned(),
                thread,
            },
        );
        handle
    }

    /// Runs `f` on the event thread behind `handle`. Unknown handles are logged and ignored.
    pub fn with(&mut self, handle: ConnectionHandle, f: impl FnOnce(&mut dyn EventThread)) {
        let Some(connection) = self.connections.get_mut(&handle) else {
            error!("invalid {handle}");
            return;
        };
        f(connection.thread.as_mut());
    }

    pub fn name(&self, handle: ConnectionHandle) -> Option<&str> {
        self.connections.get(&handle).map(|c| c.name.as_str())
    }

    pub fn handles(&self) -> impl Iterator<Item = ConnectionHandle> + '_ {
        self.connections.keys().copied()
    }
}
