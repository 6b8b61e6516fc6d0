//! Display registry.
//!
//! Holds the per-display context (connection state, orientation) that composition consumers
//! need. Consumers get a [`DisplayContext`] handed to them rather than reading process-wide
//! state.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalDisplayId(pub u64);

impl fmt::Display for PhysicalDisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    #[default]
    Rotation0,
    Rotation90,
    Rotation180,
    Rotation270,
}

impl Orientation {
    /// Whether width and height are swapped relative to the panel.
    pub fn is_transposed(self) -> bool {
        matches!(self, Self::Rotation90 | Self::Rotation270)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayContext {
    pub id: PhysicalDisplayId,
    pub orientation: Orientation,
    pub connected: bool,
}

#[derive(Debug, Default)]
pub struct DisplayRegistry {
    displays: BTreeMap<PhysicalDisplayId, DisplayContext>,
}

impl DisplayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the connection state. Returns `true` if it changed.
    pub fn set_connected(&mut self, id: PhysicalDisplayId, connected: bool) -> bool {
        match self.displays.get_mut(&id) {
            Some(ctx) if ctx.connected == connected => false,
            Some(ctx) => {
                ctx.connected = connected;
                true
            }
            None if !connected => false,
            None => {
                self.displays.insert(
                    id,
                    DisplayContext {
                        id,
                        orientation: Orientation::default(),
                        connected,
                    },
                );
                true
            }
        }
    }

    /// Updates the orientation of a known display. Returns `true` if it changed.
    pub fn set_orientation(&mut self, id: PhysicalDisplayId, orientation: Orientation) -> bool {
        let Some(ctx) = self.displays.get_mut(&id) else {
            return false;
        };
        let changed = ctx.orientation != orientation;
        ctx.orientation = orientation;
        changed
    }

    pub fn get(&self, id: PhysicalDisplayId) -> Option<DisplayContext> {
        self.displays.get(&id).copied()
    }

    /// The connected display with the lowest id.
    pub fn primary(&self) -> Option<DisplayContext> {
        self.displays.values().find(|ctx| ctx.connected).copied()
    }

    pub fn connected(&self) -> impl Iterator<Item = &DisplayContext> + '_ {
        self.displays.values().filter(|ctx| ctx.connected)
    }
}
