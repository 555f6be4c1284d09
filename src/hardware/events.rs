//! Pump and valve state-change notifications.
//!
//! Listeners are registered on a [`DeviceEvents`] set that is handed to
//! `Device` at construction. Callbacks run synchronously inside the device
//! operation that changed the state, so they must return quickly. Consumers
//! that need to do real work (dashboards, persistence) should use
//! [`ChannelListener`], which only enqueues the event.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Observer of device state transitions.
pub trait DeviceEventListener: Send + Sync {
    /// A pump started (`active == true`) or stopped dispensing.
    fn on_pump_status_change(&self, pump_id: u8, active: bool);

    /// A vial valve opened (`open == true`) or closed.
    fn on_valve_status_change(&self, valve_id: u8, open: bool);
}

/// A device state transition as a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    /// Pump activity changed.
    Pump {
        /// Pump id (media = 1, drug = 2, waste = 4).
        pump_id: u8,
        /// Whether the pump is now dispensing.
        active: bool,
    },
    /// Valve position changed.
    Valve {
        /// Valve id, equal to the vial id.
        valve_id: u8,
        /// Whether the valve is now open.
        open: bool,
    },
}

/// Fan-out set of listeners owned by a `Device`.
#[derive(Clone, Default)]
pub struct DeviceEvents {
    listeners: Vec<Arc<dyn DeviceEventListener>>,
}

impl DeviceEvents {
    /// Empty listener set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn with_listener(mut self, listener: Arc<dyn DeviceEventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub(crate) fn pump_changed(&self, pump_id: u8, active: bool) {
        tracing::trace!(pump_id, active, "pump status change");
        for listener in &self.listeners {
            listener.on_pump_status_change(pump_id, active);
        }
    }

    pub(crate) fn valve_changed(&self, valve_id: u8, open: bool) {
        tracing::trace!(valve_id, open, "valve status change");
        for listener in &self.listeners {
            listener.on_valve_status_change(valve_id, open);
        }
    }
}

impl std::fmt::Debug for DeviceEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceEvents")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Listener that forwards events into an unbounded channel.
///
/// Sending never blocks; events are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<DeviceEvent>,
}

impl ChannelListener {
    /// Create a listener and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl DeviceEventListener for ChannelListener {
    fn on_pump_status_change(&self, pump_id: u8, active: bool) {
        let _ = self.sender.send(DeviceEvent::Pump { pump_id, active });
    }

    fn on_valve_status_change(&self, valve_id: u8, open: bool) {
        let _ = self.sender.send(DeviceEvent::Valve { valve_id, open });
    }
}
