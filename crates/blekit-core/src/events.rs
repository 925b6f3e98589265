//! Session event stream.
//!
//! The session republishes its lifecycle as a broadcast stream so that any
//! number of observers (UIs, loggers, tests) can follow connections,
//! disconnections, sightings, and adapter changes without registering
//! per-device listeners.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use blekit_types::{AdapterState, CanonicalUuid};

use crate::error::BleError;

/// Events emitted by a [`crate::session::BleSession`].
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SessionEvent {
    /// A peripheral was sighted and folded into the device table.
    DeviceDiscovered {
        /// The sighted device.
        device_id: String,
        /// Signal strength of the sighting.
        rssi: Option<i16>,
    },
    /// A connection was established.
    Connected {
        /// The connected device.
        device_id: String,
    },
    /// A connection ended, locally requested or not.
    Disconnected {
        /// The disconnected device.
        device_id: String,
        /// The native failure, for interrupted links.
        error: Option<BleError>,
    },
    /// The adapter state changed.
    AdapterStateChanged {
        /// The new state.
        state: AdapterState,
    },
    /// A subscribed characteristic changed value.
    CharacteristicValueChanged {
        /// The device the value came from.
        device_id: String,
        /// The characteristic that changed.
        characteristic: CanonicalUuid,
        /// The new value.
        value: Vec<u8>,
    },
    /// The scan session ended.
    ScanStopped {
        /// The native failure that terminated the scan, if any.
        error: Option<BleError>,
    },
}

/// Sender for session events.
pub type EventSender = broadcast::Sender<SessionEvent>;

/// Receiver for session events.
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

/// Event dispatcher fanning session events out to any number of receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: SessionEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}
