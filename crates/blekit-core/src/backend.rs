//! Contract between the session manager and the native BLE/DFU collaborator.
//!
//! The collaborator owns the radio: it performs scanning, connections, and
//! attribute I/O, and reports unsolicited results back on a broadcast stream
//! of [`BackendEvent`]. Request/response operations are async methods on
//! [`NativeBackend`]. The session never talks to a platform stack directly;
//! everything goes through this trait, which is also what makes the session
//! testable against [`crate::mock::MockBackend`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use blekit_types::{
    AdapterState, CanonicalUuid, CharacteristicSnapshot, ConnectionPriority, DescriptorSnapshot,
    DfuState, RestoredPeripheral, ServiceSnapshot, Sighting, SubscriptionType,
};

use crate::dfu::{DfuEvent, DfuOptions, FirmwareSource};
use crate::error::{BleError, Result};
use crate::scan::ScanFilter;

/// Unsolicited results reported by the native collaborator.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum BackendEvent {
    /// A peripheral was sighted during scanning.
    Sighting(Sighting),
    /// Scanning terminated with a native failure.
    ScanFailed(BleError),
    /// The adapter state changed.
    AdapterStateChanged(AdapterState),
    /// A device disconnected without a local request.
    DeviceDisconnected {
        /// The disconnected device.
        device_id: String,
        /// The native failure, if the link was interrupted.
        error: Option<BleError>,
    },
    /// A subscribed characteristic changed value.
    Notification {
        /// The device the value came from.
        device_id: String,
        /// The characteristic that changed.
        characteristic: CanonicalUuid,
        /// The new value.
        value: Vec<u8>,
    },
    /// The platform restored a backgrounded session.
    ///
    /// Reported at most once per process lifetime.
    SessionRestored(Vec<RestoredPeripheral>),
    /// Progress or state change of a firmware-update transfer.
    Dfu {
        /// The device being updated.
        device_id: String,
        /// The transfer event.
        event: DfuEvent,
    },
}

/// Capability contract of the native BLE/DFU collaborator.
///
/// Implementations must be cheap to share behind an `Arc` and deliver
/// unsolicited events through the stream returned by [`events`].
///
/// [`events`]: NativeBackend::events
#[async_trait]
pub trait NativeBackend: Send + Sync {
    /// Subscribe to the collaborator's unsolicited event stream.
    fn events(&self) -> broadcast::Receiver<BackendEvent>;

    // --- Scanning ---

    /// Start radio scanning with the given filter.
    async fn start_scan(&self, filter: &ScanFilter) -> Result<()>;

    /// Stop radio scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Whether the radio is currently scanning.
    async fn is_scanning(&self) -> bool;

    // --- Adapter ---

    /// Current adapter state.
    async fn adapter_state(&self) -> AdapterState;

    /// Ask the platform to enable the radio.
    async fn request_enable(&self) -> Result<()>;

    /// Open the platform Bluetooth settings.
    async fn open_settings(&self) -> Result<()>;

    // --- Connections ---

    /// Connect to a device.
    async fn connect(&self, device_id: &str, auto_connect: bool) -> Result<()>;

    /// Disconnect from a device.
    async fn disconnect(&self, device_id: &str) -> Result<()>;

    /// Whether the native stack holds a connection to the device.
    async fn is_connected(&self, device_id: &str) -> bool;

    /// Negotiate the connection MTU; returns the negotiated value.
    async fn request_mtu(&self, device_id: &str, mtu: u16) -> Result<u16>;

    /// Read the connection RSSI, in dBm.
    async fn read_rssi(&self, device_id: &str) -> Result<i16>;

    /// Hint the platform about the desired connection priority.
    async fn request_connection_priority(
        &self,
        device_id: &str,
        priority: ConnectionPriority,
    ) -> Result<()>;

    // --- GATT discovery and I/O ---

    /// Run service discovery on a connected device. Idempotent.
    async fn discover_services(&self, device_id: &str) -> Result<()>;

    /// Discovered services of a device.
    async fn services(&self, device_id: &str) -> Result<Vec<ServiceSnapshot>>;

    /// Discovered characteristics of one service.
    async fn characteristics(
        &self,
        device_id: &str,
        service: &CanonicalUuid,
    ) -> Result<Vec<CharacteristicSnapshot>>;

    /// Discovered descriptors of one characteristic.
    async fn descriptors(
        &self,
        device_id: &str,
        service: &CanonicalUuid,
        characteristic: &CanonicalUuid,
    ) -> Result<Vec<DescriptorSnapshot>>;

    /// Read a characteristic value.
    async fn read_characteristic(
        &self,
        device_id: &str,
        service: &CanonicalUuid,
        characteristic: &CanonicalUuid,
    ) -> Result<Vec<u8>>;

    /// Write a characteristic value, with or without response.
    async fn write_characteristic(
        &self,
        device_id: &str,
        service: &CanonicalUuid,
        characteristic: &CanonicalUuid,
        value: &[u8],
        with_response: bool,
    ) -> Result<()>;

    /// Read a descriptor value.
    async fn read_descriptor(
        &self,
        device_id: &str,
        service: &CanonicalUuid,
        characteristic: &CanonicalUuid,
        descriptor: &CanonicalUuid,
    ) -> Result<Vec<u8>>;

    /// Write a descriptor value.
    async fn write_descriptor(
        &self,
        device_id: &str,
        service: &CanonicalUuid,
        characteristic: &CanonicalUuid,
        descriptor: &CanonicalUuid,
        value: &[u8],
    ) -> Result<()>;

    /// Enable value-change delivery for a characteristic.
    async fn subscribe(
        &self,
        device_id: &str,
        service: &CanonicalUuid,
        characteristic: &CanonicalUuid,
        kind: SubscriptionType,
    ) -> Result<()>;

    /// Disable value-change delivery for a characteristic.
    async fn unsubscribe(
        &self,
        device_id: &str,
        service: &CanonicalUuid,
        characteristic: &CanonicalUuid,
    ) -> Result<()>;

    // --- DFU ---

    /// Begin a firmware-update transfer.
    async fn start_dfu(
        &self,
        device_id: &str,
        firmware: &FirmwareSource,
        options: &DfuOptions,
    ) -> Result<()>;

    /// Pause a running transfer. Returns whether a transfer was paused.
    async fn pause_dfu(&self, device_id: &str) -> bool;

    /// Resume a paused transfer. Returns whether a transfer was resumed.
    async fn resume_dfu(&self, device_id: &str) -> bool;

    /// Abort a transfer. Returns whether a transfer was aborted.
    async fn abort_dfu(&self, device_id: &str) -> bool;

    /// The collaborator's view of the transfer state for a device.
    async fn dfu_state(&self, device_id: &str) -> DfuState;
}
