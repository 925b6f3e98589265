//! Snapshot types shared between the session manager and its backends.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::compat::{CompatValue, ServiceDataEntry, merge_service_data, service_data_to_map};
use crate::uuid::CanonicalUuid;

/// Advertisement payload as last reported for a peripheral.
///
/// Every field is optional: BLE advertisements are fragmented across packet
/// types, so a single sighting rarely carries everything. Successive
/// sightings are reconciled with [`Advertisement::merge_from`].
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Advertisement {
    /// Local name carried in the advertisement payload.
    pub local_name: Option<String>,
    /// Signal strength of the sighting, in dBm.
    pub rssi: Option<i16>,
    /// Advertised transmit power, in dBm.
    pub tx_power: Option<i16>,
    /// Raw manufacturer-specific payload.
    pub manufacturer_data: Option<Vec<u8>>,
    /// Advertised service-data payloads, keyed by service UUID.
    pub service_data: Option<Vec<ServiceDataEntry>>,
    /// Advertised service UUIDs.
    pub service_uuids: Option<Vec<CanonicalUuid>>,
    /// Solicited service UUIDs.
    pub solicited_service_uuids: Option<Vec<CanonicalUuid>>,
    /// Service UUIDs that overflowed the main advertisement packet.
    pub overflow_service_uuids: Option<Vec<CanonicalUuid>>,
    /// Whether the peripheral accepts connections.
    pub is_connectable: Option<bool>,
}

impl Advertisement {
    /// Fold a newer sighting into this snapshot.
    ///
    /// Fields present in `newer` win; absent fields keep the previous value.
    /// Service data is merged key-wise, newer payloads winning on collision.
    pub fn merge_from(&mut self, newer: &Advertisement) {
        if newer.local_name.is_some() {
            self.local_name = newer.local_name.clone();
        }
        if newer.rssi.is_some() {
            self.rssi = newer.rssi;
        }
        if newer.tx_power.is_some() {
            self.tx_power = newer.tx_power;
        }
        if newer.manufacturer_data.is_some() {
            self.manufacturer_data = newer.manufacturer_data.clone();
        }
        if newer.service_uuids.is_some() {
            self.service_uuids = newer.service_uuids.clone();
        }
        if newer.solicited_service_uuids.is_some() {
            self.solicited_service_uuids = newer.solicited_service_uuids.clone();
        }
        if newer.overflow_service_uuids.is_some() {
            self.overflow_service_uuids = newer.overflow_service_uuids.clone();
        }
        if newer.is_connectable.is_some() {
            self.is_connectable = newer.is_connectable;
        }

        let base = self.service_data.as_deref().and_then(service_data_to_map);
        let overlay = newer.service_data.as_deref().and_then(service_data_to_map);
        self.service_data = merge_service_data(base.as_ref(), overlay.as_ref())
            .map(|merged| {
                merged
                    .into_iter()
                    .map(|(uuid, data)| ServiceDataEntry::new(uuid, data))
                    .collect()
            });
    }

    /// Whether the advertisement names the given service, either in the
    /// service UUID list or as a service-data key.
    pub fn advertises_service(&self, uuid: &CanonicalUuid) -> bool {
        if let Some(services) = &self.service_uuids
            && services.contains(uuid)
        {
            return true;
        }
        if let Some(entries) = &self.service_data
            && entries.iter().any(|entry| entry.uuid == *uuid)
        {
            return true;
        }
        false
    }
}

/// One scan sighting as reported by the native collaborator.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sighting {
    /// Platform-assigned opaque device identifier.
    pub device_id: String,
    /// Platform-reported device name (GAP name, not the advertised one).
    pub name: Option<String>,
    /// The advertisement payload of this sighting.
    pub advertisement: Advertisement,
}

impl Sighting {
    /// Create a sighting with only an identifier.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            name: None,
            advertisement: Advertisement::default(),
        }
    }
}

/// A discovered GATT service.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ServiceSnapshot {
    /// The service UUID.
    pub uuid: CanonicalUuid,
    /// Whether this is a primary service.
    pub is_primary: bool,
}

/// Capability flags of a characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CharacteristicProperties {
    /// Supports reads.
    pub read: bool,
    /// Supports acknowledged writes.
    pub write: bool,
    /// Supports unacknowledged writes.
    pub write_without_response: bool,
    /// Supports notifications.
    pub notify: bool,
    /// Supports indications.
    pub indicate: bool,
}

/// A discovered GATT characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CharacteristicSnapshot {
    /// The characteristic UUID.
    pub uuid: CanonicalUuid,
    /// The owning service UUID.
    pub service_uuid: CanonicalUuid,
    /// Capability flags.
    pub properties: CharacteristicProperties,
    /// Last value reported for this characteristic, if any.
    pub value: Option<Vec<u8>>,
}

/// A discovered GATT descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DescriptorSnapshot {
    /// The descriptor UUID.
    pub uuid: CanonicalUuid,
    /// The owning characteristic UUID.
    pub characteristic_uuid: CanonicalUuid,
    /// The owning service UUID.
    pub service_uuid: CanonicalUuid,
    /// Last value reported for this descriptor, if any.
    pub value: Option<Vec<u8>>,
}

/// A peripheral reported by the session-restoration callback.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RestoredPeripheral {
    /// Platform-assigned opaque device identifier.
    pub device_id: String,
    /// Device name, if known.
    pub name: Option<String>,
    /// Whether the platform still holds a connection to the device.
    pub connected: bool,
}

/// State of a firmware-update transfer for one device.
///
/// `Starting` through `Disconnecting` are the in-progress states; exactly one
/// transfer per device may be in one of them at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(i32)]
pub enum DfuState {
    /// No transfer for this device.
    #[default]
    Idle = 0,
    /// Transfer accepted, not yet connected.
    Starting = 1,
    /// Connecting to the target.
    Connecting = 2,
    /// Switching the target into update mode.
    EnablingMode = 3,
    /// Firmware bytes are being transferred.
    Uploading = 4,
    /// Target is validating the image.
    Validating = 5,
    /// Disconnecting after transfer.
    Disconnecting = 6,
    /// Transfer finished successfully.
    Completed = 7,
    /// Transfer was aborted by request.
    Aborted = 8,
    /// Transfer failed.
    Error = 9,
}

impl DfuState {
    /// Every member, in code order.
    pub const ALL: [DfuState; 10] = [
        DfuState::Idle,
        DfuState::Starting,
        DfuState::Connecting,
        DfuState::EnablingMode,
        DfuState::Uploading,
        DfuState::Validating,
        DfuState::Disconnecting,
        DfuState::Completed,
        DfuState::Aborted,
        DfuState::Error,
    ];

    /// Convert a native numeric code; unrecognized codes map to `Idle`.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => DfuState::Starting,
            2 => DfuState::Connecting,
            3 => DfuState::EnablingMode,
            4 => DfuState::Uploading,
            5 => DfuState::Validating,
            6 => DfuState::Disconnecting,
            7 => DfuState::Completed,
            8 => DfuState::Aborted,
            9 => DfuState::Error,
            _ => DfuState::Idle,
        }
    }

    /// The native numeric code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// The compat-surface string name.
    pub fn compat_name(self) -> &'static str {
        match self {
            DfuState::Idle => "idle",
            DfuState::Starting => "starting",
            DfuState::Connecting => "connecting",
            DfuState::EnablingMode => "enablingDfuMode",
            DfuState::Uploading => "uploading",
            DfuState::Validating => "validating",
            DfuState::Disconnecting => "disconnecting",
            DfuState::Completed => "completed",
            DfuState::Aborted => "aborted",
            DfuState::Error => "error",
        }
    }

    /// Convert a compat string name; unrecognized names map to `Idle`.
    pub fn from_compat_name(name: &str) -> Self {
        match name {
            "starting" => DfuState::Starting,
            "connecting" => DfuState::Connecting,
            "enablingDfuMode" => DfuState::EnablingMode,
            "uploading" => DfuState::Uploading,
            "validating" => DfuState::Validating,
            "disconnecting" => DfuState::Disconnecting,
            "completed" => DfuState::Completed,
            "aborted" => DfuState::Aborted,
            "error" => DfuState::Error,
            _ => DfuState::Idle,
        }
    }

    /// Accept either encoding and return the native member.
    pub fn normalize(value: &CompatValue) -> Self {
        match value {
            CompatValue::Code(code) => Self::from_code(*code as i32),
            CompatValue::Name(name) => Self::from_compat_name(name),
        }
    }

    /// Whether the transfer has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, DfuState::Completed | DfuState::Aborted | DfuState::Error)
    }

    /// Whether a transfer is currently in flight.
    pub fn is_active(self) -> bool {
        !matches!(self, DfuState::Idle) && !self.is_terminal()
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.compat_name())
    }
}

/// Progress report for a firmware-update transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DfuProgress {
    /// Percentage of the current part, 0-100.
    pub percent: u8,
    /// One-based index of the part being transferred.
    pub current_part: u32,
    /// Total number of parts in the firmware image.
    pub total_parts: u32,
    /// Instantaneous transfer speed, in bytes per second.
    pub speed: f32,
    /// Average transfer speed, in bytes per second.
    pub avg_speed: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid::canonicalize;

    fn entry(uuid: &str, data: &[u8]) -> ServiceDataEntry {
        ServiceDataEntry::new(canonicalize(uuid).unwrap(), data.to_vec())
    }

    #[test]
    fn test_merge_newer_fields_win() {
        let mut base = Advertisement {
            local_name: Some("Old".to_string()),
            rssi: Some(-80),
            ..Default::default()
        };
        let newer = Advertisement {
            rssi: Some(-60),
            tx_power: Some(4),
            ..Default::default()
        };

        base.merge_from(&newer);

        assert_eq!(base.local_name.as_deref(), Some("Old"));
        assert_eq!(base.rssi, Some(-60));
        assert_eq!(base.tx_power, Some(4));
    }

    #[test]
    fn test_merge_service_data_key_wise() {
        let mut base = Advertisement {
            service_data: Some(vec![entry("180d", &[1]), entry("180f", &[2])]),
            ..Default::default()
        };
        let newer = Advertisement {
            service_data: Some(vec![entry("180d", &[9])]),
            ..Default::default()
        };

        base.merge_from(&newer);

        let merged = base.service_data.unwrap();
        assert_eq!(merged.len(), 2);
        let heart_rate = canonicalize("180d").unwrap();
        let payload = merged.iter().find(|e| e.uuid == heart_rate).unwrap();
        assert_eq!(payload.data, vec![9]);
    }

    #[test]
    fn test_advertises_service() {
        let heart_rate = canonicalize("180d").unwrap();
        let battery = canonicalize("180f").unwrap();
        let adv = Advertisement {
            service_uuids: Some(vec![heart_rate]),
            service_data: Some(vec![entry("fce0", &[0])]),
            ..Default::default()
        };

        assert!(adv.advertises_service(&heart_rate));
        assert!(adv.advertises_service(&canonicalize("fce0").unwrap()));
        assert!(!adv.advertises_service(&battery));
    }

    #[test]
    fn test_dfu_state_round_trip() {
        for state in DfuState::ALL {
            assert_eq!(DfuState::from_compat_name(state.compat_name()), state);
            assert_eq!(DfuState::from_code(state.code()), state);
        }
    }

    #[test]
    fn test_dfu_state_classification() {
        assert!(!DfuState::Idle.is_active());
        assert!(!DfuState::Idle.is_terminal());
        assert!(DfuState::Uploading.is_active());
        assert!(DfuState::Completed.is_terminal());
        assert!(DfuState::Aborted.is_terminal());
        assert!(DfuState::Error.is_terminal());
        assert!(!DfuState::Completed.is_active());
    }

    #[test]
    fn test_dfu_state_unknown_code_is_idle() {
        assert_eq!(DfuState::from_code(77), DfuState::Idle);
        assert_eq!(DfuState::from_compat_name("rebooting"), DfuState::Idle);
    }
}
