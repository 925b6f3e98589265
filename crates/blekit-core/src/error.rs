//! Error types for blekit-core.
//!
//! Two layers live here. [`BleError`] is the projection of a native failure
//! payload: a platform-independent code with a stable message table, at most
//! one platform-specific sub-code, a free-text reason, and optional attribute
//! attribution. [`Error`] is the crate-level taxonomy the session surfaces to
//! callers: caller misuse is reported immediately, native failures arrive
//! wrapped as [`Error::Ble`], and timeouts carry their own variants so callers
//! can tell "never found" from "found but failed".

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use blekit_types::{CanonicalUuid, IdentifierError};

/// Errors that can occur when driving a BLE session.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth stack error from the btleplug backend.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// No Bluetooth adapter is available.
    #[error("no Bluetooth adapter available")]
    NoAdapter,

    /// Operation attempted on a device with no active connection.
    #[error("device {device_id} is not connected")]
    NotConnected {
        /// The device the operation targeted.
        device_id: String,
    },

    /// GATT operation attempted before service discovery ran.
    #[error("services of device {device_id} have not been discovered")]
    ServicesNotDiscovered {
        /// The device the operation targeted.
        device_id: String,
    },

    /// A scan-for-connect deadline elapsed without sighting the target.
    #[error("device {identifier} not seen within {duration:?}")]
    ScanTimeout {
        /// The identifier that was being searched for.
        identifier: String,
        /// The deadline that elapsed.
        duration: Duration,
    },

    /// A malformed GATT identifier was passed in.
    #[error(transparent)]
    InvalidIdentifier(#[from] IdentifierError),

    /// A firmware update is already in flight for this device.
    #[error("firmware update already in progress for device {device_id}")]
    DfuInProgress {
        /// The device the transfer targeted.
        device_id: String,
    },

    /// Operation timed out.
    #[error("operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The backend does not implement this operation.
    #[error("operation '{operation}' is not supported by this backend")]
    Unsupported {
        /// The unsupported operation.
        operation: &'static str,
    },

    /// Structured native failure.
    #[error(transparent)]
    Ble(#[from] BleError),
}

impl Error {
    /// Create a not-connected error for a device.
    pub fn not_connected(device_id: impl Into<String>) -> Self {
        Self::NotConnected {
            device_id: device_id.into(),
        }
    }

    /// Create a services-not-discovered error for a device.
    pub fn services_not_discovered(device_id: impl Into<String>) -> Self {
        Self::ServicesNotDiscovered {
            device_id: device_id.into(),
        }
    }

    /// Create a scan timeout error.
    pub fn scan_timeout(identifier: impl Into<String>, duration: Duration) -> Self {
        Self::ScanTimeout {
            identifier: identifier.into(),
            duration,
        }
    }

    /// Create a DFU-in-progress error.
    pub fn dfu_in_progress(device_id: impl Into<String>) -> Self {
        Self::DfuInProgress {
            device_id: device_id.into(),
        }
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Wrap a verbatim native failure reason as a generic operation failure.
    pub fn operation(reason: impl Into<String>) -> Self {
        Self::Ble(BleError::new(BleErrorCode::OperationFailed).with_reason(reason))
    }
}

/// Platform-independent failure codes with a stable message table.
///
/// The numeric values are part of the compat contract and never change.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new codes
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[repr(i32)]
pub enum BleErrorCode {
    /// Unclassified failure.
    UnknownError = 0,
    /// The session was destroyed while the operation was pending.
    SessionDestroyed = 1,
    /// The operation was cancelled.
    OperationCancelled = 2,
    /// The operation could not be started.
    OperationStartFailed = 3,
    /// The operation timed out natively.
    OperationTimedOut = 4,
    /// The operation failed for a backend-reported reason.
    OperationFailed = 5,
    /// BLE is not supported on this platform.
    BluetoothUnsupported = 100,
    /// The application is not authorized to use BLE.
    BluetoothUnauthorized = 101,
    /// The radio is powered off.
    BluetoothPoweredOff = 102,
    /// The adapter is in an indeterminate state.
    BluetoothInUnknownState = 103,
    /// The adapter is resetting.
    BluetoothResetting = 104,
    /// The connection attempt failed.
    DeviceConnectionFailed = 200,
    /// The device disconnected unexpectedly.
    DeviceDisconnected = 201,
    /// Reading the device RSSI failed.
    DeviceRssiReadFailed = 202,
    /// The device is already connected.
    DeviceAlreadyConnected = 203,
    /// The device could not be found.
    DeviceNotFound = 204,
    /// The device is not connected.
    DeviceNotConnected = 205,
    /// The MTU negotiation failed.
    DeviceMtuChangeFailed = 206,
    /// Service discovery failed.
    ServicesDiscoveryFailed = 300,
    /// The requested service was not found on the device.
    ServiceNotFound = 302,
    /// Characteristic discovery failed.
    CharacteristicsDiscoveryFailed = 303,
    /// Writing a characteristic failed.
    CharacteristicWriteFailed = 401,
    /// Reading a characteristic failed.
    CharacteristicReadFailed = 402,
    /// Changing the notification state of a characteristic failed.
    CharacteristicNotifyChangeFailed = 403,
    /// The requested characteristic was not found.
    CharacteristicNotFound = 404,
    /// Descriptor discovery failed.
    DescriptorsDiscoveryFailed = 500,
    /// Writing a descriptor failed.
    DescriptorWriteFailed = 501,
    /// Reading a descriptor failed.
    DescriptorReadFailed = 502,
    /// The requested descriptor was not found.
    DescriptorNotFound = 504,
    /// The scan could not be started.
    ScanStartFailed = 600,
}

impl BleErrorCode {
    /// Convert a native numeric code; unrecognized codes map to
    /// `UnknownError`.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::SessionDestroyed,
            2 => Self::OperationCancelled,
            3 => Self::OperationStartFailed,
            4 => Self::OperationTimedOut,
            5 => Self::OperationFailed,
            100 => Self::BluetoothUnsupported,
            101 => Self::BluetoothUnauthorized,
            102 => Self::BluetoothPoweredOff,
            103 => Self::BluetoothInUnknownState,
            104 => Self::BluetoothResetting,
            200 => Self::DeviceConnectionFailed,
            201 => Self::DeviceDisconnected,
            202 => Self::DeviceRssiReadFailed,
            203 => Self::DeviceAlreadyConnected,
            204 => Self::DeviceNotFound,
            205 => Self::DeviceNotConnected,
            206 => Self::DeviceMtuChangeFailed,
            300 => Self::ServicesDiscoveryFailed,
            302 => Self::ServiceNotFound,
            303 => Self::CharacteristicsDiscoveryFailed,
            401 => Self::CharacteristicWriteFailed,
            402 => Self::CharacteristicReadFailed,
            403 => Self::CharacteristicNotifyChangeFailed,
            404 => Self::CharacteristicNotFound,
            500 => Self::DescriptorsDiscoveryFailed,
            501 => Self::DescriptorWriteFailed,
            502 => Self::DescriptorReadFailed,
            504 => Self::DescriptorNotFound,
            600 => Self::ScanStartFailed,
            _ => Self::UnknownError,
        }
    }

    /// The numeric code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// The stable human-readable message for this code.
    pub fn message(self) -> &'static str {
        match self {
            Self::UnknownError => "Unknown error occurred",
            Self::SessionDestroyed => "BLE session was destroyed",
            Self::OperationCancelled => "Operation was cancelled",
            Self::OperationStartFailed => "Operation could not be started",
            Self::OperationTimedOut => "Operation timed out",
            Self::OperationFailed => "Operation failed",
            Self::BluetoothUnsupported => "Bluetooth Low Energy is unsupported",
            Self::BluetoothUnauthorized => "Device is not authorized to use Bluetooth",
            Self::BluetoothPoweredOff => "Bluetooth is powered off",
            Self::BluetoothInUnknownState => "Bluetooth is in unknown state",
            Self::BluetoothResetting => "Bluetooth is resetting",
            Self::DeviceConnectionFailed => "Device connection failed",
            Self::DeviceDisconnected => "Device was disconnected",
            Self::DeviceRssiReadFailed => "RSSI read failed for device",
            Self::DeviceAlreadyConnected => "Device is already connected",
            Self::DeviceNotFound => "Device not found",
            Self::DeviceNotConnected => "Device is not connected",
            Self::DeviceMtuChangeFailed => "Device could not change MTU size",
            Self::ServicesDiscoveryFailed => "Services discovery failed for device",
            Self::ServiceNotFound => "Service not found on device",
            Self::CharacteristicsDiscoveryFailed => "Characteristic discovery failed for service",
            Self::CharacteristicWriteFailed => "Characteristic write failed",
            Self::CharacteristicReadFailed => "Characteristic read failed",
            Self::CharacteristicNotifyChangeFailed => {
                "Characteristic notify change failed"
            }
            Self::CharacteristicNotFound => "Characteristic not found",
            Self::DescriptorsDiscoveryFailed => "Descriptor discovery failed",
            Self::DescriptorWriteFailed => "Descriptor write failed",
            Self::DescriptorReadFailed => "Descriptor read failed",
            Self::DescriptorNotFound => "Descriptor not found",
            Self::ScanStartFailed => "Scan could not be started",
        }
    }
}

/// Platform-specific sub-code accompanying a native failure.
///
/// A native payload carries at most one of these, which the enum enforces
/// structurally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlatformCode {
    /// ATT protocol error code.
    Att(i32),
    /// iOS (CoreBluetooth) error code.
    Ios(i32),
    /// Android (GATT stack) error code.
    Android(i32),
}

/// Projection of a native error payload into a single structured error.
///
/// Constructed once per failure and immutable thereafter; the builder-style
/// constructors consume `self`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BleError {
    /// The platform-independent failure code.
    pub code: BleErrorCode,
    /// At most one platform-specific sub-code.
    pub platform_code: Option<PlatformCode>,
    /// Free-text reason reported by the native collaborator, verbatim.
    pub reason: Option<String>,
    /// Device the failure is attributed to, if any.
    pub device_id: Option<String>,
    /// Service the failure is attributed to, if any.
    pub service_uuid: Option<CanonicalUuid>,
    /// Characteristic the failure is attributed to, if any.
    pub characteristic_uuid: Option<CanonicalUuid>,
    /// Descriptor the failure is attributed to, if any.
    pub descriptor_uuid: Option<CanonicalUuid>,
}

impl BleError {
    /// Create an error carrying only a code.
    pub fn new(code: BleErrorCode) -> Self {
        Self {
            code,
            platform_code: None,
            reason: None,
            device_id: None,
            service_uuid: None,
            characteristic_uuid: None,
            descriptor_uuid: None,
        }
    }

    /// Attach the native free-text reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach the platform-specific sub-code.
    #[must_use]
    pub fn with_platform_code(mut self, platform_code: PlatformCode) -> Self {
        self.platform_code = Some(platform_code);
        self
    }

    /// Attribute the failure to a device.
    #[must_use]
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Attribute the failure to a service.
    #[must_use]
    pub fn with_service(mut self, uuid: CanonicalUuid) -> Self {
        self.service_uuid = Some(uuid);
        self
    }

    /// Attribute the failure to a characteristic.
    #[must_use]
    pub fn with_characteristic(mut self, uuid: CanonicalUuid) -> Self {
        self.characteristic_uuid = Some(uuid);
        self
    }

    /// Attribute the failure to a descriptor.
    #[must_use]
    pub fn with_descriptor(mut self, uuid: CanonicalUuid) -> Self {
        self.descriptor_uuid = Some(uuid);
        self
    }
}

impl fmt::Display for BleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code.message())?;
        if let Some(device_id) = &self.device_id {
            write!(f, " [device {device_id}]")?;
        }
        if let Some(reason) = &self.reason {
            write!(f, ": {reason}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BleError {}

/// Result type alias using blekit-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::not_connected("D1");
        assert_eq!(err.to_string(), "device D1 is not connected");

        let err = Error::services_not_discovered("D1");
        assert!(err.to_string().contains("have not been discovered"));

        let err = Error::scan_timeout("D1", Duration::from_millis(50));
        assert!(err.to_string().contains("D1"));
        assert!(err.to_string().contains("50ms"));

        let err = Error::timeout("connect", Duration::from_secs(10));
        assert!(err.to_string().contains("connect"));
    }

    #[test]
    fn test_ble_error_message_table() {
        let err = BleError::new(BleErrorCode::DeviceConnectionFailed)
            .with_device("D1")
            .with_reason("link supervision timeout");
        assert_eq!(
            err.to_string(),
            "Device connection failed [device D1]: link supervision timeout"
        );
    }

    #[test]
    fn test_ble_error_code_round_trip() {
        for code in [
            BleErrorCode::UnknownError,
            BleErrorCode::OperationCancelled,
            BleErrorCode::BluetoothPoweredOff,
            BleErrorCode::DeviceNotConnected,
            BleErrorCode::CharacteristicNotFound,
            BleErrorCode::ScanStartFailed,
        ] {
            assert_eq!(BleErrorCode::from_code(code.code()), code);
        }
        assert_eq!(BleErrorCode::from_code(-123), BleErrorCode::UnknownError);
    }

    #[test]
    fn test_at_most_one_platform_code() {
        // The last platform code attached wins; the type holds at most one.
        let err = BleError::new(BleErrorCode::CharacteristicReadFailed)
            .with_platform_code(PlatformCode::Att(5))
            .with_platform_code(PlatformCode::Android(133));
        assert_eq!(err.platform_code, Some(PlatformCode::Android(133)));
    }

    #[test]
    fn test_operation_wraps_verbatim_reason() {
        let err = Error::operation("GATT_INSUF_AUTHORIZATION");
        match err {
            Error::Ble(inner) => {
                assert_eq!(inner.code, BleErrorCode::OperationFailed);
                assert_eq!(inner.reason.as_deref(), Some("GATT_INSUF_AUTHORIZATION"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_ble_error_serde() {
        let err = BleError::new(BleErrorCode::DeviceDisconnected).with_device("D1");
        let json = serde_json::to_string(&err).unwrap();
        let back: BleError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
