//! Platform-agnostic types for the blekit BLE client stack.
//!
//! This crate provides the shared vocabulary used by the session manager in
//! blekit-core and by any backend implementation:
//!
//! - GATT identifier canonicalization ([`uuid`])
//! - Native/compat encodings of the domain enumerations ([`compat`])
//! - Snapshot types for advertisements, services, characteristics,
//!   descriptors, and firmware-update state ([`types`])
//!
//! # Example
//!
//! ```
//! use blekit_types::uuid::canonicalize;
//!
//! let heart_rate = canonicalize("180d").unwrap();
//! assert_eq!(heart_rate.to_string(), "0000180d-0000-1000-8000-00805f9b34fb");
//! ```

pub mod compat;
pub mod error;
pub mod types;
pub mod uuid;

pub use compat::{
    AdapterState, CompatValue, ConnectionPriority, LogLevel, ScanMode, ServiceDataEntry,
    SubscriptionType, merge_service_data, service_data_to_entries, service_data_to_map,
};
pub use error::{IdentifierError, IdentifierResult};
pub use types::{
    Advertisement, CharacteristicProperties, CharacteristicSnapshot, DescriptorSnapshot,
    DfuProgress, DfuState, RestoredPeripheral, ServiceSnapshot, Sighting,
};
pub use uuid::{BLUETOOTH_BASE_TAIL, CanonicalUuid, canonicalize, canonicalize_all};
pub use uuid as uuids;
