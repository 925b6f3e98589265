//! BLE connection/session lifecycle manager with a compat call surface.
//!
//! This crate gives application code a single, platform-independent handle
//! for discovering, connecting to, and exchanging data with BLE peripherals,
//! through two parallel call surfaces:
//!
//! - the **direct API** on [`BleSession`]: scan sessions, idempotent
//!   connect/disconnect, GATT discovery and I/O, characteristic
//!   subscriptions, session restoration, and firmware-update tracking
//! - the **compat API** in [`compat`]: device/service/characteristic/
//!   descriptor wrappers matching an established BLE client contract, so
//!   existing application code written against that contract needs no
//!   changes
//!
//! The platform radio itself lives behind the [`NativeBackend`] trait:
//! [`BtleplugBackend`] drives real hardware on desktop platforms, and
//! [`MockBackend`] scripts everything in memory for tests.
//!
//! # Quick Start
//!
//! ```no_run
//! use blekit_core::{BleSession, BtleplugBackend, ScanFilter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = BtleplugBackend::new().await?;
//!     let session = BleSession::new(backend);
//!
//!     // Scan for heart-rate monitors
//!     let filter = ScanFilter::for_services(["180d"])?;
//!     let mut stream = session.start_scan(filter).await?;
//!     if let Some(event) = stream.recv().await {
//!         println!("sighting: {event:?}");
//!     }
//!     session.stop_scan().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Identifier canonicalization
//!
//! Every service/characteristic/descriptor UUID accepted by the public
//! surface may be spelled in 16-, 32-, or 128-bit form; it is canonicalized
//! before being compared or forwarded. See [`blekit_types::uuid`].

pub mod backend;
pub mod compat;
pub mod dfu;
pub mod error;
pub mod events;
pub mod mock;
pub mod native;
pub mod scan;
pub mod session;
pub mod subscription;

// Re-export the shared types crate under its established names
pub use blekit_types::uuid as uuids;
pub use blekit_types::{
    AdapterState, Advertisement, CanonicalUuid, CharacteristicProperties, CharacteristicSnapshot,
    CompatValue, ConnectionPriority, DescriptorSnapshot, DfuProgress, DfuState, IdentifierError,
    LogLevel, RestoredPeripheral, ScanMode, ServiceDataEntry, ServiceSnapshot, Sighting,
    SubscriptionType, canonicalize, canonicalize_all,
};

// Core exports
pub use backend::{BackendEvent, NativeBackend};
pub use compat::{
    CompatCharacteristic, CompatClient, CompatDescriptor, CompatDevice, CompatService,
};
pub use dfu::{DfuEvent, DfuHandle, DfuOptions, FirmwareKind, FirmwareSource};
pub use error::{BleError, BleErrorCode, Error, PlatformCode, Result};
pub use events::{EventDispatcher, EventReceiver, EventSender, SessionEvent};
pub use mock::{MockBackend, MockPeripheral};
pub use native::BtleplugBackend;
pub use scan::{ScanEvent, ScanFilter, ScanStream};
pub use session::{BleSession, DEFAULT_MTU, DeviceRecord, SessionConfig};
pub use subscription::{AdapterStateMonitor, CharacteristicMonitor, SubscriptionHandle};

/// Type alias for a shared session reference.
///
/// [`BleSession::new`] already returns an `Arc`, since the session owns a
/// background event pump; this alias names that shape for APIs that store
/// one.
pub type SharedSession = std::sync::Arc<BleSession>;
