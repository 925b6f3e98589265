//! Compatibility call surface.
//!
//! This module exposes the session through the call shapes and encodings of
//! an established, widely-adopted BLE client contract, so application code
//! written against that contract runs unchanged: adapter state and log level
//! travel as string names, enumerations are accepted in either encoding, and
//! keyed service data is exposed in map form.
//!
//! The wrapper objects are read-only projections over one native snapshot.
//! Every mutating call returns a **new** wrapper built from the fresh
//! snapshot; a caller holding an old wrapper keeps observing the state at the
//! time it was obtained. Property accessors perform field renames only and
//! never touch the radio.

use std::collections::HashMap;
use std::sync::Arc;

use blekit_types::{
    CanonicalUuid, CharacteristicSnapshot, CompatValue, ConnectionPriority, DescriptorSnapshot,
    LogLevel, ScanMode, ServiceSnapshot, SubscriptionType, canonicalize, service_data_to_map,
};

use crate::error::{BleError, BleErrorCode, Error, Result};
use crate::scan::{ScanFilter, ScanStream};
use crate::session::{BleSession, DeviceRecord};
use crate::subscription::{AdapterStateMonitor, CharacteristicMonitor, SubscriptionHandle};

/// Entry point of the compat surface.
#[derive(Clone)]
pub struct CompatClient {
    session: Arc<BleSession>,
}

impl CompatClient {
    /// Wrap a session.
    pub fn new(session: Arc<BleSession>) -> Self {
        Self { session }
    }

    /// The underlying session, for callers mixing both surfaces.
    pub fn session(&self) -> &Arc<BleSession> {
        &self.session
    }

    /// Current adapter state, as a compat string name.
    pub async fn state(&self) -> &'static str {
        self.session.state().await.compat_name()
    }

    /// Subscribe to adapter state changes.
    pub fn monitor_state(&self) -> AdapterStateMonitor {
        self.session.monitor_adapter_state()
    }

    /// Set the log level from either encoding.
    pub fn set_log_level(&self, level: impl Into<CompatValue>) {
        self.session.set_log_level(LogLevel::normalize(&level.into()));
    }

    /// Current log level, as a compat string name.
    pub fn log_level(&self) -> &'static str {
        self.session.log_level().compat_name()
    }

    /// Start scanning for devices advertising any of the given services.
    ///
    /// Joins the active scan session if one exists.
    pub async fn start_device_scan<S: AsRef<str>>(
        &self,
        service_uuids: &[S],
        allow_duplicates: bool,
        scan_mode: impl Into<CompatValue>,
    ) -> Result<ScanStream> {
        let filter = ScanFilter::for_services(service_uuids)?
            .allow_duplicates(allow_duplicates)
            .scan_mode(ScanMode::normalize(&scan_mode.into()));
        self.session.start_scan(filter).await
    }

    /// Stop the active scan session.
    pub async fn stop_device_scan(&self) -> Result<()> {
        self.session.stop_scan().await
    }

    /// Connect to a device and return its wrapper.
    pub async fn connect_to_device(&self, device_id: &str) -> Result<CompatDevice> {
        self.session.connect(device_id).await?;
        Ok(self.device_snapshot(device_id).await)
    }

    /// Cancel the connection to a device and return its wrapper.
    pub async fn cancel_device_connection(&self, device_id: &str) -> Result<CompatDevice> {
        self.session.disconnect(device_id).await?;
        Ok(self.device_snapshot(device_id).await)
    }

    /// Whether the device is connected.
    pub async fn is_device_connected(&self, device_id: &str) -> bool {
        self.session.is_connected(device_id).await
    }

    /// Wrappers for the known devices among the given identifiers.
    pub async fn devices(&self, device_ids: &[&str]) -> Vec<CompatDevice> {
        self.session
            .known_devices(device_ids)
            .await
            .into_iter()
            .map(|record| CompatDevice::new(Arc::clone(&self.session), record))
            .collect()
    }

    /// Wrappers for connected devices, optionally restricted to those
    /// advertising one of the given services.
    pub async fn connected_devices(&self, service_uuids: &[&str]) -> Result<Vec<CompatDevice>> {
        Ok(self
            .session
            .connected_devices(service_uuids)
            .await?
            .into_iter()
            .map(|record| CompatDevice::new(Arc::clone(&self.session), record))
            .collect())
    }

    /// Ask the platform to enable Bluetooth.
    pub async fn enable(&self) -> Result<()> {
        self.session.request_bluetooth_enable().await
    }

    /// Open the platform Bluetooth settings.
    pub async fn open_settings(&self) -> Result<()> {
        self.session.open_settings().await
    }

    async fn device_snapshot(&self, device_id: &str) -> CompatDevice {
        let record = self
            .session
            .device(device_id)
            .await
            .unwrap_or_else(|| DeviceRecord::new(device_id));
        CompatDevice::new(Arc::clone(&self.session), record)
    }
}

impl std::fmt::Debug for CompatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompatClient").finish_non_exhaustive()
    }
}

/// Read-only projection of one device snapshot.
#[derive(Clone)]
pub struct CompatDevice {
    session: Arc<BleSession>,
    record: DeviceRecord,
}

impl CompatDevice {
    pub(crate) fn new(session: Arc<BleSession>, record: DeviceRecord) -> Self {
        Self { session, record }
    }

    // --- Accessors (field renames only) ---

    /// The platform-assigned identifier.
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// The device display name.
    pub fn name(&self) -> Option<&str> {
        self.record.name.as_deref()
    }

    /// The advertised local name.
    pub fn local_name(&self) -> Option<&str> {
        self.record.advertisement.local_name.as_deref()
    }

    /// Signal strength of the last sighting.
    pub fn rssi(&self) -> Option<i16> {
        self.record.advertisement.rssi
    }

    /// Negotiated MTU of the current connection.
    pub fn mtu(&self) -> u16 {
        self.record.mtu
    }

    /// Advertised transmit power.
    pub fn tx_power_level(&self) -> Option<i16> {
        self.record.advertisement.tx_power
    }

    /// Raw manufacturer payload.
    pub fn manufacturer_data(&self) -> Option<&[u8]> {
        self.record.advertisement.manufacturer_data.as_deref()
    }

    /// Advertised service data, in the compat map shape.
    pub fn service_data(&self) -> Option<HashMap<CanonicalUuid, Vec<u8>>> {
        self.record
            .advertisement
            .service_data
            .as_deref()
            .and_then(service_data_to_map)
    }

    /// Advertised service UUIDs.
    pub fn service_uuids(&self) -> Option<&[CanonicalUuid]> {
        self.record.advertisement.service_uuids.as_deref()
    }

    /// Solicited service UUIDs.
    pub fn solicited_service_uuids(&self) -> Option<&[CanonicalUuid]> {
        self.record.advertisement.solicited_service_uuids.as_deref()
    }

    /// Overflow service UUIDs.
    pub fn overflow_service_uuids(&self) -> Option<&[CanonicalUuid]> {
        self.record.advertisement.overflow_service_uuids.as_deref()
    }

    /// Whether the device advertises as connectable.
    pub fn is_connectable(&self) -> Option<bool> {
        self.record.advertisement.is_connectable
    }

    async fn refreshed(&self) -> CompatDevice {
        let record = self
            .session
            .device(&self.record.id)
            .await
            .unwrap_or_else(|| DeviceRecord::new(&self.record.id));
        CompatDevice::new(Arc::clone(&self.session), record)
    }

    // --- Connection ---

    /// Connect to the device and return a fresh wrapper.
    pub async fn connect(&self) -> Result<CompatDevice> {
        self.session.connect(&self.record.id).await?;
        Ok(self.refreshed().await)
    }

    /// Cancel the connection and return a fresh wrapper.
    pub async fn cancel_connection(&self) -> Result<CompatDevice> {
        self.session.disconnect(&self.record.id).await?;
        Ok(self.refreshed().await)
    }

    /// Whether the device is connected right now.
    pub async fn is_connected(&self) -> bool {
        self.session.is_connected(&self.record.id).await
    }

    /// Register a disconnect listener for this device.
    pub async fn on_disconnected<F>(&self, listener: F) -> SubscriptionHandle
    where
        F: Fn(Option<BleError>) + Send + Sync + 'static,
    {
        self.session.on_disconnected(&self.record.id, listener).await
    }

    /// Run service discovery and return a fresh wrapper.
    pub async fn discover_all_services_and_characteristics(&self) -> Result<CompatDevice> {
        self.session.discover_services(&self.record.id).await?;
        Ok(self.refreshed().await)
    }

    /// Negotiate the MTU and return a fresh wrapper.
    pub async fn request_mtu(&self, mtu: u16) -> Result<CompatDevice> {
        self.session.request_mtu(&self.record.id, mtu).await?;
        Ok(self.refreshed().await)
    }

    /// Read the RSSI and return a fresh wrapper carrying it.
    pub async fn read_rssi(&self) -> Result<CompatDevice> {
        self.session.read_rssi(&self.record.id).await?;
        Ok(self.refreshed().await)
    }

    /// Hint the connection priority, in either encoding.
    pub async fn request_connection_priority(
        &self,
        priority: impl Into<CompatValue>,
    ) -> Result<CompatDevice> {
        let priority = ConnectionPriority::normalize(&priority.into());
        self.session
            .request_connection_priority(&self.record.id, priority)
            .await?;
        Ok(self.refreshed().await)
    }

    // --- GATT ---

    /// Discovered services of this device.
    pub async fn services(&self) -> Result<Vec<CompatService>> {
        Ok(self
            .session
            .services(&self.record.id)
            .await?
            .into_iter()
            .map(|snapshot| {
                CompatService::new(
                    Arc::clone(&self.session),
                    self.record.id.clone(),
                    snapshot,
                )
            })
            .collect())
    }

    /// Discovered characteristics of one service.
    pub async fn characteristics_for_service(
        &self,
        service: &str,
    ) -> Result<Vec<CompatCharacteristic>> {
        Ok(self
            .session
            .characteristics(&self.record.id, service)
            .await?
            .into_iter()
            .map(|snapshot| {
                CompatCharacteristic::new(
                    Arc::clone(&self.session),
                    self.record.id.clone(),
                    snapshot,
                )
            })
            .collect())
    }

    async fn characteristic_snapshot(
        &self,
        service: &str,
        characteristic: &str,
    ) -> Result<CharacteristicSnapshot> {
        let target = canonicalize(characteristic)?;
        self.session
            .characteristics(&self.record.id, service)
            .await?
            .into_iter()
            .find(|snapshot| snapshot.uuid == target)
            .ok_or_else(|| {
                Error::Ble(
                    BleError::new(BleErrorCode::CharacteristicNotFound)
                        .with_device(&self.record.id)
                        .with_characteristic(target),
                )
            })
    }

    /// Read a characteristic and return its wrapper carrying the value.
    pub async fn read_characteristic_for_service(
        &self,
        service: &str,
        characteristic: &str,
    ) -> Result<CompatCharacteristic> {
        let value = self
            .session
            .read_characteristic(&self.record.id, service, characteristic)
            .await?;
        let mut snapshot = self.characteristic_snapshot(service, characteristic).await?;
        snapshot.value = Some(value);
        Ok(CompatCharacteristic::new(
            Arc::clone(&self.session),
            self.record.id.clone(),
            snapshot,
        ))
    }

    /// Write a characteristic with response and return its wrapper.
    pub async fn write_characteristic_with_response_for_service(
        &self,
        service: &str,
        characteristic: &str,
        value: &[u8],
    ) -> Result<CompatCharacteristic> {
        self.write_characteristic(service, characteristic, value, true)
            .await
    }

    /// Write a characteristic without response and return its wrapper.
    pub async fn write_characteristic_without_response_for_service(
        &self,
        service: &str,
        characteristic: &str,
        value: &[u8],
    ) -> Result<CompatCharacteristic> {
        self.write_characteristic(service, characteristic, value, false)
            .await
    }

    async fn write_characteristic(
        &self,
        service: &str,
        characteristic: &str,
        value: &[u8],
        with_response: bool,
    ) -> Result<CompatCharacteristic> {
        self.session
            .write_characteristic(&self.record.id, service, characteristic, value, with_response)
            .await?;
        let mut snapshot = self.characteristic_snapshot(service, characteristic).await?;
        snapshot.value = Some(value.to_vec());
        Ok(CompatCharacteristic::new(
            Arc::clone(&self.session),
            self.record.id.clone(),
            snapshot,
        ))
    }

    /// Subscribe to value changes of a characteristic.
    ///
    /// Picks indications when the characteristic only supports them,
    /// notifications otherwise.
    pub async fn monitor_characteristic_for_service(
        &self,
        service: &str,
        characteristic: &str,
    ) -> Result<CharacteristicMonitor> {
        let snapshot = self.characteristic_snapshot(service, characteristic).await?;
        let kind = if !snapshot.properties.notify && snapshot.properties.indicate {
            SubscriptionType::Indication
        } else {
            SubscriptionType::Notification
        };
        self.session
            .subscribe_to_characteristic(&self.record.id, service, characteristic, kind)
            .await
    }

    /// Discovered descriptors of one characteristic.
    pub async fn descriptors_for_service(
        &self,
        service: &str,
        characteristic: &str,
    ) -> Result<Vec<CompatDescriptor>> {
        Ok(self
            .session
            .descriptors(&self.record.id, service, characteristic)
            .await?
            .into_iter()
            .map(|snapshot| {
                CompatDescriptor::new(
                    Arc::clone(&self.session),
                    self.record.id.clone(),
                    snapshot,
                )
            })
            .collect())
    }

    /// Read a descriptor and return its wrapper carrying the value.
    pub async fn read_descriptor_for_service(
        &self,
        service: &str,
        characteristic: &str,
        descriptor: &str,
    ) -> Result<CompatDescriptor> {
        let value = self
            .session
            .read_descriptor(&self.record.id, service, characteristic, descriptor)
            .await?;
        let snapshot = self
            .descriptor_snapshot(service, characteristic, descriptor, Some(value))
            .await?;
        Ok(CompatDescriptor::new(
            Arc::clone(&self.session),
            self.record.id.clone(),
            snapshot,
        ))
    }

    /// Write a descriptor and return its wrapper carrying the value.
    pub async fn write_descriptor_for_service(
        &self,
        service: &str,
        characteristic: &str,
        descriptor: &str,
        value: &[u8],
    ) -> Result<CompatDescriptor> {
        self.session
            .write_descriptor(&self.record.id, service, characteristic, descriptor, value)
            .await?;
        let snapshot = self
            .descriptor_snapshot(service, characteristic, descriptor, Some(value.to_vec()))
            .await?;
        Ok(CompatDescriptor::new(
            Arc::clone(&self.session),
            self.record.id.clone(),
            snapshot,
        ))
    }

    async fn descriptor_snapshot(
        &self,
        service: &str,
        characteristic: &str,
        descriptor: &str,
        value: Option<Vec<u8>>,
    ) -> Result<DescriptorSnapshot> {
        let target = canonicalize(descriptor)?;
        let mut snapshot = self
            .session
            .descriptors(&self.record.id, service, characteristic)
            .await?
            .into_iter()
            .find(|snapshot| snapshot.uuid == target)
            .ok_or_else(|| {
                Error::Ble(
                    BleError::new(BleErrorCode::DescriptorNotFound)
                        .with_device(&self.record.id)
                        .with_descriptor(target),
                )
            })?;
        snapshot.value = value;
        Ok(snapshot)
    }
}

impl std::fmt::Debug for CompatDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompatDevice")
            .field("id", &self.record.id)
            .field("name", &self.record.name)
            .field("connected", &self.record.connected)
            .finish_non_exhaustive()
    }
}

/// Read-only projection of one service snapshot.
#[derive(Clone)]
pub struct CompatService {
    session: Arc<BleSession>,
    device_id: String,
    snapshot: ServiceSnapshot,
}

impl CompatService {
    fn new(session: Arc<BleSession>, device_id: String, snapshot: ServiceSnapshot) -> Self {
        Self {
            session,
            device_id,
            snapshot,
        }
    }

    /// The service UUID.
    pub fn uuid(&self) -> &CanonicalUuid {
        &self.snapshot.uuid
    }

    /// The owning device identifier.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether this is a primary service.
    pub fn is_primary(&self) -> bool {
        self.snapshot.is_primary
    }

    /// Discovered characteristics of this service.
    pub async fn characteristics(&self) -> Result<Vec<CompatCharacteristic>> {
        Ok(self
            .session
            .characteristics(&self.device_id, &self.snapshot.uuid.to_string())
            .await?
            .into_iter()
            .map(|snapshot| {
                CompatCharacteristic::new(
                    Arc::clone(&self.session),
                    self.device_id.clone(),
                    snapshot,
                )
            })
            .collect())
    }
}

impl std::fmt::Debug for CompatService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompatService")
            .field("device_id", &self.device_id)
            .field("uuid", &self.snapshot.uuid)
            .finish_non_exhaustive()
    }
}

/// Read-only projection of one characteristic snapshot.
#[derive(Clone)]
pub struct CompatCharacteristic {
    session: Arc<BleSession>,
    device_id: String,
    snapshot: CharacteristicSnapshot,
}

impl CompatCharacteristic {
    fn new(
        session: Arc<BleSession>,
        device_id: String,
        snapshot: CharacteristicSnapshot,
    ) -> Self {
        Self {
            session,
            device_id,
            snapshot,
        }
    }

    /// The characteristic UUID.
    pub fn uuid(&self) -> &CanonicalUuid {
        &self.snapshot.uuid
    }

    /// The owning service UUID.
    pub fn service_uuid(&self) -> &CanonicalUuid {
        &self.snapshot.service_uuid
    }

    /// The owning device identifier.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether the characteristic supports reads.
    pub fn is_readable(&self) -> bool {
        self.snapshot.properties.read
    }

    /// Whether the characteristic supports acknowledged writes.
    pub fn is_writable_with_response(&self) -> bool {
        self.snapshot.properties.write
    }

    /// Whether the characteristic supports unacknowledged writes.
    pub fn is_writable_without_response(&self) -> bool {
        self.snapshot.properties.write_without_response
    }

    /// Whether the characteristic supports notifications.
    pub fn is_notifiable(&self) -> bool {
        self.snapshot.properties.notify
    }

    /// Whether the characteristic supports indications.
    pub fn is_indicatable(&self) -> bool {
        self.snapshot.properties.indicate
    }

    /// The value carried by this snapshot, if any.
    pub fn value(&self) -> Option<&[u8]> {
        self.snapshot.value.as_deref()
    }

    /// Read the value and return a new wrapper carrying it.
    pub async fn read(&self) -> Result<CompatCharacteristic> {
        let value = self
            .session
            .read_characteristic(
                &self.device_id,
                &self.snapshot.service_uuid.to_string(),
                &self.snapshot.uuid.to_string(),
            )
            .await?;
        let mut snapshot = self.snapshot.clone();
        snapshot.value = Some(value);
        Ok(CompatCharacteristic::new(
            Arc::clone(&self.session),
            self.device_id.clone(),
            snapshot,
        ))
    }

    /// Write with response and return a new wrapper carrying the value.
    pub async fn write_with_response(&self, value: &[u8]) -> Result<CompatCharacteristic> {
        self.write(value, true).await
    }

    /// Write without response and return a new wrapper carrying the value.
    pub async fn write_without_response(&self, value: &[u8]) -> Result<CompatCharacteristic> {
        self.write(value, false).await
    }

    async fn write(&self, value: &[u8], with_response: bool) -> Result<CompatCharacteristic> {
        self.session
            .write_characteristic(
                &self.device_id,
                &self.snapshot.service_uuid.to_string(),
                &self.snapshot.uuid.to_string(),
                value,
                with_response,
            )
            .await?;
        let mut snapshot = self.snapshot.clone();
        snapshot.value = Some(value.to_vec());
        Ok(CompatCharacteristic::new(
            Arc::clone(&self.session),
            self.device_id.clone(),
            snapshot,
        ))
    }

    /// Subscribe to value changes of this characteristic.
    pub async fn monitor(&self) -> Result<CharacteristicMonitor> {
        let kind = if !self.snapshot.properties.notify && self.snapshot.properties.indicate {
            SubscriptionType::Indication
        } else {
            SubscriptionType::Notification
        };
        self.session
            .subscribe_to_characteristic(
                &self.device_id,
                &self.snapshot.service_uuid.to_string(),
                &self.snapshot.uuid.to_string(),
                kind,
            )
            .await
    }

    /// Discovered descriptors of this characteristic.
    pub async fn descriptors(&self) -> Result<Vec<CompatDescriptor>> {
        Ok(self
            .session
            .descriptors(
                &self.device_id,
                &self.snapshot.service_uuid.to_string(),
                &self.snapshot.uuid.to_string(),
            )
            .await?
            .into_iter()
            .map(|snapshot| {
                CompatDescriptor::new(
                    Arc::clone(&self.session),
                    self.device_id.clone(),
                    snapshot,
                )
            })
            .collect())
    }
}

impl std::fmt::Debug for CompatCharacteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompatCharacteristic")
            .field("device_id", &self.device_id)
            .field("uuid", &self.snapshot.uuid)
            .finish_non_exhaustive()
    }
}

/// Read-only projection of one descriptor snapshot.
#[derive(Clone)]
pub struct CompatDescriptor {
    session: Arc<BleSession>,
    device_id: String,
    snapshot: DescriptorSnapshot,
}

impl CompatDescriptor {
    fn new(session: Arc<BleSession>, device_id: String, snapshot: DescriptorSnapshot) -> Self {
        Self {
            session,
            device_id,
            snapshot,
        }
    }

    /// The descriptor UUID.
    pub fn uuid(&self) -> &CanonicalUuid {
        &self.snapshot.uuid
    }

    /// The owning characteristic UUID.
    pub fn characteristic_uuid(&self) -> &CanonicalUuid {
        &self.snapshot.characteristic_uuid
    }

    /// The owning service UUID.
    pub fn service_uuid(&self) -> &CanonicalUuid {
        &self.snapshot.service_uuid
    }

    /// The owning device identifier.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The value carried by this snapshot, if any.
    pub fn value(&self) -> Option<&[u8]> {
        self.snapshot.value.as_deref()
    }

    /// Read the value and return a new wrapper carrying it.
    pub async fn read(&self) -> Result<CompatDescriptor> {
        let value = self
            .session
            .read_descriptor(
                &self.device_id,
                &self.snapshot.service_uuid.to_string(),
                &self.snapshot.characteristic_uuid.to_string(),
                &self.snapshot.uuid.to_string(),
            )
            .await?;
        let mut snapshot = self.snapshot.clone();
        snapshot.value = Some(value);
        Ok(CompatDescriptor::new(
            Arc::clone(&self.session),
            self.device_id.clone(),
            snapshot,
        ))
    }

    /// Write the value and return a new wrapper carrying it.
    pub async fn write(&self, value: &[u8]) -> Result<CompatDescriptor> {
        self.session
            .write_descriptor(
                &self.device_id,
                &self.snapshot.service_uuid.to_string(),
                &self.snapshot.characteristic_uuid.to_string(),
                &self.snapshot.uuid.to_string(),
                value,
            )
            .await?;
        let mut snapshot = self.snapshot.clone();
        snapshot.value = Some(value.to_vec());
        Ok(CompatDescriptor::new(
            Arc::clone(&self.session),
            self.device_id.clone(),
            snapshot,
        ))
    }
}

impl std::fmt::Debug for CompatDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompatDescriptor")
            .field("device_id", &self.device_id)
            .field("uuid", &self.snapshot.uuid)
            .finish_non_exhaustive()
    }
}
