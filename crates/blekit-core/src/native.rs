//! Desktop native backend built on btleplug.
//!
//! Implements the [`NativeBackend`] contract on top of the platform BLE
//! stacks btleplug wraps (CoreBluetooth, BlueZ, WinRT). Unsolicited stack
//! events are translated onto the backend event stream; request/response
//! operations run against cached peripheral handles with per-operation
//! timeouts.
//!
//! Operations desktop stacks do not expose (MTU negotiation, enable prompts,
//! settings, connection priority, DFU transfers) fail with
//! [`Error::Unsupported`].
//!
//! # Identifiers
//!
//! On macOS peripherals are identified by a CoreBluetooth UUID; on Linux and
//! Windows by their MAC address. The backend reports whichever form the
//! platform exposes as the opaque device identifier.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Manager as _, Peripheral as _,
    ScanFilter as BtleScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::{Mutex, broadcast};
use tokio::time::timeout;
use tracing::{debug, info};

use blekit_types::{
    AdapterState, Advertisement, CanonicalUuid, CharacteristicProperties, CharacteristicSnapshot,
    ConnectionPriority, DescriptorSnapshot, DfuState, ServiceDataEntry, ServiceSnapshot, Sighting,
    SubscriptionType,
};

use crate::backend::{BackendEvent, NativeBackend};
use crate::dfu::{DfuOptions, FirmwareSource};
use crate::error::{BleError, BleErrorCode, Error, Result};
use crate::scan::ScanFilter;

/// Default timeout for native BLE operations.
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Format a peripheral ID as a string.
///
/// On macOS peripheral IDs are UUIDs; elsewhere they wrap the address.
fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{id:?}")
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Create an identifier string from an address and peripheral ID.
///
/// On macOS, where addresses read as all zeros, the peripheral ID is used.
fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    if address == "00:00:00:00:00:00" {
        format_peripheral_id(peripheral_id)
    } else {
        address.to_string()
    }
}

/// Native collaborator backed by btleplug.
pub struct BtleplugBackend {
    adapter: Adapter,
    events: broadcast::Sender<BackendEvent>,
    peripherals: Mutex<HashMap<String, Peripheral>>,
    notification_pumps: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    adapter_state: Mutex<AdapterState>,
    scanning: Mutex<bool>,
    op_timeout: Duration,
}

impl BtleplugBackend {
    /// Create a backend on the first available adapter.
    pub async fn new() -> Result<Arc<Self>> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::NoAdapter)?;
        Self::with_adapter(adapter).await
    }

    /// Create a backend on a specific adapter.
    pub async fn with_adapter(adapter: Adapter) -> Result<Arc<Self>> {
        let (events, _) = broadcast::channel(256);
        let backend = Arc::new(Self {
            adapter,
            events,
            peripherals: Mutex::new(HashMap::new()),
            notification_pumps: Mutex::new(HashMap::new()),
            adapter_state: Mutex::new(AdapterState::Unknown),
            scanning: Mutex::new(false),
            op_timeout: DEFAULT_OP_TIMEOUT,
        });

        let central_events = backend.adapter.events().await?;
        tokio::spawn(Self::pump_central_events(
            Arc::downgrade(&backend),
            central_events,
        ));
        Ok(backend)
    }

    async fn pump_central_events(
        backend: Weak<Self>,
        mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    ) {
        while let Some(event) = events.next().await {
            let Some(backend) = backend.upgrade() else {
                break;
            };
            backend.handle_central_event(event).await;
        }
        debug!("central event pump stopped");
    }

    async fn handle_central_event(&self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServiceDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                if let Some(sighting) = self.sighting_for(&id).await {
                    let _ = self.events.send(BackendEvent::Sighting(sighting));
                }
            }
            CentralEvent::DeviceConnected(id) => {
                debug!(peripheral = %format_peripheral_id(&id), "stack reports connection");
            }
            CentralEvent::DeviceDisconnected(id) => {
                let device_id = self.identifier_for(&id).await;
                self.stop_notification_pump(&device_id).await;
                let _ = self.events.send(BackendEvent::DeviceDisconnected {
                    device_id,
                    error: None,
                });
            }
            CentralEvent::StateUpdate(state) => {
                let mapped = match state {
                    btleplug::api::CentralState::PoweredOn => AdapterState::PoweredOn,
                    btleplug::api::CentralState::PoweredOff => AdapterState::PoweredOff,
                    _ => AdapterState::Unknown,
                };
                *self.adapter_state.lock().await = mapped;
                let _ = self.events.send(BackendEvent::AdapterStateChanged(mapped));
            }
        }
    }

    /// Build a full sighting for a peripheral from its current properties.
    async fn sighting_for(&self, id: &PeripheralId) -> Option<Sighting> {
        let peripheral = self.adapter.peripheral(id).await.ok()?;
        let properties = peripheral.properties().await.ok()??;

        let device_id = create_identifier(&properties.address.to_string(), id);
        self.peripherals
            .lock()
            .await
            .insert(device_id.clone(), peripheral);

        // Raw AD format for the manufacturer payload: company id (LE) + data.
        let manufacturer_data = properties.manufacturer_data.iter().next().map(
            |(company_id, data)| {
                let mut payload = company_id.to_le_bytes().to_vec();
                payload.extend_from_slice(data);
                payload
            },
        );
        let service_data: Vec<ServiceDataEntry> = properties
            .service_data
            .iter()
            .map(|(uuid, data)| ServiceDataEntry::new(CanonicalUuid::from(*uuid), data.clone()))
            .collect();
        let service_uuids: Vec<CanonicalUuid> = properties
            .services
            .iter()
            .map(|uuid| CanonicalUuid::from(*uuid))
            .collect();

        Some(Sighting {
            device_id,
            name: properties.local_name.clone(),
            advertisement: Advertisement {
                local_name: properties.local_name,
                rssi: properties.rssi,
                tx_power: properties.tx_power_level,
                manufacturer_data,
                service_data: (!service_data.is_empty()).then_some(service_data),
                service_uuids: (!service_uuids.is_empty()).then_some(service_uuids),
                solicited_service_uuids: None,
                overflow_service_uuids: None,
                is_connectable: None,
            },
        })
    }

    async fn identifier_for(&self, id: &PeripheralId) -> String {
        if let Ok(peripheral) = self.adapter.peripheral(id).await
            && let Ok(Some(properties)) = peripheral.properties().await
        {
            return create_identifier(&properties.address.to_string(), id);
        }
        format_peripheral_id(id)
    }

    /// Look up a peripheral by identifier, searching the stack's known
    /// peripherals on a cache miss.
    async fn find_peripheral(&self, device_id: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripherals.lock().await.get(device_id) {
            return Ok(peripheral.clone());
        }

        let wanted = device_id.to_lowercase();
        for peripheral in self.adapter.peripherals().await? {
            let id = peripheral.id();
            let matches = match peripheral.properties().await {
                Ok(Some(properties)) => {
                    let address = properties.address.to_string().to_lowercase();
                    address == wanted
                        || address.replace(':', "") == wanted.replace(':', "")
                        || format_peripheral_id(&id).to_lowercase() == wanted
                }
                _ => format_peripheral_id(&id).to_lowercase() == wanted,
            };
            if matches {
                self.peripherals
                    .lock()
                    .await
                    .insert(device_id.to_string(), peripheral.clone());
                return Ok(peripheral);
            }
        }

        Err(Error::Ble(
            BleError::new(BleErrorCode::DeviceNotFound).with_device(device_id),
        ))
    }

    /// Spawn the per-device notification pump, once per connection.
    async fn start_notification_pump(&self, device_id: &str, peripheral: &Peripheral) -> Result<()> {
        let mut pumps = self.notification_pumps.lock().await;
        if pumps.contains_key(device_id) {
            return Ok(());
        }

        let mut stream = peripheral.notifications().await?;
        let events = self.events.clone();
        let id = device_id.to_string();
        let handle = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let _ = events.send(BackendEvent::Notification {
                    device_id: id.clone(),
                    characteristic: CanonicalUuid::from(notification.uuid),
                    value: notification.value,
                });
            }
        });
        pumps.insert(device_id.to_string(), handle);
        Ok(())
    }

    async fn stop_notification_pump(&self, device_id: &str) {
        if let Some(handle) = self.notification_pumps.lock().await.remove(device_id) {
            handle.abort();
        }
    }

    async fn find_characteristic(
        &self,
        peripheral: &Peripheral,
        service: &CanonicalUuid,
        characteristic: &CanonicalUuid,
    ) -> Result<btleplug::api::Characteristic> {
        for svc in peripheral.services() {
            if svc.uuid != *service.as_uuid() {
                continue;
            }
            for char in &svc.characteristics {
                if char.uuid == *characteristic.as_uuid() {
                    return Ok(char.clone());
                }
            }
        }
        Err(Error::Ble(
            BleError::new(BleErrorCode::CharacteristicNotFound)
                .with_service(*service)
                .with_characteristic(*characteristic),
        ))
    }

    async fn find_descriptor(
        &self,
        peripheral: &Peripheral,
        service: &CanonicalUuid,
        characteristic: &CanonicalUuid,
        descriptor: &CanonicalUuid,
    ) -> Result<btleplug::api::Descriptor> {
        let char = self
            .find_characteristic(peripheral, service, characteristic)
            .await?;
        char.descriptors
            .iter()
            .find(|d| d.uuid == *descriptor.as_uuid())
            .cloned()
            .ok_or_else(|| {
                Error::Ble(
                    BleError::new(BleErrorCode::DescriptorNotFound)
                        .with_characteristic(*characteristic)
                        .with_descriptor(*descriptor),
                )
            })
    }

    async fn with_timeout<T, F>(&self, operation: &str, future: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, btleplug::Error>>,
    {
        timeout(self.op_timeout, future)
            .await
            .map_err(|_| Error::timeout(operation, self.op_timeout))?
            .map_err(Error::from)
    }
}

#[async_trait]
impl NativeBackend for BtleplugBackend {
    fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    async fn start_scan(&self, filter: &ScanFilter) -> Result<()> {
        let services = filter
            .service_uuids
            .iter()
            .map(|uuid| *uuid.as_uuid())
            .collect();
        self.adapter
            .start_scan(BtleScanFilter { services })
            .await?;
        *self.scanning.lock().await = true;
        info!("native scan started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        *self.scanning.lock().await = false;
        info!("native scan stopped");
        Ok(())
    }

    async fn is_scanning(&self) -> bool {
        *self.scanning.lock().await
    }

    async fn adapter_state(&self) -> AdapterState {
        *self.adapter_state.lock().await
    }

    async fn request_enable(&self) -> Result<()> {
        Err(Error::Unsupported {
            operation: "request_enable",
        })
    }

    async fn open_settings(&self) -> Result<()> {
        Err(Error::Unsupported {
            operation: "open_settings",
        })
    }

    async fn connect(&self, device_id: &str, _auto_connect: bool) -> Result<()> {
        let peripheral = self.find_peripheral(device_id).await?;
        self.with_timeout("connect", peripheral.connect()).await?;
        self.start_notification_pump(device_id, &peripheral).await?;
        info!(device_id, "native connection established");
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<()> {
        let peripheral = self.find_peripheral(device_id).await?;
        self.stop_notification_pump(device_id).await;
        self.with_timeout("disconnect", peripheral.disconnect())
            .await?;
        info!(device_id, "native connection closed");
        Ok(())
    }

    async fn is_connected(&self, device_id: &str) -> bool {
        match self.find_peripheral(device_id).await {
            Ok(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn request_mtu(&self, _device_id: &str, _mtu: u16) -> Result<u16> {
        // Desktop stacks negotiate the MTU themselves.
        Err(Error::Unsupported {
            operation: "request_mtu",
        })
    }

    async fn read_rssi(&self, device_id: &str) -> Result<i16> {
        let peripheral = self.find_peripheral(device_id).await?;
        let properties = peripheral.properties().await?;
        properties.and_then(|p| p.rssi).ok_or_else(|| {
            Error::Ble(BleError::new(BleErrorCode::DeviceRssiReadFailed).with_device(device_id))
        })
    }

    async fn request_connection_priority(
        &self,
        _device_id: &str,
        _priority: ConnectionPriority,
    ) -> Result<()> {
        Err(Error::Unsupported {
            operation: "request_connection_priority",
        })
    }

    async fn discover_services(&self, device_id: &str) -> Result<()> {
        let peripheral = self.find_peripheral(device_id).await?;
        self.with_timeout("discover_services", peripheral.discover_services())
            .await?;
        debug!(device_id, "native service discovery complete");
        Ok(())
    }

    async fn services(&self, device_id: &str) -> Result<Vec<ServiceSnapshot>> {
        let peripheral = self.find_peripheral(device_id).await?;
        Ok(peripheral
            .services()
            .into_iter()
            .map(|service| ServiceSnapshot {
                uuid: CanonicalUuid::from(service.uuid),
                is_primary: service.primary,
            })
            .collect())
    }

    async fn characteristics(
        &self,
        device_id: &str,
        service: &CanonicalUuid,
    ) -> Result<Vec<CharacteristicSnapshot>> {
        let peripheral = self.find_peripheral(device_id).await?;
        Ok(peripheral
            .services()
            .into_iter()
            .filter(|svc| svc.uuid == *service.as_uuid())
            .flat_map(|svc| svc.characteristics.into_iter())
            .map(|char| CharacteristicSnapshot {
                uuid: CanonicalUuid::from(char.uuid),
                service_uuid: *service,
                properties: CharacteristicProperties {
                    read: char.properties.contains(CharPropFlags::READ),
                    write: char.properties.contains(CharPropFlags::WRITE),
                    write_without_response: char
                        .properties
                        .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
                    notify: char.properties.contains(CharPropFlags::NOTIFY),
                    indicate: char.properties.contains(CharPropFlags::INDICATE),
                },
                value: None,
            })
            .collect())
    }

    async fn descriptors(
        &self,
        device_id: &str,
        service: &CanonicalUuid,
        characteristic: &CanonicalUuid,
    ) -> Result<Vec<DescriptorSnapshot>> {
        let peripheral = self.find_peripheral(device_id).await?;
        let char = self
            .find_characteristic(&peripheral, service, characteristic)
            .await?;
        Ok(char
            .descriptors
            .into_iter()
            .map(|descriptor| DescriptorSnapshot {
                uuid: CanonicalUuid::from(descriptor.uuid),
                characteristic_uuid: *characteristic,
                service_uuid: *service,
                value: None,
            })
            .collect())
    }

    async fn read_characteristic(
        &self,
        device_id: &str,
        service: &CanonicalUuid,
        characteristic: &CanonicalUuid,
    ) -> Result<Vec<u8>> {
        let peripheral = self.find_peripheral(device_id).await?;
        let char = self
            .find_characteristic(&peripheral, service, characteristic)
            .await?;
        self.with_timeout("read_characteristic", peripheral.read(&char))
            .await
    }

    async fn write_characteristic(
        &self,
        device_id: &str,
        service: &CanonicalUuid,
        characteristic: &CanonicalUuid,
        value: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let peripheral = self.find_peripheral(device_id).await?;
        let char = self
            .find_characteristic(&peripheral, service, characteristic)
            .await?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.with_timeout(
            "write_characteristic",
            peripheral.write(&char, value, write_type),
        )
        .await
    }

    async fn read_descriptor(
        &self,
        device_id: &str,
        service: &CanonicalUuid,
        characteristic: &CanonicalUuid,
        descriptor: &CanonicalUuid,
    ) -> Result<Vec<u8>> {
        let peripheral = self.find_peripheral(device_id).await?;
        let descriptor = self
            .find_descriptor(&peripheral, service, characteristic, descriptor)
            .await?;
        self.with_timeout("read_descriptor", peripheral.read_descriptor(&descriptor))
            .await
    }

    async fn write_descriptor(
        &self,
        device_id: &str,
        service: &CanonicalUuid,
        characteristic: &CanonicalUuid,
        descriptor: &CanonicalUuid,
        value: &[u8],
    ) -> Result<()> {
        let peripheral = self.find_peripheral(device_id).await?;
        let descriptor = self
            .find_descriptor(&peripheral, service, characteristic, descriptor)
            .await?;
        self.with_timeout(
            "write_descriptor",
            peripheral.write_descriptor(&descriptor, value),
        )
        .await
    }

    async fn subscribe(
        &self,
        device_id: &str,
        service: &CanonicalUuid,
        characteristic: &CanonicalUuid,
        _kind: SubscriptionType,
    ) -> Result<()> {
        // The stack picks notification or indication from the CCCD itself.
        let peripheral = self.find_peripheral(device_id).await?;
        let char = self
            .find_characteristic(&peripheral, service, characteristic)
            .await?;
        self.start_notification_pump(device_id, &peripheral).await?;
        self.with_timeout("subscribe", peripheral.subscribe(&char))
            .await
    }

    async fn unsubscribe(
        &self,
        device_id: &str,
        service: &CanonicalUuid,
        characteristic: &CanonicalUuid,
    ) -> Result<()> {
        let peripheral = self.find_peripheral(device_id).await?;
        let char = self
            .find_characteristic(&peripheral, service, characteristic)
            .await?;
        self.with_timeout("unsubscribe", peripheral.unsubscribe(&char))
            .await
    }

    async fn start_dfu(
        &self,
        _device_id: &str,
        _firmware: &FirmwareSource,
        _options: &DfuOptions,
    ) -> Result<()> {
        Err(Error::Unsupported {
            operation: "start_dfu",
        })
    }

    async fn pause_dfu(&self, _device_id: &str) -> bool {
        false
    }

    async fn resume_dfu(&self, _device_id: &str) -> bool {
        false
    }

    async fn abort_dfu(&self, _device_id: &str) -> bool {
        false
    }

    async fn dfu_state(&self, _device_id: &str) -> DfuState {
        DfuState::Idle
    }
}

impl std::fmt::Debug for BtleplugBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugBackend").finish_non_exhaustive()
    }
}
