//! Mock native collaborator for testing.
//!
//! [`MockBackend`] implements [`NativeBackend`] entirely in memory, so the
//! session can be exercised without BLE hardware:
//!
//! - **Scripted peripherals**: register devices with services,
//!   characteristics, and values
//! - **Failure injection**: make specific operations fail with a chosen error
//! - **Latency simulation**: add artificial delays to async commands
//! - **Event injection**: emit sightings, unsolicited disconnects,
//!   restoration, notifications, and DFU sequences from test code
//! - **Command counters**: assert how many native commands were issued

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tokio::time::sleep;

use blekit_types::{
    AdapterState, CanonicalUuid, CharacteristicProperties, CharacteristicSnapshot,
    ConnectionPriority, DescriptorSnapshot, DfuState, RestoredPeripheral, ServiceSnapshot,
    Sighting, SubscriptionType, canonicalize,
};

use crate::backend::{BackendEvent, NativeBackend};
use crate::dfu::{DfuEvent, DfuOptions, FirmwareSource};
use crate::error::{BleError, BleErrorCode, Error, Result};
use crate::scan::ScanFilter;

/// A scripted peripheral known to the mock.
#[derive(Debug, Clone, Default)]
pub struct MockPeripheral {
    /// Device name.
    pub name: Option<String>,
    /// Discovered services.
    pub services: Vec<ServiceSnapshot>,
    /// Discovered characteristics.
    pub characteristics: Vec<CharacteristicSnapshot>,
    /// Discovered descriptors.
    pub descriptors: Vec<DescriptorSnapshot>,
    /// Readable attribute values, keyed by characteristic or descriptor UUID.
    pub values: HashMap<CanonicalUuid, Vec<u8>>,
    /// Reported RSSI.
    pub rssi: i16,
}

impl MockPeripheral {
    /// Create a bare peripheral.
    pub fn new() -> Self {
        Self {
            rssi: -50,
            ..Self::default()
        }
    }

    /// Set the device name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the reported RSSI.
    #[must_use]
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    /// Add a primary service. The UUID may use any accepted encoding.
    ///
    /// # Panics
    ///
    /// Panics on an invalid UUID; mocks are built from literals in tests.
    #[must_use]
    pub fn with_service(mut self, uuid: &str) -> Self {
        self.services.push(ServiceSnapshot {
            uuid: canonicalize(uuid).expect("valid service uuid"),
            is_primary: true,
        });
        self
    }

    /// Add a characteristic, optionally with a readable value.
    #[must_use]
    pub fn with_characteristic(
        mut self,
        service: &str,
        characteristic: &str,
        properties: CharacteristicProperties,
        value: Option<Vec<u8>>,
    ) -> Self {
        let service = canonicalize(service).expect("valid service uuid");
        let characteristic = canonicalize(characteristic).expect("valid characteristic uuid");
        self.characteristics.push(CharacteristicSnapshot {
            uuid: characteristic,
            service_uuid: service,
            properties,
            value: None,
        });
        if let Some(value) = value {
            self.values.insert(characteristic, value);
        }
        self
    }

    /// Add a descriptor, optionally with a readable value.
    #[must_use]
    pub fn with_descriptor(
        mut self,
        service: &str,
        characteristic: &str,
        descriptor: &str,
        value: Option<Vec<u8>>,
    ) -> Self {
        let service = canonicalize(service).expect("valid service uuid");
        let characteristic = canonicalize(characteristic).expect("valid characteristic uuid");
        let descriptor = canonicalize(descriptor).expect("valid descriptor uuid");
        self.descriptors.push(DescriptorSnapshot {
            uuid: descriptor,
            characteristic_uuid: characteristic,
            service_uuid: service,
            value: None,
        });
        if let Some(value) = value {
            self.values.insert(descriptor, value);
        }
        self
    }
}

#[derive(Default)]
struct MockInner {
    adapter_state: AdapterState,
    scanning: bool,
    connected: HashSet<String>,
    peripherals: HashMap<String, MockPeripheral>,
    connect_failure: Option<BleError>,
    disconnect_failure: Option<BleError>,
    subscribe_failure: Option<BleError>,
    unsubscribe_failure: Option<BleError>,
    start_dfu_failure: Option<BleError>,
    connect_latency: Duration,
    dfu_states: HashMap<String, DfuState>,
    dfu_script: Vec<DfuEvent>,
    writes: Vec<(String, CanonicalUuid, Vec<u8>, bool)>,
}

/// In-memory native collaborator.
pub struct MockBackend {
    events: broadcast::Sender<BackendEvent>,
    inner: Mutex<MockInner>,
    connect_count: AtomicU32,
    disconnect_count: AtomicU32,
    scan_start_count: AtomicU32,
    scan_stop_count: AtomicU32,
    discover_count: AtomicU32,
    subscribe_count: AtomicU32,
    unsubscribe_count: AtomicU32,
}

impl MockBackend {
    /// Create a mock backend.
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            inner: Mutex::new(MockInner {
                adapter_state: AdapterState::PoweredOn,
                ..MockInner::default()
            }),
            connect_count: AtomicU32::new(0),
            disconnect_count: AtomicU32::new(0),
            scan_start_count: AtomicU32::new(0),
            scan_stop_count: AtomicU32::new(0),
            discover_count: AtomicU32::new(0),
            subscribe_count: AtomicU32::new(0),
            unsubscribe_count: AtomicU32::new(0),
        })
    }

    // --- Scripting ---

    /// Register a peripheral under an identifier.
    pub async fn add_peripheral(&self, device_id: &str, peripheral: MockPeripheral) {
        self.inner
            .lock()
            .await
            .peripherals
            .insert(device_id.to_string(), peripheral);
    }

    /// Make subsequent connects fail with the given error.
    pub async fn set_connect_failure(&self, failure: Option<BleError>) {
        self.inner.lock().await.connect_failure = failure;
    }

    /// Make subsequent disconnects fail with the given error.
    pub async fn set_disconnect_failure(&self, failure: Option<BleError>) {
        self.inner.lock().await.disconnect_failure = failure;
    }

    /// Make subsequent subscribes fail with the given error.
    pub async fn set_subscribe_failure(&self, failure: Option<BleError>) {
        self.inner.lock().await.subscribe_failure = failure;
    }

    /// Make subsequent unsubscribes fail with the given error.
    pub async fn set_unsubscribe_failure(&self, failure: Option<BleError>) {
        self.inner.lock().await.unsubscribe_failure = failure;
    }

    /// Make subsequent DFU starts fail with the given error.
    pub async fn set_start_dfu_failure(&self, failure: Option<BleError>) {
        self.inner.lock().await.start_dfu_failure = failure;
    }

    /// Delay each connect by the given duration.
    pub async fn set_connect_latency(&self, latency: Duration) {
        self.inner.lock().await.connect_latency = latency;
    }

    /// Script the event sequence emitted when a DFU transfer starts.
    pub async fn script_dfu(&self, events: Vec<DfuEvent>) {
        self.inner.lock().await.dfu_script = events;
    }

    /// Values written through the backend, in order.
    pub async fn writes(&self) -> Vec<(String, CanonicalUuid, Vec<u8>, bool)> {
        self.inner.lock().await.writes.clone()
    }

    // --- Event injection ---

    /// Report a scan sighting.
    pub fn emit_sighting(&self, sighting: Sighting) {
        let _ = self.events.send(BackendEvent::Sighting(sighting));
    }

    /// Report a native scan failure.
    pub fn emit_scan_failure(&self, error: BleError) {
        let _ = self.events.send(BackendEvent::ScanFailed(error));
    }

    /// Report an unsolicited disconnect, dropping the native connection.
    pub async fn emit_disconnect(&self, device_id: &str, error: Option<BleError>) {
        self.inner.lock().await.connected.remove(device_id);
        let _ = self.events.send(BackendEvent::DeviceDisconnected {
            device_id: device_id.to_string(),
            error,
        });
    }

    /// Report a restored session.
    pub fn emit_restoration(&self, devices: Vec<RestoredPeripheral>) {
        let _ = self.events.send(BackendEvent::SessionRestored(devices));
    }

    /// Report a characteristic value change.
    pub fn emit_notification(&self, device_id: &str, characteristic: CanonicalUuid, value: Vec<u8>) {
        let _ = self.events.send(BackendEvent::Notification {
            device_id: device_id.to_string(),
            characteristic,
            value,
        });
    }

    /// Report an adapter state change.
    pub async fn emit_adapter_state(&self, state: AdapterState) {
        self.inner.lock().await.adapter_state = state;
        let _ = self.events.send(BackendEvent::AdapterStateChanged(state));
    }

    /// Report a DFU event for a device.
    pub async fn emit_dfu_event(&self, device_id: &str, event: DfuEvent) {
        if let DfuEvent::StateChanged(state) = &event {
            self.inner
                .lock()
                .await
                .dfu_states
                .insert(device_id.to_string(), *state);
        }
        let _ = self.events.send(BackendEvent::Dfu {
            device_id: device_id.to_string(),
            event,
        });
    }

    // --- Counters ---

    /// Native connect commands issued.
    pub fn connect_calls(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Native disconnect commands issued.
    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_count.load(Ordering::SeqCst)
    }

    /// Native scan starts issued.
    pub fn scan_starts(&self) -> u32 {
        self.scan_start_count.load(Ordering::SeqCst)
    }

    /// Native scan stops issued.
    pub fn scan_stops(&self) -> u32 {
        self.scan_stop_count.load(Ordering::SeqCst)
    }

    /// Native discovery commands issued.
    pub fn discover_calls(&self) -> u32 {
        self.discover_count.load(Ordering::SeqCst)
    }

    /// Native subscribe commands issued.
    pub fn subscribe_calls(&self) -> u32 {
        self.subscribe_count.load(Ordering::SeqCst)
    }

    /// Native unsubscribe commands issued.
    pub fn unsubscribe_calls(&self) -> u32 {
        self.unsubscribe_count.load(Ordering::SeqCst)
    }

    fn not_connected(device_id: &str) -> Error {
        Error::Ble(
            BleError::new(BleErrorCode::DeviceNotConnected).with_device(device_id),
        )
    }
}

#[async_trait]
impl NativeBackend for MockBackend {
    fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    async fn start_scan(&self, _filter: &ScanFilter) -> Result<()> {
        self.scan_start_count.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().await.scanning = true;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scan_stop_count.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().await.scanning = false;
        Ok(())
    }

    async fn is_scanning(&self) -> bool {
        self.inner.lock().await.scanning
    }

    async fn adapter_state(&self) -> AdapterState {
        self.inner.lock().await.adapter_state
    }

    async fn request_enable(&self) -> Result<()> {
        self.emit_adapter_state(AdapterState::PoweredOn).await;
        Ok(())
    }

    async fn open_settings(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(&self, device_id: &str, _auto_connect: bool) -> Result<()> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        let latency = self.inner.lock().await.connect_latency;
        if !latency.is_zero() {
            sleep(latency).await;
        }

        let mut inner = self.inner.lock().await;
        if let Some(failure) = &inner.connect_failure {
            return Err(Error::Ble(failure.clone()));
        }
        if !inner.peripherals.contains_key(device_id) {
            return Err(Error::Ble(
                BleError::new(BleErrorCode::DeviceNotFound).with_device(device_id),
            ));
        }
        inner.connected.insert(device_id.to_string());
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<()> {
        self.disconnect_count.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().await;
        if let Some(failure) = &inner.disconnect_failure {
            return Err(Error::Ble(failure.clone()));
        }
        inner.connected.remove(device_id);
        Ok(())
    }

    async fn is_connected(&self, device_id: &str) -> bool {
        self.inner.lock().await.connected.contains(device_id)
    }

    async fn request_mtu(&self, device_id: &str, mtu: u16) -> Result<u16> {
        let inner = self.inner.lock().await;
        if !inner.connected.contains(device_id) {
            return Err(Self::not_connected(device_id));
        }
        Ok(mtu.min(517))
    }

    async fn read_rssi(&self, device_id: &str) -> Result<i16> {
        let inner = self.inner.lock().await;
        if !inner.connected.contains(device_id) {
            return Err(Self::not_connected(device_id));
        }
        inner
            .peripherals
            .get(device_id)
            .map(|peripheral| peripheral.rssi)
            .ok_or_else(|| {
                Error::Ble(BleError::new(BleErrorCode::DeviceRssiReadFailed).with_device(device_id))
            })
    }

    async fn request_connection_priority(
        &self,
        device_id: &str,
        _priority: ConnectionPriority,
    ) -> Result<()> {
        let inner = self.inner.lock().await;
        if !inner.connected.contains(device_id) {
            return Err(Self::not_connected(device_id));
        }
        Ok(())
    }

    async fn discover_services(&self, device_id: &str) -> Result<()> {
        self.discover_count.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().await;
        if !inner.connected.contains(device_id) {
            return Err(Self::not_connected(device_id));
        }
        Ok(())
    }

    async fn services(&self, device_id: &str) -> Result<Vec<ServiceSnapshot>> {
        let inner = self.inner.lock().await;
        inner
            .peripherals
            .get(device_id)
            .map(|peripheral| peripheral.services.clone())
            .ok_or_else(|| Self::not_connected(device_id))
    }

    async fn characteristics(
        &self,
        device_id: &str,
        service: &CanonicalUuid,
    ) -> Result<Vec<CharacteristicSnapshot>> {
        let inner = self.inner.lock().await;
        let peripheral = inner
            .peripherals
            .get(device_id)
            .ok_or_else(|| Self::not_connected(device_id))?;
        Ok(peripheral
            .characteristics
            .iter()
            .filter(|snapshot| snapshot.service_uuid == *service)
            .cloned()
            .collect())
    }

    async fn descriptors(
        &self,
        device_id: &str,
        service: &CanonicalUuid,
        characteristic: &CanonicalUuid,
    ) -> Result<Vec<DescriptorSnapshot>> {
        let inner = self.inner.lock().await;
        let peripheral = inner
            .peripherals
            .get(device_id)
            .ok_or_else(|| Self::not_connected(device_id))?;
        Ok(peripheral
            .descriptors
            .iter()
            .filter(|snapshot| {
                snapshot.service_uuid == *service
                    && snapshot.characteristic_uuid == *characteristic
            })
            .cloned()
            .collect())
    }

    async fn read_characteristic(
        &self,
        device_id: &str,
        _service: &CanonicalUuid,
        characteristic: &CanonicalUuid,
    ) -> Result<Vec<u8>> {
        let inner = self.inner.lock().await;
        let peripheral = inner
            .peripherals
            .get(device_id)
            .ok_or_else(|| Self::not_connected(device_id))?;
        peripheral.values.get(characteristic).cloned().ok_or_else(|| {
            Error::Ble(
                BleError::new(BleErrorCode::CharacteristicNotFound)
                    .with_device(device_id)
                    .with_characteristic(*characteristic),
            )
        })
    }

    async fn write_characteristic(
        &self,
        device_id: &str,
        _service: &CanonicalUuid,
        characteristic: &CanonicalUuid,
        value: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.connected.contains(device_id) {
            return Err(Self::not_connected(device_id));
        }
        inner.writes.push((
            device_id.to_string(),
            *characteristic,
            value.to_vec(),
            with_response,
        ));
        if let Some(peripheral) = inner.peripherals.get_mut(device_id) {
            peripheral.values.insert(*characteristic, value.to_vec());
        }
        Ok(())
    }

    async fn read_descriptor(
        &self,
        device_id: &str,
        _service: &CanonicalUuid,
        _characteristic: &CanonicalUuid,
        descriptor: &CanonicalUuid,
    ) -> Result<Vec<u8>> {
        let inner = self.inner.lock().await;
        let peripheral = inner
            .peripherals
            .get(device_id)
            .ok_or_else(|| Self::not_connected(device_id))?;
        peripheral.values.get(descriptor).cloned().ok_or_else(|| {
            Error::Ble(
                BleError::new(BleErrorCode::DescriptorNotFound)
                    .with_device(device_id)
                    .with_descriptor(*descriptor),
            )
        })
    }

    async fn write_descriptor(
        &self,
        device_id: &str,
        _service: &CanonicalUuid,
        _characteristic: &CanonicalUuid,
        descriptor: &CanonicalUuid,
        value: &[u8],
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.connected.contains(device_id) {
            return Err(Self::not_connected(device_id));
        }
        if let Some(peripheral) = inner.peripherals.get_mut(device_id) {
            peripheral.values.insert(*descriptor, value.to_vec());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        device_id: &str,
        _service: &CanonicalUuid,
        _characteristic: &CanonicalUuid,
        _kind: SubscriptionType,
    ) -> Result<()> {
        self.subscribe_count.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().await;
        if let Some(failure) = &inner.subscribe_failure {
            return Err(Error::Ble(failure.clone()));
        }
        if !inner.connected.contains(device_id) {
            return Err(Self::not_connected(device_id));
        }
        Ok(())
    }

    async fn unsubscribe(
        &self,
        _device_id: &str,
        _service: &CanonicalUuid,
        _characteristic: &CanonicalUuid,
    ) -> Result<()> {
        self.unsubscribe_count.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().await;
        if let Some(failure) = &inner.unsubscribe_failure {
            return Err(Error::Ble(failure.clone()));
        }
        Ok(())
    }

    async fn start_dfu(
        &self,
        device_id: &str,
        _firmware: &FirmwareSource,
        _options: &DfuOptions,
    ) -> Result<()> {
        let script = {
            let mut inner = self.inner.lock().await;
            if let Some(failure) = &inner.start_dfu_failure {
                return Err(Error::Ble(failure.clone()));
            }
            inner
                .dfu_states
                .insert(device_id.to_string(), DfuState::Starting);
            inner.dfu_script.clone()
        };
        for event in script {
            self.emit_dfu_event(device_id, event).await;
        }
        Ok(())
    }

    async fn pause_dfu(&self, device_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .dfu_states
            .get(device_id)
            .copied()
            .unwrap_or(DfuState::Idle)
            .is_active()
    }

    async fn resume_dfu(&self, device_id: &str) -> bool {
        self.pause_dfu(device_id).await
    }

    async fn abort_dfu(&self, device_id: &str) -> bool {
        let active = self
            .inner
            .lock()
            .await
            .dfu_states
            .get(device_id)
            .copied()
            .unwrap_or(DfuState::Idle)
            .is_active();
        if active {
            self.emit_dfu_event(device_id, DfuEvent::StateChanged(DfuState::Aborted))
                .await;
        }
        active
    }

    async fn dfu_state(&self, device_id: &str) -> DfuState {
        self.inner
            .lock()
            .await
            .dfu_states
            .get(device_id)
            .copied()
            .unwrap_or(DfuState::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_tracks_native_state() {
        let backend = MockBackend::new();
        backend.add_peripheral("D1", MockPeripheral::new()).await;

        assert!(!backend.is_connected("D1").await);
        backend.connect("D1", false).await.unwrap();
        assert!(backend.is_connected("D1").await);
        assert_eq!(backend.connect_calls(), 1);

        backend.disconnect("D1").await.unwrap();
        assert!(!backend.is_connected("D1").await);
    }

    #[tokio::test]
    async fn test_connect_unknown_device_fails() {
        let backend = MockBackend::new();
        let err = backend.connect("ghost", false).await.unwrap_err();
        match err {
            Error::Ble(inner) => assert_eq!(inner.code, BleErrorCode::DeviceNotFound),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_write_round_trip() {
        let backend = MockBackend::new();
        let peripheral = MockPeripheral::new().with_service("180d").with_characteristic(
            "180d",
            "2a37",
            CharacteristicProperties {
                read: true,
                write: true,
                ..Default::default()
            },
            Some(vec![0x06, 0x48]),
        );
        backend.add_peripheral("D1", peripheral).await;
        backend.connect("D1", false).await.unwrap();

        let service = canonicalize("180d").unwrap();
        let characteristic = canonicalize("2a37").unwrap();
        let value = backend
            .read_characteristic("D1", &service, &characteristic)
            .await
            .unwrap();
        assert_eq!(value, vec![0x06, 0x48]);

        backend
            .write_characteristic("D1", &service, &characteristic, &[0x01], true)
            .await
            .unwrap();
        let writes = backend.writes().await;
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].2, vec![0x01]);
    }

    #[tokio::test]
    async fn test_scripted_dfu_events_are_emitted() {
        let backend = MockBackend::new();
        let mut events = NativeBackend::events(&*backend);
        backend
            .script_dfu(vec![
                DfuEvent::StateChanged(DfuState::Uploading),
                DfuEvent::Completed,
            ])
            .await;

        backend
            .start_dfu(
                "D1",
                &FirmwareSource::application("fw.zip"),
                &DfuOptions::default(),
            )
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let BackendEvent::Dfu { event, .. } = event {
                seen.push(event);
            }
        }
        assert_eq!(seen.len(), 2);
    }
}
