//! Connection/session lifecycle management.
//!
//! [`BleSession`] owns all mutable session state: the device table, the
//! single scan session, per-device disconnect listeners, the one-shot
//! restoration buffer, and the set of in-flight firmware updates. It drives
//! the native collaborator through the [`NativeBackend`] contract and reacts
//! to the collaborator's event stream on a background pump task.
//!
//! Per-device connection state machine: `Disconnected → Connecting →
//! Connected → Disconnecting → Disconnected`. Service discovery is a flag on
//! the connected state, not a separate state: operations that need it fail
//! with [`Error::ServicesNotDiscovered`] when attempted early, and discovery
//! itself is idempotent and re-runnable.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use blekit_types::{
    AdapterState, Advertisement, CharacteristicSnapshot, ConnectionPriority,
    DescriptorSnapshot, DfuState, LogLevel, RestoredPeripheral, ServiceSnapshot, Sighting,
    SubscriptionType, canonicalize,
};

use crate::backend::{BackendEvent, NativeBackend};
use crate::dfu::{DfuEvent, DfuHandle, DfuOptions, FirmwareSource};
use crate::error::{BleError, Error, Result};
use crate::events::{EventDispatcher, SessionEvent};
use crate::scan::{ScanEvent, ScanFilter, ScanStream};
use crate::subscription::{AdapterStateMonitor, CharacteristicMonitor, SubscriptionHandle};

/// MTU every connection starts with before negotiation.
pub const DEFAULT_MTU: u16 = 23;

/// Last-known state for one peripheral.
///
/// Records are created on first sighting or first successful connect and
/// retained across disconnects, so repeated `is_connected` checks stay cheap.
/// They only go away with the session itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Platform-assigned opaque device identifier.
    pub id: String,
    /// Platform-reported device name.
    pub name: Option<String>,
    /// Last-known advertisement snapshot.
    pub advertisement: Advertisement,
    /// Whether the session's bookkeeping marks the device connected.
    pub connected: bool,
    /// Whether service discovery has run on the current connection.
    pub services_discovered: bool,
    /// Negotiated MTU of the current connection.
    pub mtu: u16,
}

impl DeviceRecord {
    /// Create an empty record for an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            advertisement: Advertisement::default(),
            connected: false,
            services_discovered: false,
            mtu: DEFAULT_MTU,
        }
    }

    /// Signal strength of the last sighting, if any.
    pub fn rssi(&self) -> Option<i16> {
        self.advertisement.rssi
    }
}

/// Configuration for a [`BleSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of the session event channel and per-monitor buffers.
    pub event_capacity: usize,
    /// Capacity of the scan stream.
    pub scan_capacity: usize,
    /// Whether connects ask the platform for auto-reconnect semantics.
    pub auto_connect: bool,
    /// Timeout applied to each native connect command.
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_capacity: 100,
            scan_capacity: 64,
            auto_connect: false,
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl SessionConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the event channel capacity.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the scan stream capacity.
    #[must_use]
    pub fn scan_capacity(mut self, capacity: usize) -> Self {
        self.scan_capacity = capacity;
        self
    }

    /// Set the auto-connect flag forwarded to the backend.
    #[must_use]
    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Set the per-connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

struct ScanState {
    active: bool,
    filter: ScanFilter,
    seen: HashSet<String>,
    sender: Option<broadcast::Sender<ScanEvent>>,
}

struct RestoreState {
    buffered: Option<Vec<RestoredPeripheral>>,
    waiter: Option<oneshot::Sender<Vec<RestoredPeripheral>>>,
    delivered: bool,
}

type DisconnectCallback = Arc<dyn Fn(Option<BleError>) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_token: u64,
    disconnect: HashMap<String, Vec<(u64, DisconnectCallback)>>,
}

#[derive(Default)]
struct DfuTracker {
    active: HashSet<String>,
    states: HashMap<String, DfuState>,
    senders: HashMap<String, mpsc::UnboundedSender<DfuEvent>>,
}

/// Removes the in-flight marker for a device when the owning operation ends,
/// including when its future is dropped mid-await.
struct InflightGuard<'a> {
    session: &'a BleSession,
    device_id: String,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.session
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.device_id);
    }
}

/// The session manager.
///
/// Construct with [`BleSession::new`] (requires a tokio runtime: the session
/// spawns a background task that consumes the backend's event stream). Call
/// [`close`](Self::close) when done to stop the pump.
pub struct BleSession {
    backend: Arc<dyn NativeBackend>,
    config: SessionConfig,
    devices: RwLock<HashMap<String, DeviceRecord>>,
    scan: Mutex<ScanState>,
    inflight: StdMutex<HashMap<String, watch::Sender<()>>>,
    listeners: Arc<Mutex<Listeners>>,
    restore: Mutex<RestoreState>,
    dfu: Mutex<DfuTracker>,
    log_level: StdMutex<LogLevel>,
    events: EventDispatcher,
    cancel: CancellationToken,
    pump: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BleSession {
    /// Create a session over the given backend with default configuration.
    pub fn new(backend: Arc<dyn NativeBackend>) -> Arc<Self> {
        Self::with_config(backend, SessionConfig::default())
    }

    /// Create a session with full configuration.
    pub fn with_config(backend: Arc<dyn NativeBackend>, config: SessionConfig) -> Arc<Self> {
        let events = EventDispatcher::new(config.event_capacity);
        let backend_events = backend.events();
        let session = Arc::new(Self {
            backend,
            config,
            devices: RwLock::new(HashMap::new()),
            scan: Mutex::new(ScanState {
                active: false,
                filter: ScanFilter::default(),
                seen: HashSet::new(),
                sender: None,
            }),
            inflight: StdMutex::new(HashMap::new()),
            listeners: Arc::new(Mutex::new(Listeners::default())),
            restore: Mutex::new(RestoreState {
                buffered: None,
                waiter: None,
                delivered: false,
            }),
            dfu: Mutex::new(DfuTracker::default()),
            log_level: StdMutex::new(LogLevel::default()),
            events,
            cancel: CancellationToken::new(),
            pump: StdMutex::new(None),
        });

        let handle = tokio::spawn(Self::run_event_pump(
            Arc::downgrade(&session),
            backend_events,
            session.cancel.clone(),
        ));
        *session
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        session
    }

    /// The event stream of this session.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Stop the event pump. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
            info!("session closed");
        }
    }

    // --- Event pump ---

    async fn run_event_pump(
        session: Weak<BleSession>,
        mut events: broadcast::Receiver<BackendEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        let Some(session) = session.upgrade() else { break };
                        session.handle_backend_event(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "backend event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("event pump stopped");
    }

    async fn handle_backend_event(&self, event: BackendEvent) {
        match event {
            BackendEvent::Sighting(sighting) => self.on_sighting(sighting).await,
            BackendEvent::ScanFailed(error) => self.on_scan_failed(error).await,
            BackendEvent::AdapterStateChanged(state) => {
                debug!(%state, "adapter state changed");
                self.events.send(SessionEvent::AdapterStateChanged { state });
            }
            BackendEvent::DeviceDisconnected { device_id, error } => {
                self.on_unsolicited_disconnect(device_id, error).await;
            }
            BackendEvent::Notification {
                device_id,
                characteristic,
                value,
            } => {
                self.events.send(SessionEvent::CharacteristicValueChanged {
                    device_id,
                    characteristic,
                    value,
                });
            }
            BackendEvent::SessionRestored(restored) => self.on_session_restored(restored).await,
            BackendEvent::Dfu { device_id, event } => self.on_dfu_event(device_id, event).await,
        }
    }

    async fn on_sighting(&self, sighting: Sighting) {
        let record = {
            let mut devices = self.devices.write().await;
            let record = devices
                .entry(sighting.device_id.clone())
                .or_insert_with(|| DeviceRecord::new(&sighting.device_id));
            if sighting.name.is_some() {
                record.name = sighting.name.clone();
            }
            record.advertisement.merge_from(&sighting.advertisement);
            record.clone()
        };

        self.events.send(SessionEvent::DeviceDiscovered {
            device_id: record.id.clone(),
            rssi: record.advertisement.rssi,
        });

        let mut scan = self.scan.lock().await;
        if !scan.active || !scan.filter.matches(&record.advertisement) {
            return;
        }
        if !scan.filter.allow_duplicates && !scan.seen.insert(record.id.clone()) {
            return;
        }
        if let Some(sender) = &scan.sender {
            let _ = sender.send(ScanEvent::Sighting(record));
        }
    }

    async fn on_scan_failed(&self, error: BleError) {
        warn!(%error, "scan terminated by native failure");
        {
            let mut scan = self.scan.lock().await;
            scan.active = false;
            scan.seen.clear();
            if let Some(sender) = scan.sender.take() {
                let _ = sender.send(ScanEvent::Failed(error.clone()));
            }
        }
        self.events.send(SessionEvent::ScanStopped {
            error: Some(error),
        });
    }

    async fn on_unsolicited_disconnect(&self, device_id: String, error: Option<BleError>) {
        // The device leaves the connected set before any listener runs, so a
        // listener that checks `is_connected` observes the post-disconnect
        // state.
        {
            let mut devices = self.devices.write().await;
            if let Some(record) = devices.get_mut(&device_id) {
                record.connected = false;
                record.services_discovered = false;
                record.mtu = DEFAULT_MTU;
            }
        }
        info!(device_id = %device_id, interrupted = error.is_some(), "device disconnected");

        let callbacks: Vec<DisconnectCallback> = {
            let listeners = self.listeners.lock().await;
            listeners
                .disconnect
                .get(&device_id)
                .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default()
        };
        for callback in callbacks {
            callback(error.clone());
        }

        self.events
            .send(SessionEvent::Disconnected { device_id, error });
    }

    async fn on_session_restored(&self, restored: Vec<RestoredPeripheral>) {
        {
            let mut devices = self.devices.write().await;
            for peripheral in &restored {
                let record = devices
                    .entry(peripheral.device_id.clone())
                    .or_insert_with(|| DeviceRecord::new(&peripheral.device_id));
                record.connected = peripheral.connected;
                if peripheral.name.is_some() {
                    record.name = peripheral.name.clone();
                }
            }
        }
        info!(count = restored.len(), "restored backgrounded session");

        let mut restore = self.restore.lock().await;
        if let Some(waiter) = restore.waiter.take() {
            restore.delivered = true;
            let _ = waiter.send(restored);
        } else {
            restore.buffered = Some(restored);
            restore.delivered = false;
        }
    }

    async fn on_dfu_event(&self, device_id: String, event: DfuEvent) {
        let mut dfu = self.dfu.lock().await;
        let terminal = match &event {
            DfuEvent::StateChanged(state) => {
                dfu.states.insert(device_id.clone(), *state);
                state.is_terminal()
            }
            DfuEvent::Completed => {
                dfu.states.insert(device_id.clone(), DfuState::Completed);
                true
            }
            DfuEvent::Failed(_) => {
                dfu.states.insert(device_id.clone(), DfuState::Error);
                true
            }
            DfuEvent::Progress(_) => false,
        };
        if let Some(sender) = dfu.senders.get(&device_id) {
            let _ = sender.send(event);
        }
        if terminal {
            // Both the state-change path and the completion path converge
            // here: the device always leaves the active set.
            dfu.active.remove(&device_id);
            dfu.senders.remove(&device_id);
            info!(device_id = %device_id, "firmware update finished");
        }
    }

    // --- Adapter ---

    /// Current adapter state.
    pub async fn state(&self) -> AdapterState {
        self.backend.adapter_state().await
    }

    /// Subscribe to adapter state changes.
    pub fn monitor_adapter_state(&self) -> AdapterStateMonitor {
        let mut events = self.backend.events();
        let (tx, rx) = mpsc::channel(self.config.event_capacity);
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(BackendEvent::AdapterStateChanged(state)) => {
                        if tx.send(state).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        let handle = SubscriptionHandle::new(move || async move {
            task.abort();
        });
        AdapterStateMonitor::new(rx, handle)
    }

    /// Ask the platform to enable Bluetooth.
    pub async fn request_bluetooth_enable(&self) -> Result<()> {
        self.backend.request_enable().await
    }

    /// Open the platform Bluetooth settings.
    pub async fn open_settings(&self) -> Result<()> {
        self.backend.open_settings().await
    }

    /// Set the requested log verbosity.
    pub fn set_log_level(&self, level: LogLevel) {
        info!(level = %level, "log level set");
        *self
            .log_level
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = level;
    }

    /// The requested log verbosity.
    pub fn log_level(&self) -> LogLevel {
        *self
            .log_level
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- Scanning ---

    /// Start a scan session, or join the one already active.
    ///
    /// When a scan is already active this is a no-op on the radio and the
    /// active filter is kept; the returned stream observes the existing
    /// session.
    pub async fn start_scan(&self, filter: ScanFilter) -> Result<ScanStream> {
        let mut scan = self.scan.lock().await;
        if scan.active {
            debug!("scan already active; keeping existing filter");
            let sender = scan
                .sender
                .get_or_insert_with(|| broadcast::channel(self.config.scan_capacity).0);
            return Ok(ScanStream::new(sender.subscribe()));
        }

        self.backend.start_scan(&filter).await?;
        let (sender, receiver) = broadcast::channel(self.config.scan_capacity);
        scan.active = true;
        scan.filter = filter;
        scan.seen.clear();
        scan.sender = Some(sender);
        info!("scan started");
        Ok(ScanStream::new(receiver))
    }

    /// Stop the active scan session. A no-op when no scan is active.
    pub async fn stop_scan(&self) -> Result<()> {
        {
            let mut scan = self.scan.lock().await;
            if !scan.active {
                return Ok(());
            }
            self.backend.stop_scan().await?;
            scan.active = false;
            scan.seen.clear();
            scan.sender = None;
        }
        self.events.send(SessionEvent::ScanStopped { error: None });
        info!("scan stopped");
        Ok(())
    }

    /// Whether a scan session is active.
    pub async fn is_scanning(&self) -> bool {
        self.scan.lock().await.active
    }

    // --- Connections ---

    /// Connect to a device.
    ///
    /// Idempotent: when the bookkeeping already marks the device connected,
    /// this succeeds immediately without issuing a native command. Two
    /// concurrent connects for the same device issue at most one native
    /// command; the second observes the outcome of the first.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn connect(&self, device_id: &str) -> Result<()> {
        self.connect_with(device_id, self.config.auto_connect).await
    }

    /// Connect with an explicit auto-connect flag.
    pub async fn connect_with(&self, device_id: &str, auto_connect: bool) -> Result<()> {
        loop {
            if self.is_connected(device_id).await {
                debug!(device_id, "already connected; connect is a no-op");
                return Ok(());
            }
            match self.claim_inflight(device_id) {
                None => break,
                Some(mut done) => {
                    // another operation owns this device; observe its outcome
                    let _ = done.changed().await;
                }
            }
        }
        let _guard = InflightGuard {
            session: self,
            device_id: device_id.to_string(),
        };

        let result = timeout(
            self.config.connect_timeout,
            self.backend.connect(device_id, auto_connect),
        )
        .await
        .map_err(|_| Error::timeout("connect", self.config.connect_timeout))
        .and_then(|inner| inner);

        match result {
            Ok(()) => {
                let mut devices = self.devices.write().await;
                let record = devices
                    .entry(device_id.to_string())
                    .or_insert_with(|| DeviceRecord::new(device_id));
                record.connected = true;
                drop(devices);
                info!(device_id, "connected");
                self.events.send(SessionEvent::Connected {
                    device_id: device_id.to_string(),
                });
                Ok(())
            }
            Err(err) => {
                warn!(device_id, error = %err, "connect failed");
                Err(err)
            }
        }
    }

    /// Connect and register a disconnect listener in one step.
    ///
    /// The listener fires once per unsolicited disconnect of the device,
    /// after the device has left the connected set. On connect failure the
    /// registration is released before the error is returned.
    pub async fn connect_with_listener<F>(
        &self,
        device_id: &str,
        on_disconnected: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(Option<BleError>) + Send + Sync + 'static,
    {
        let handle = self.on_disconnected(device_id, on_disconnected).await;
        match self.connect(device_id).await {
            Ok(()) => Ok(handle),
            Err(err) => {
                handle.release().await;
                Err(err)
            }
        }
    }

    /// Register a disconnect listener for a device.
    pub async fn on_disconnected<F>(&self, device_id: &str, listener: F) -> SubscriptionHandle
    where
        F: Fn(Option<BleError>) + Send + Sync + 'static,
    {
        let token = {
            let mut listeners = self.listeners.lock().await;
            let token = listeners.next_token;
            listeners.next_token += 1;
            listeners
                .disconnect
                .entry(device_id.to_string())
                .or_default()
                .push((token, Arc::new(listener)));
            token
        };

        let listeners = Arc::clone(&self.listeners);
        let device_id = device_id.to_string();
        SubscriptionHandle::new(move || async move {
            let mut listeners = listeners.lock().await;
            if let Some(entries) = listeners.disconnect.get_mut(&device_id) {
                entries.retain(|(entry_token, _)| *entry_token != token);
                if entries.is_empty() {
                    listeners.disconnect.remove(&device_id);
                }
            }
        })
    }

    /// Disconnect from a device.
    ///
    /// Idempotent: succeeds immediately when the bookkeeping already marks
    /// the device disconnected.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn disconnect(&self, device_id: &str) -> Result<()> {
        loop {
            if !self.is_connected(device_id).await {
                debug!(device_id, "not connected; disconnect is a no-op");
                return Ok(());
            }
            match self.claim_inflight(device_id) {
                None => break,
                Some(mut done) => {
                    let _ = done.changed().await;
                }
            }
        }
        let _guard = InflightGuard {
            session: self,
            device_id: device_id.to_string(),
        };

        self.backend.disconnect(device_id).await?;
        {
            let mut devices = self.devices.write().await;
            if let Some(record) = devices.get_mut(device_id) {
                record.connected = false;
                record.services_discovered = false;
                record.mtu = DEFAULT_MTU;
            }
        }
        info!(device_id, "disconnected");
        self.events.send(SessionEvent::Disconnected {
            device_id: device_id.to_string(),
            error: None,
        });
        Ok(())
    }

    /// Claim the in-flight slot for a device.
    ///
    /// Returns `None` when the slot was claimed, or a receiver that resolves
    /// when the current owner finishes.
    fn claim_inflight(&self, device_id: &str) -> Option<watch::Receiver<()>> {
        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match inflight.get(device_id) {
            Some(owner) => Some(owner.subscribe()),
            None => {
                let (sender, _) = watch::channel(());
                inflight.insert(device_id.to_string(), sender);
                None
            }
        }
    }

    /// Whether the session's bookkeeping marks the device connected.
    pub async fn is_connected(&self, device_id: &str) -> bool {
        self.devices
            .read()
            .await
            .get(device_id)
            .map(|record| record.connected)
            .unwrap_or(false)
    }

    /// Non-blocking connectivity check for synchronous callers, such as
    /// disconnect listeners. Returns `None` when the device table is busy.
    pub fn try_is_connected(&self, device_id: &str) -> Option<bool> {
        match self.devices.try_read() {
            Ok(devices) => Some(
                devices
                    .get(device_id)
                    .map(|record| record.connected)
                    .unwrap_or(false),
            ),
            Err(_) => None,
        }
    }

    /// Scan for a device and connect to it, racing a deadline.
    ///
    /// Short-circuits when already connected. Otherwise any active scan is
    /// superseded by a fresh one; the first sighting of the target stops the
    /// scan and proceeds to connect, and an elapsed deadline stops the scan
    /// and fails with [`Error::ScanTimeout`]. Exactly one of the two outcomes
    /// resolves the call; the loser's late events land on a closed stream.
    #[tracing::instrument(level = "info", skip(self), fields(timeout_ms = deadline.as_millis() as u64))]
    pub async fn find_and_connect(&self, device_id: &str, deadline: Duration) -> Result<()> {
        if self.is_connected(device_id).await {
            debug!(device_id, "already connected; skipping scan");
            return Ok(());
        }

        // the radio is needed for a fresh scan
        self.stop_scan().await?;
        let mut stream = self.start_scan(ScanFilter::default()).await?;

        let timer = sleep(deadline);
        tokio::pin!(timer);
        let found = loop {
            tokio::select! {
                _ = &mut timer => break false,
                event = stream.recv() => match event {
                    Some(ScanEvent::Sighting(record)) if record.id == device_id => break true,
                    Some(ScanEvent::Sighting(_)) => continue,
                    Some(ScanEvent::Failed(error)) => return Err(Error::Ble(error)),
                    None => break false,
                },
            }
        };
        drop(stream);
        self.stop_scan().await?;

        if found {
            self.connect(device_id).await
        } else {
            warn!(device_id, "scan deadline elapsed without a sighting");
            Err(Error::scan_timeout(device_id, deadline))
        }
    }

    // --- Device table ---

    /// Snapshot of one device record.
    pub async fn device(&self, device_id: &str) -> Option<DeviceRecord> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// Snapshot of all device records.
    pub async fn devices(&self) -> Vec<DeviceRecord> {
        self.devices.read().await.values().cloned().collect()
    }

    /// Snapshot of the named device records, skipping unknown identifiers.
    pub async fn known_devices(&self, device_ids: &[&str]) -> Vec<DeviceRecord> {
        let devices = self.devices.read().await;
        device_ids
            .iter()
            .filter_map(|id| devices.get(*id).cloned())
            .collect()
    }

    /// Connected devices, optionally restricted to those advertising one of
    /// the given services.
    pub async fn connected_devices(&self, service_uuids: &[&str]) -> Result<Vec<DeviceRecord>> {
        let filter = blekit_types::canonicalize_all(service_uuids)?;
        let devices = self.devices.read().await;
        Ok(devices
            .values()
            .filter(|record| {
                record.connected
                    && (filter.is_empty()
                        || filter
                            .iter()
                            .any(|uuid| record.advertisement.advertises_service(uuid)))
            })
            .cloned()
            .collect())
    }

    // --- GATT ---

    async fn require_connected(&self, device_id: &str) -> Result<()> {
        if self.is_connected(device_id).await {
            Ok(())
        } else {
            Err(Error::not_connected(device_id))
        }
    }

    async fn require_discovered(&self, device_id: &str) -> Result<()> {
        let devices = self.devices.read().await;
        match devices.get(device_id) {
            Some(record) if !record.connected => Err(Error::not_connected(device_id)),
            Some(record) if record.services_discovered => Ok(()),
            Some(_) => Err(Error::services_not_discovered(device_id)),
            None => Err(Error::not_connected(device_id)),
        }
    }

    /// Run service discovery on a connected device. Idempotent.
    pub async fn discover_services(&self, device_id: &str) -> Result<()> {
        self.require_connected(device_id).await?;
        self.backend.discover_services(device_id).await?;
        if let Some(record) = self.devices.write().await.get_mut(device_id) {
            record.services_discovered = true;
        }
        debug!(device_id, "services discovered");
        Ok(())
    }

    /// Discovered services of a device.
    pub async fn services(&self, device_id: &str) -> Result<Vec<ServiceSnapshot>> {
        self.require_discovered(device_id).await?;
        self.backend.services(device_id).await
    }

    /// Discovered characteristics of one service.
    pub async fn characteristics(
        &self,
        device_id: &str,
        service: &str,
    ) -> Result<Vec<CharacteristicSnapshot>> {
        let service = canonicalize(service)?;
        self.require_discovered(device_id).await?;
        self.backend.characteristics(device_id, &service).await
    }

    /// Discovered descriptors of one characteristic.
    pub async fn descriptors(
        &self,
        device_id: &str,
        service: &str,
        characteristic: &str,
    ) -> Result<Vec<DescriptorSnapshot>> {
        let service = canonicalize(service)?;
        let characteristic = canonicalize(characteristic)?;
        self.require_discovered(device_id).await?;
        self.backend
            .descriptors(device_id, &service, &characteristic)
            .await
    }

    /// Read a characteristic value.
    pub async fn read_characteristic(
        &self,
        device_id: &str,
        service: &str,
        characteristic: &str,
    ) -> Result<Vec<u8>> {
        let service = canonicalize(service)?;
        let characteristic = canonicalize(characteristic)?;
        self.require_discovered(device_id).await?;
        self.backend
            .read_characteristic(device_id, &service, &characteristic)
            .await
    }

    /// Write a characteristic value.
    pub async fn write_characteristic(
        &self,
        device_id: &str,
        service: &str,
        characteristic: &str,
        value: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let service = canonicalize(service)?;
        let characteristic = canonicalize(characteristic)?;
        self.require_discovered(device_id).await?;
        self.backend
            .write_characteristic(device_id, &service, &characteristic, value, with_response)
            .await
    }

    /// Read a descriptor value.
    pub async fn read_descriptor(
        &self,
        device_id: &str,
        service: &str,
        characteristic: &str,
        descriptor: &str,
    ) -> Result<Vec<u8>> {
        let service = canonicalize(service)?;
        let characteristic = canonicalize(characteristic)?;
        let descriptor = canonicalize(descriptor)?;
        self.require_discovered(device_id).await?;
        self.backend
            .read_descriptor(device_id, &service, &characteristic, &descriptor)
            .await
    }

    /// Write a descriptor value.
    pub async fn write_descriptor(
        &self,
        device_id: &str,
        service: &str,
        characteristic: &str,
        descriptor: &str,
        value: &[u8],
    ) -> Result<()> {
        let service = canonicalize(service)?;
        let characteristic = canonicalize(characteristic)?;
        let descriptor = canonicalize(descriptor)?;
        self.require_discovered(device_id).await?;
        self.backend
            .write_descriptor(device_id, &service, &characteristic, &descriptor, value)
            .await
    }

    /// Negotiate the connection MTU; returns and records the negotiated
    /// value.
    pub async fn request_mtu(&self, device_id: &str, mtu: u16) -> Result<u16> {
        self.require_connected(device_id).await?;
        let negotiated = self.backend.request_mtu(device_id, mtu).await?;
        if let Some(record) = self.devices.write().await.get_mut(device_id) {
            record.mtu = negotiated;
        }
        Ok(negotiated)
    }

    /// Read the connection RSSI and fold it into the device record.
    pub async fn read_rssi(&self, device_id: &str) -> Result<i16> {
        self.require_connected(device_id).await?;
        let rssi = self.backend.read_rssi(device_id).await?;
        if let Some(record) = self.devices.write().await.get_mut(device_id) {
            record.advertisement.rssi = Some(rssi);
        }
        Ok(rssi)
    }

    /// Hint the platform about the desired connection priority.
    pub async fn request_connection_priority(
        &self,
        device_id: &str,
        priority: ConnectionPriority,
    ) -> Result<()> {
        self.require_connected(device_id).await?;
        self.backend
            .request_connection_priority(device_id, priority)
            .await
    }

    // --- Subscriptions ---

    /// Subscribe to value changes of a characteristic.
    ///
    /// Fails with [`Error::NotConnected`] when the device has no active
    /// connection. Releasing the returned monitor performs the corresponding
    /// native unsubscribe; a failure of that best-effort unsubscribe is
    /// logged, never propagated.
    pub async fn subscribe_to_characteristic(
        &self,
        device_id: &str,
        service: &str,
        characteristic: &str,
        kind: SubscriptionType,
    ) -> Result<CharacteristicMonitor> {
        let service = canonicalize(service)?;
        let characteristic = canonicalize(characteristic)?;
        self.require_discovered(device_id).await?;
        self.backend
            .subscribe(device_id, &service, &characteristic, kind)
            .await?;

        let mut events = self.backend.events();
        let (tx, rx) = mpsc::channel(self.config.event_capacity);
        let filter_id = device_id.to_string();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(BackendEvent::Notification {
                        device_id,
                        characteristic: changed,
                        value,
                    }) if device_id == filter_id && changed == characteristic => {
                        if tx.send(value).await.is_err() {
                            break;
                        }
                    }
                    Ok(BackendEvent::DeviceDisconnected { device_id, .. })
                        if device_id == filter_id =>
                    {
                        // the subscription dies with the connection
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "notification stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let backend = Arc::clone(&self.backend);
        let release_id = device_id.to_string();
        let handle = SubscriptionHandle::new(move || async move {
            task.abort();
            if let Err(err) = backend
                .unsubscribe(&release_id, &service, &characteristic)
                .await
            {
                warn!(device_id = %release_id, error = %err, "best-effort unsubscribe failed");
            }
        });

        Ok(CharacteristicMonitor::new(
            device_id.to_string(),
            characteristic,
            rx,
            handle,
        ))
    }

    /// Explicitly unsubscribe from a characteristic.
    ///
    /// Unlike releasing a monitor, a failure here is propagated.
    pub async fn unsubscribe_from_characteristic(
        &self,
        device_id: &str,
        service: &str,
        characteristic: &str,
    ) -> Result<()> {
        let service = canonicalize(service)?;
        let characteristic = canonicalize(characteristic)?;
        self.require_connected(device_id).await?;
        self.backend
            .unsubscribe(device_id, &service, &characteristic)
            .await
    }

    // --- Restoration ---

    /// Register for the one-shot restoration result.
    ///
    /// If the platform already reported a restored session and nobody
    /// consumed it, the receiver resolves immediately with the buffered set.
    /// Otherwise it resolves when (and if) restoration is reported. Each
    /// restoration event is delivered to exactly one registrant; a second
    /// registration receives nothing unless a new restoration event occurs.
    pub async fn watch_restoration(&self) -> oneshot::Receiver<Vec<RestoredPeripheral>> {
        let (tx, rx) = oneshot::channel();
        let mut restore = self.restore.lock().await;
        if let Some(buffered) = restore.buffered.take() {
            restore.delivered = true;
            let _ = tx.send(buffered);
        } else if restore.waiter.is_none() && !restore.delivered {
            restore.waiter = Some(tx);
        }
        // Already delivered, or another waiter is pending: the sender drops
        // here and the receiver resolves with an error.
        rx
    }

    // --- DFU ---

    /// Begin a firmware-update transfer for a device.
    ///
    /// Fails with [`Error::DfuInProgress`] before any native command when a
    /// transfer for the device is already in flight.
    #[tracing::instrument(level = "info", skip(self, firmware, options))]
    pub async fn start_dfu(
        &self,
        device_id: &str,
        firmware: FirmwareSource,
        options: DfuOptions,
    ) -> Result<DfuHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut dfu = self.dfu.lock().await;
            if dfu.active.contains(device_id) {
                return Err(Error::dfu_in_progress(device_id));
            }
            dfu.active.insert(device_id.to_string());
            dfu.states.insert(device_id.to_string(), DfuState::Starting);
            dfu.senders.insert(device_id.to_string(), tx);
        }

        if let Err(err) = self.backend.start_dfu(device_id, &firmware, &options).await {
            let mut dfu = self.dfu.lock().await;
            dfu.active.remove(device_id);
            dfu.senders.remove(device_id);
            dfu.states.insert(device_id.to_string(), DfuState::Error);
            return Err(err);
        }
        info!(device_id, "firmware update started");
        Ok(DfuHandle::new(device_id.to_string(), rx))
    }

    /// Pause a running transfer. Returns whether a transfer was paused.
    pub async fn pause_dfu(&self, device_id: &str) -> bool {
        self.backend.pause_dfu(device_id).await
    }

    /// Resume a paused transfer. Returns whether a transfer was resumed.
    pub async fn resume_dfu(&self, device_id: &str) -> bool {
        self.backend.resume_dfu(device_id).await
    }

    /// Abort a transfer. Returns whether a transfer was aborted.
    pub async fn abort_dfu(&self, device_id: &str) -> bool {
        self.backend.abort_dfu(device_id).await
    }

    /// Whether a transfer is in flight for the device.
    pub async fn is_dfu_in_progress(&self, device_id: &str) -> bool {
        self.dfu.lock().await.active.contains(device_id)
    }

    /// Last known transfer state for the device.
    pub async fn dfu_state(&self, device_id: &str) -> DfuState {
        self.dfu
            .lock()
            .await
            .states
            .get(device_id)
            .copied()
            .unwrap_or(DfuState::Idle)
    }
}

impl Drop for BleSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for BleSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleSession")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::mock::{MockBackend, MockPeripheral};

    /// Let the event pump drain anything already broadcast.
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn heart_rate_sighting(device_id: &str) -> Sighting {
        Sighting {
            device_id: device_id.to_string(),
            name: Some("Polar H10".to_string()),
            advertisement: Advertisement {
                rssi: Some(-60),
                service_uuids: Some(vec![canonicalize("180d").unwrap()]),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let backend = MockBackend::new();
        backend.add_peripheral("D1", MockPeripheral::new()).await;
        let session = BleSession::new(backend.clone());

        session.connect("D1").await.unwrap();
        session.connect("D1").await.unwrap();

        assert!(session.is_connected("D1").await);
        assert_eq!(backend.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_when_not_connected_is_a_noop() {
        let backend = MockBackend::new();
        let session = BleSession::new(backend.clone());

        session.disconnect("D1").await.unwrap();

        assert_eq!(backend.disconnect_calls(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_device_unmarked() {
        let backend = MockBackend::new();
        let session = BleSession::new(backend.clone());

        // no peripheral registered: the mock reports DeviceNotFound
        assert!(session.connect("D1").await.is_err());
        assert!(!session.is_connected("D1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_issue_one_native_command() {
        let backend = MockBackend::new();
        backend.add_peripheral("D1", MockPeripheral::new()).await;
        backend.set_connect_latency(Duration::from_millis(50)).await;
        let session = BleSession::new(backend.clone());

        let first = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.connect("D1").await })
        };
        let second = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.connect("D1").await })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(backend.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_unsolicited_disconnect_removes_before_listener_runs() {
        let backend = MockBackend::new();
        backend.add_peripheral("D1", MockPeripheral::new()).await;
        let session = BleSession::new(backend.clone());

        let observed_connected = Arc::new(AtomicBool::new(true));
        let observed = Arc::clone(&observed_connected);
        let probe = Arc::clone(&session);
        let _handle = session
            .connect_with_listener("D1", move |_| {
                observed.store(
                    probe.try_is_connected("D1").unwrap_or(true),
                    Ordering::SeqCst,
                );
            })
            .await
            .unwrap();
        assert!(session.is_connected("D1").await);

        backend.emit_disconnect("D1", None).await;
        settle().await;

        assert!(!session.is_connected("D1").await);
        assert!(!observed_connected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_released_disconnect_listener_does_not_fire() {
        let backend = MockBackend::new();
        backend.add_peripheral("D1", MockPeripheral::new()).await;
        let session = BleSession::new(backend.clone());

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let handle = session
            .connect_with_listener("D1", move |_| {
                flag.store(true, Ordering::SeqCst);
            })
            .await
            .unwrap();

        handle.release().await;
        backend.emit_disconnect("D1", None).await;
        settle().await;

        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_scan_delivers_matching_sightings() {
        let backend = MockBackend::new();
        let session = BleSession::new(backend.clone());

        let filter = ScanFilter::for_services(["180d"])
            .unwrap()
            .rssi_threshold(-100);
        let mut stream = session.start_scan(filter).await.unwrap();

        backend.emit_sighting(heart_rate_sighting("D1"));
        settle().await;

        match stream.recv().await.unwrap() {
            ScanEvent::Sighting(record) => {
                assert_eq!(record.id, "D1");
                assert_eq!(record.name.as_deref(), Some("Polar H10"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(session.device("D1").await.is_some());
    }

    #[tokio::test]
    async fn test_scan_filters_by_rssi_floor() {
        let backend = MockBackend::new();
        let session = BleSession::new(backend.clone());

        let filter = ScanFilter::new().rssi_threshold(-50);
        let _stream = session.start_scan(filter).await.unwrap();

        backend.emit_sighting(heart_rate_sighting("D1")); // -60 dBm
        settle().await;

        // folded into the table, but not delivered to the stream
        assert!(session.device("D1").await.is_some());
        let scan = session.scan.lock().await;
        assert!(scan.seen.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_sightings_suppressed_by_default() {
        let backend = MockBackend::new();
        let session = BleSession::new(backend.clone());

        let mut stream = session.start_scan(ScanFilter::default()).await.unwrap();

        backend.emit_sighting(heart_rate_sighting("D1"));
        backend.emit_sighting(heart_rate_sighting("D1"));
        settle().await;

        assert!(matches!(
            stream.recv().await,
            Some(ScanEvent::Sighting(_))
        ));
        session.stop_scan().await.unwrap();
        // stream ends without a second sighting
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_start_scan_is_noop_when_active() {
        let backend = MockBackend::new();
        let session = BleSession::new(backend.clone());

        let filter = ScanFilter::for_services(["180d"]).unwrap();
        let _first = session.start_scan(filter.clone()).await.unwrap();
        let _second = session.start_scan(ScanFilter::default()).await.unwrap();

        assert_eq!(backend.scan_starts(), 1);
        let scan = session.scan.lock().await;
        assert_eq!(scan.filter, filter, "active filter must not be replaced");
    }

    #[tokio::test]
    async fn test_scan_error_terminates_session() {
        let backend = MockBackend::new();
        let session = BleSession::new(backend.clone());

        let mut stream = session.start_scan(ScanFilter::default()).await.unwrap();
        backend.emit_scan_failure(BleError::new(crate::error::BleErrorCode::ScanStartFailed));
        settle().await;

        assert!(matches!(stream.recv().await, Some(ScanEvent::Failed(_))));
        assert!(stream.recv().await.is_none());
        assert!(!session.is_scanning().await);
    }

    #[tokio::test]
    async fn test_gatt_requires_connection_and_discovery() {
        let backend = MockBackend::new();
        backend.add_peripheral("D1", MockPeripheral::new()).await;
        let session = BleSession::new(backend.clone());

        assert!(matches!(
            session.services("D1").await,
            Err(Error::NotConnected { .. })
        ));

        session.connect("D1").await.unwrap();
        assert!(matches!(
            session.services("D1").await,
            Err(Error::ServicesNotDiscovered { .. })
        ));

        session.discover_services("D1").await.unwrap();
        assert!(session.services("D1").await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_uuid_is_reported_before_native_calls() {
        let backend = MockBackend::new();
        backend.add_peripheral("D1", MockPeripheral::new()).await;
        let session = BleSession::new(backend.clone());
        session.connect("D1").await.unwrap();
        session.discover_services("D1").await.unwrap();

        assert!(matches!(
            session.read_characteristic("D1", "bogus", "2a37").await,
            Err(Error::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_restoration_buffers_for_one_late_registrant() {
        let backend = MockBackend::new();
        let session = BleSession::new(backend.clone());

        backend.emit_restoration(vec![RestoredPeripheral {
            device_id: "D1".to_string(),
            name: None,
            connected: true,
        }]);
        settle().await;

        // the restored device is folded into the connected set first
        assert!(session.is_connected("D1").await);

        let restored = session.watch_restoration().await.await.unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].device_id, "D1");

        // a second registration receives nothing
        assert!(session.watch_restoration().await.await.is_err());
    }

    #[tokio::test]
    async fn test_restoration_delivers_to_registered_waiter() {
        let backend = MockBackend::new();
        let session = BleSession::new(backend.clone());

        let receiver = session.watch_restoration().await;
        backend.emit_restoration(vec![RestoredPeripheral {
            device_id: "D2".to_string(),
            name: Some("Lamp".to_string()),
            connected: false,
        }]);
        settle().await;

        let restored = receiver.await.unwrap();
        assert_eq!(restored[0].device_id, "D2");
        assert!(!session.is_connected("D2").await);
    }

    #[tokio::test]
    async fn test_request_mtu_updates_record() {
        let backend = MockBackend::new();
        backend.add_peripheral("D1", MockPeripheral::new()).await;
        let session = BleSession::new(backend.clone());
        session.connect("D1").await.unwrap();

        let negotiated = session.request_mtu("D1", 185).await.unwrap();
        assert_eq!(negotiated, 185);
        assert_eq!(session.device("D1").await.unwrap().mtu, 185);

        session.disconnect("D1").await.unwrap();
        assert_eq!(session.device("D1").await.unwrap().mtu, DEFAULT_MTU);
    }

    #[tokio::test]
    async fn test_close_stops_pump() {
        let backend = MockBackend::new();
        let session = BleSession::new(backend.clone());
        session.close().await;

        backend.emit_sighting(heart_rate_sighting("D1"));
        settle().await;
        assert!(session.device("D1").await.is_none());
    }
}
