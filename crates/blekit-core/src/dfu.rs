//! Firmware-update session types.
//!
//! The transfer protocol itself belongs to the native collaborator; this
//! module defines the command inputs and the per-device event stream the
//! session exposes while a transfer is in flight. The session enforces
//! "at most one firmware update per device at a time"; see
//! [`crate::session::BleSession::start_dfu`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use blekit_types::{DfuProgress, DfuState};

use crate::error::{BleError, Error, Result};

/// Kind of firmware image being transferred.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum FirmwareKind {
    /// Application image (the common case).
    #[default]
    Application,
    /// Bootloader image.
    Bootloader,
    /// SoftDevice (protocol stack) image.
    SoftDevice,
}

/// Where the firmware image lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareSource {
    /// File path or URI of the image.
    pub location: String,
    /// Kind of image.
    pub kind: FirmwareKind,
}

impl FirmwareSource {
    /// Create a source for an application image.
    pub fn application(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            kind: FirmwareKind::Application,
        }
    }

    /// Create a source with an explicit kind.
    pub fn new(location: impl Into<String>, kind: FirmwareKind) -> Self {
        Self {
            location: location.into(),
            kind,
        }
    }
}

/// Options forwarded to the native transfer implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DfuOptions {
    /// Packets between receipt notifications; `None` uses the native default.
    pub packet_receipt_interval: Option<u16>,
    /// Transfer retries before giving up.
    pub retries: u32,
    /// Timeout for the transfer's own connection attempts.
    pub connection_timeout: Duration,
}

impl Default for DfuOptions {
    fn default() -> Self {
        Self {
            packet_receipt_interval: None,
            retries: 3,
            connection_timeout: Duration::from_secs(10),
        }
    }
}

/// One delivery on a transfer's event stream.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum DfuEvent {
    /// Transfer progress.
    Progress(DfuProgress),
    /// The transfer state machine advanced.
    StateChanged(DfuState),
    /// The transfer failed.
    Failed(BleError),
    /// The transfer completed successfully.
    Completed,
}

/// Caller-facing handle for one firmware-update transfer.
///
/// The stream closes once the transfer reaches a terminal state.
pub struct DfuHandle {
    device_id: String,
    events: mpsc::UnboundedReceiver<DfuEvent>,
}

impl DfuHandle {
    pub(crate) fn new(device_id: String, events: mpsc::UnboundedReceiver<DfuEvent>) -> Self {
        Self { device_id, events }
    }

    /// The device being updated.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Receive the next transfer event, or `None` once the transfer ended.
    pub async fn recv(&mut self) -> Option<DfuEvent> {
        self.events.recv().await
    }

    /// Drain events until the transfer ends.
    ///
    /// Returns `Ok(())` on completion, the native failure on error, and
    /// [`Error::Cancelled`] if the transfer was aborted or the stream closed
    /// without a terminal event.
    pub async fn wait(&mut self) -> Result<()> {
        while let Some(event) = self.events.recv().await {
            match event {
                DfuEvent::Completed => return Ok(()),
                DfuEvent::StateChanged(DfuState::Completed) => return Ok(()),
                DfuEvent::StateChanged(DfuState::Aborted) => return Err(Error::Cancelled),
                DfuEvent::Failed(err) => return Err(Error::Ble(err)),
                DfuEvent::Progress(_) | DfuEvent::StateChanged(_) => {}
            }
        }
        Err(Error::Cancelled)
    }
}

impl std::fmt::Debug for DfuHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DfuHandle")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let options = DfuOptions::default();
        assert_eq!(options.packet_receipt_interval, None);
        assert_eq!(options.retries, 3);
        assert_eq!(options.connection_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_wait_resolves_on_completion_event() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut handle = DfuHandle::new("D1".to_string(), rx);

        tx.send(DfuEvent::StateChanged(DfuState::Uploading)).unwrap();
        tx.send(DfuEvent::Completed).unwrap();

        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_surfaces_failure() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut handle = DfuHandle::new("D1".to_string(), rx);

        tx.send(DfuEvent::Failed(BleError::new(
            crate::error::BleErrorCode::OperationFailed,
        )))
        .unwrap();

        assert!(matches!(handle.wait().await, Err(Error::Ble(_))));
    }

    #[tokio::test]
    async fn test_wait_treats_closed_stream_as_cancelled() {
        let (tx, rx) = mpsc::unbounded_channel::<DfuEvent>();
        drop(tx);
        let mut handle = DfuHandle::new("D1".to_string(), rx);

        assert!(matches!(handle.wait().await, Err(Error::Cancelled)));
    }
}
