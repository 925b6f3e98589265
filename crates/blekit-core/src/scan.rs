//! Scan sessions: filters and the sighting stream.
//!
//! At most one scan session is active per [`crate::session::BleSession`] at a
//! time. Starting a scan while one is active joins the existing session
//! without replacing its filter; the radio is only touched on the first
//! start and the final stop.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use blekit_types::{Advertisement, CanonicalUuid, ScanMode, canonicalize_all};

use crate::error::{BleError, Result};
use crate::session::DeviceRecord;

/// Filter applied to scan sightings.
///
/// The service allow-list and scan-mode hint are forwarded to the native
/// collaborator; the RSSI floor and duplicate policy are enforced by the
/// session before sightings reach the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanFilter {
    /// Only deliver devices advertising at least one of these services.
    /// Empty means all devices.
    pub service_uuids: Vec<CanonicalUuid>,
    /// Drop sightings weaker than this, in dBm.
    pub rssi_threshold: Option<i16>,
    /// Deliver repeated sightings of the same device.
    pub allow_duplicates: bool,
    /// Platform scan-mode hint.
    pub scan_mode: ScanMode,
}

impl ScanFilter {
    /// Create an unfiltered scan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a filter from service UUID strings in any accepted encoding.
    pub fn for_services<I, S>(service_uuids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            service_uuids: canonicalize_all(service_uuids)?,
            ..Self::default()
        })
    }

    /// Set the RSSI floor.
    #[must_use]
    pub fn rssi_threshold(mut self, threshold: i16) -> Self {
        self.rssi_threshold = Some(threshold);
        self
    }

    /// Set the duplicate policy.
    #[must_use]
    pub fn allow_duplicates(mut self, allow: bool) -> Self {
        self.allow_duplicates = allow;
        self
    }

    /// Set the platform scan-mode hint.
    #[must_use]
    pub fn scan_mode(mut self, mode: ScanMode) -> Self {
        self.scan_mode = mode;
        self
    }

    /// Whether an advertisement passes the service allow-list and RSSI floor.
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        if let Some(floor) = self.rssi_threshold {
            match advertisement.rssi {
                Some(rssi) if rssi >= floor => {}
                _ => return false,
            }
        }
        if self.service_uuids.is_empty() {
            return true;
        }
        self.service_uuids
            .iter()
            .any(|uuid| advertisement.advertises_service(uuid))
    }
}

/// One delivery on a scan stream.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ScanEvent {
    /// A sighting that passed the filter, folded into the device table.
    Sighting(DeviceRecord),
    /// The scan session was terminated by a native failure.
    Failed(BleError),
}

/// Caller-facing stream of scan events.
///
/// Multiple streams may observe the same scan session; each receives every
/// delivery. The stream ends when the scan stops.
pub struct ScanStream {
    receiver: broadcast::Receiver<ScanEvent>,
}

impl ScanStream {
    pub(crate) fn new(receiver: broadcast::Receiver<ScanEvent>) -> Self {
        Self { receiver }
    }

    /// Receive the next scan event, or `None` once the scan has stopped.
    pub async fn recv(&mut self) -> Option<ScanEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "scan stream lagged; dropping sightings");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl std::fmt::Debug for ScanStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanStream").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use blekit_types::{ServiceDataEntry, canonicalize};

    use super::*;

    fn advertisement(rssi: Option<i16>, services: &[&str]) -> Advertisement {
        Advertisement {
            rssi,
            service_uuids: Some(
                services
                    .iter()
                    .map(|s| canonicalize(s).unwrap())
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = ScanFilter::new();
        assert!(filter.matches(&Advertisement::default()));
        assert!(filter.matches(&advertisement(Some(-90), &["180d"])));
    }

    #[test]
    fn test_service_allow_list() {
        let filter = ScanFilter::for_services(["180d"]).unwrap();
        assert!(filter.matches(&advertisement(None, &["180d"])));
        assert!(!filter.matches(&advertisement(None, &["180f"])));
        assert!(!filter.matches(&Advertisement::default()));
    }

    #[test]
    fn test_service_allow_list_matches_service_data() {
        let filter = ScanFilter::for_services(["fce0"]).unwrap();
        let adv = Advertisement {
            service_data: Some(vec![ServiceDataEntry::new(
                canonicalize("fce0").unwrap(),
                vec![1, 2],
            )]),
            ..Default::default()
        };
        assert!(filter.matches(&adv));
    }

    #[test]
    fn test_rssi_floor() {
        let filter = ScanFilter::new().rssi_threshold(-70);
        assert!(filter.matches(&advertisement(Some(-60), &[])));
        assert!(filter.matches(&advertisement(Some(-70), &[])));
        assert!(!filter.matches(&advertisement(Some(-71), &[])));
        // no reported RSSI cannot clear a floor
        assert!(!filter.matches(&advertisement(None, &[])));
    }

    #[test]
    fn test_for_services_rejects_invalid_uuid() {
        assert!(ScanFilter::for_services(["not-a-uuid"]).is_err());
    }
}
