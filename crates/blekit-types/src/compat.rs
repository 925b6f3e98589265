//! Translation between native numeric encodings and compat string encodings.
//!
//! The session's direct surface speaks the native encodings below (numeric
//! codes, entry lists); the compat surface speaks the encodings an
//! established BLE client contract uses (string names, keyed maps). Every
//! mapping in this module is total in both directions: unrecognized input
//! maps to the enumeration's designated default member instead of failing,
//! because these conversions sit on the event path and are driven by data
//! this crate does not control.
//!
//! For every legitimate member `v`, `from_compat_name(compat_name(v)) == v`.
//! The converse does not hold: an unrecognized compat string normalizes to
//! the default member.

use core::fmt;
use std::collections::HashMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::uuid::CanonicalUuid;

/// Either encoding of a compat-surface value.
///
/// The compat contract transports enumerations both as numeric codes and as
/// string names; `normalize` on each enumeration accepts either form and
/// always returns the native member.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum CompatValue {
    /// Numeric code form.
    Code(i64),
    /// String name form.
    Name(String),
}

impl From<i32> for CompatValue {
    fn from(code: i32) -> Self {
        Self::Code(code as i64)
    }
}

impl From<i64> for CompatValue {
    fn from(code: i64) -> Self {
        Self::Code(code)
    }
}

impl From<&str> for CompatValue {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for CompatValue {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

/// State of the Bluetooth adapter.
///
/// The single process-wide value is set by the native collaborator; the
/// session only observes it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(i32)]
pub enum AdapterState {
    /// State is not yet known.
    #[default]
    Unknown = 0,
    /// The adapter is resetting.
    Resetting = 1,
    /// BLE is not supported on this platform.
    Unsupported = 2,
    /// The application is not authorized to use BLE.
    Unauthorized = 3,
    /// The radio is powered off.
    PoweredOff = 4,
    /// The radio is powered on and usable.
    PoweredOn = 5,
}

impl AdapterState {
    /// Every member, in code order.
    pub const ALL: [AdapterState; 6] = [
        AdapterState::Unknown,
        AdapterState::Resetting,
        AdapterState::Unsupported,
        AdapterState::Unauthorized,
        AdapterState::PoweredOff,
        AdapterState::PoweredOn,
    ];

    /// Convert a native numeric code; unrecognized codes map to `Unknown`.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => AdapterState::Resetting,
            2 => AdapterState::Unsupported,
            3 => AdapterState::Unauthorized,
            4 => AdapterState::PoweredOff,
            5 => AdapterState::PoweredOn,
            _ => AdapterState::Unknown,
        }
    }

    /// The native numeric code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// The compat-surface string name.
    pub fn compat_name(self) -> &'static str {
        match self {
            AdapterState::Unknown => "Unknown",
            AdapterState::Resetting => "Resetting",
            AdapterState::Unsupported => "Unsupported",
            AdapterState::Unauthorized => "Unauthorized",
            AdapterState::PoweredOff => "PoweredOff",
            AdapterState::PoweredOn => "PoweredOn",
        }
    }

    /// Convert a compat string name; unrecognized names map to `Unknown`.
    pub fn from_compat_name(name: &str) -> Self {
        match name {
            "Resetting" => AdapterState::Resetting,
            "Unsupported" => AdapterState::Unsupported,
            "Unauthorized" => AdapterState::Unauthorized,
            "PoweredOff" => AdapterState::PoweredOff,
            "PoweredOn" => AdapterState::PoweredOn,
            _ => AdapterState::Unknown,
        }
    }

    /// Accept either encoding and return the native member.
    pub fn normalize(value: &CompatValue) -> Self {
        match value {
            CompatValue::Code(code) => Self::from_code(*code as i32),
            CompatValue::Name(name) => Self::from_compat_name(name),
        }
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.compat_name())
    }
}

/// Verbosity requested through the compat surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(i32)]
pub enum LogLevel {
    /// Logging disabled.
    #[default]
    None = 0,
    /// Everything, including per-notification chatter.
    Verbose = 1,
    /// Debugging detail.
    Debug = 2,
    /// Lifecycle events.
    Info = 3,
    /// Recoverable problems.
    Warning = 4,
    /// Failures only.
    Error = 5,
}

impl LogLevel {
    /// Every member, in code order.
    pub const ALL: [LogLevel; 6] = [
        LogLevel::None,
        LogLevel::Verbose,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warning,
        LogLevel::Error,
    ];

    /// Convert a native numeric code; unrecognized codes map to `None`.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => LogLevel::Verbose,
            2 => LogLevel::Debug,
            3 => LogLevel::Info,
            4 => LogLevel::Warning,
            5 => LogLevel::Error,
            _ => LogLevel::None,
        }
    }

    /// The native numeric code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// The compat-surface string name.
    pub fn compat_name(self) -> &'static str {
        match self {
            LogLevel::None => "None",
            LogLevel::Verbose => "Verbose",
            LogLevel::Debug => "Debug",
            LogLevel::Info => "Info",
            LogLevel::Warning => "Warning",
            LogLevel::Error => "Error",
        }
    }

    /// Convert a compat string name; unrecognized names map to `None`.
    pub fn from_compat_name(name: &str) -> Self {
        match name {
            "Verbose" => LogLevel::Verbose,
            "Debug" => LogLevel::Debug,
            "Info" => LogLevel::Info,
            "Warning" => LogLevel::Warning,
            "Error" => LogLevel::Error,
            _ => LogLevel::None,
        }
    }

    /// Accept either encoding and return the native member.
    pub fn normalize(value: &CompatValue) -> Self {
        match value {
            CompatValue::Code(code) => Self::from_code(*code as i32),
            CompatValue::Name(name) => Self::from_compat_name(name),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.compat_name())
    }
}

/// How characteristic value changes are delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(i32)]
pub enum SubscriptionType {
    /// Unacknowledged notifications (the common case).
    #[default]
    Notification = 0,
    /// Acknowledged indications.
    Indication = 1,
}

impl SubscriptionType {
    /// Every member, in code order.
    pub const ALL: [SubscriptionType; 2] =
        [SubscriptionType::Notification, SubscriptionType::Indication];

    /// Convert a native numeric code; unrecognized codes map to `Notification`.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => SubscriptionType::Indication,
            _ => SubscriptionType::Notification,
        }
    }

    /// The native numeric code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// The compat-surface string name.
    pub fn compat_name(self) -> &'static str {
        match self {
            SubscriptionType::Notification => "notification",
            SubscriptionType::Indication => "indication",
        }
    }

    /// Convert a compat string name; unrecognized names map to `Notification`.
    pub fn from_compat_name(name: &str) -> Self {
        match name {
            "indication" => SubscriptionType::Indication,
            _ => SubscriptionType::Notification,
        }
    }

    /// Accept either encoding and return the native member.
    pub fn normalize(value: &CompatValue) -> Self {
        match value {
            CompatValue::Code(code) => Self::from_code(*code as i32),
            CompatValue::Name(name) => Self::from_compat_name(name),
        }
    }
}

impl fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.compat_name())
    }
}

/// Platform scan-mode hint carried by the scan filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(i32)]
pub enum ScanMode {
    /// Passive listening on behalf of other scans.
    Opportunistic = -1,
    /// Low duty cycle (the common case).
    #[default]
    LowPower = 0,
    /// Balanced duty cycle.
    Balanced = 1,
    /// Highest duty cycle, fastest discovery.
    LowLatency = 2,
}

impl ScanMode {
    /// Every member, in code order.
    pub const ALL: [ScanMode; 4] = [
        ScanMode::Opportunistic,
        ScanMode::LowPower,
        ScanMode::Balanced,
        ScanMode::LowLatency,
    ];

    /// Convert a native numeric code; unrecognized codes map to `LowPower`.
    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => ScanMode::Opportunistic,
            1 => ScanMode::Balanced,
            2 => ScanMode::LowLatency,
            _ => ScanMode::LowPower,
        }
    }

    /// The native numeric code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// The compat-surface string name.
    pub fn compat_name(self) -> &'static str {
        match self {
            ScanMode::Opportunistic => "opportunistic",
            ScanMode::LowPower => "lowPower",
            ScanMode::Balanced => "balanced",
            ScanMode::LowLatency => "lowLatency",
        }
    }

    /// Convert a compat string name; unrecognized names map to `LowPower`.
    pub fn from_compat_name(name: &str) -> Self {
        match name {
            "opportunistic" => ScanMode::Opportunistic,
            "balanced" => ScanMode::Balanced,
            "lowLatency" => ScanMode::LowLatency,
            _ => ScanMode::LowPower,
        }
    }

    /// Accept either encoding and return the native member.
    pub fn normalize(value: &CompatValue) -> Self {
        match value {
            CompatValue::Code(code) => Self::from_code(*code as i32),
            CompatValue::Name(name) => Self::from_compat_name(name),
        }
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.compat_name())
    }
}

/// Connection priority hint for platforms that support it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(i32)]
pub enum ConnectionPriority {
    /// Balanced interval (the common case).
    #[default]
    Balanced = 0,
    /// Short interval for high throughput.
    High = 1,
    /// Long interval to conserve power.
    LowPower = 2,
}

impl ConnectionPriority {
    /// Every member, in code order.
    pub const ALL: [ConnectionPriority; 3] = [
        ConnectionPriority::Balanced,
        ConnectionPriority::High,
        ConnectionPriority::LowPower,
    ];

    /// Convert a native numeric code; unrecognized codes map to `Balanced`.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => ConnectionPriority::High,
            2 => ConnectionPriority::LowPower,
            _ => ConnectionPriority::Balanced,
        }
    }

    /// The native numeric code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// The compat-surface string name.
    pub fn compat_name(self) -> &'static str {
        match self {
            ConnectionPriority::Balanced => "balanced",
            ConnectionPriority::High => "high",
            ConnectionPriority::LowPower => "lowPower",
        }
    }

    /// Convert a compat string name; unrecognized names map to `Balanced`.
    pub fn from_compat_name(name: &str) -> Self {
        match name {
            "high" => ConnectionPriority::High,
            "lowPower" => ConnectionPriority::LowPower,
            _ => ConnectionPriority::Balanced,
        }
    }

    /// Accept either encoding and return the native member.
    pub fn normalize(value: &CompatValue) -> Self {
        match value {
            CompatValue::Code(code) => Self::from_code(*code as i32),
            CompatValue::Name(name) => Self::from_compat_name(name),
        }
    }
}

impl fmt::Display for ConnectionPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.compat_name())
    }
}

/// One advertised service-data payload, keyed by its service UUID.
///
/// The native surface transports service data as an ordered entry list; the
/// compat surface transports it as a map keyed by UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ServiceDataEntry {
    /// The service the payload belongs to.
    pub uuid: CanonicalUuid,
    /// The raw payload bytes.
    pub data: Vec<u8>,
}

impl ServiceDataEntry {
    /// Create an entry.
    pub fn new(uuid: CanonicalUuid, data: Vec<u8>) -> Self {
        Self { uuid, data }
    }
}

/// Convert an entry list into the compat map shape.
///
/// Returns `None` for empty input: callers of the compat surface depend on
/// absent service data being the empty representation rather than an empty
/// container. Later entries win on a duplicate key.
pub fn service_data_to_map(
    entries: &[ServiceDataEntry],
) -> Option<HashMap<CanonicalUuid, Vec<u8>>> {
    if entries.is_empty() {
        return None;
    }
    Some(
        entries
            .iter()
            .map(|entry| (entry.uuid, entry.data.clone()))
            .collect(),
    )
}

/// Convert a compat map back into the entry-list shape.
///
/// Returns `None` for empty input, mirroring [`service_data_to_map`].
/// Map iteration order is not meaningful; callers comparing results should
/// compare as sets.
pub fn service_data_to_entries(
    map: &HashMap<CanonicalUuid, Vec<u8>>,
) -> Option<Vec<ServiceDataEntry>> {
    if map.is_empty() {
        return None;
    }
    Some(
        map.iter()
            .map(|(uuid, data)| ServiceDataEntry::new(*uuid, data.clone()))
            .collect(),
    )
}

/// Merge two service-data mappings, with right-hand precedence on key
/// collision.
///
/// Used when reconciling successive advertisement sightings of the same
/// device: the newer sighting's payloads win.
pub fn merge_service_data(
    base: Option<&HashMap<CanonicalUuid, Vec<u8>>>,
    overlay: Option<&HashMap<CanonicalUuid, Vec<u8>>>,
) -> Option<HashMap<CanonicalUuid, Vec<u8>>> {
    match (base, overlay) {
        (None, None) => None,
        (Some(base), None) => Some(base.clone()),
        (None, Some(overlay)) => Some(overlay.clone()),
        (Some(base), Some(overlay)) => {
            let mut merged = base.clone();
            merged.extend(overlay.iter().map(|(uuid, data)| (*uuid, data.clone())));
            Some(merged)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;
    use crate::uuid::canonicalize;

    #[test]
    fn test_adapter_state_round_trip() {
        for state in AdapterState::ALL {
            assert_eq!(AdapterState::from_compat_name(state.compat_name()), state);
            assert_eq!(AdapterState::from_code(state.code()), state);
        }
    }

    #[test]
    fn test_log_level_round_trip() {
        for level in LogLevel::ALL {
            assert_eq!(LogLevel::from_compat_name(level.compat_name()), level);
            assert_eq!(LogLevel::from_code(level.code()), level);
        }
    }

    #[test]
    fn test_subscription_type_round_trip() {
        for kind in SubscriptionType::ALL {
            assert_eq!(SubscriptionType::from_compat_name(kind.compat_name()), kind);
            assert_eq!(SubscriptionType::from_code(kind.code()), kind);
        }
    }

    #[test]
    fn test_scan_mode_round_trip() {
        for mode in ScanMode::ALL {
            assert_eq!(ScanMode::from_compat_name(mode.compat_name()), mode);
            assert_eq!(ScanMode::from_code(mode.code()), mode);
        }
    }

    #[test]
    fn test_connection_priority_round_trip() {
        for priority in ConnectionPriority::ALL {
            assert_eq!(
                ConnectionPriority::from_compat_name(priority.compat_name()),
                priority
            );
            assert_eq!(ConnectionPriority::from_code(priority.code()), priority);
        }
    }

    #[test]
    fn test_unrecognized_input_maps_to_default() {
        assert_eq!(AdapterState::from_code(42), AdapterState::Unknown);
        assert_eq!(AdapterState::from_compat_name("Garbage"), AdapterState::Unknown);
        assert_eq!(LogLevel::from_code(-7), LogLevel::None);
        assert_eq!(LogLevel::from_compat_name(""), LogLevel::None);
        assert_eq!(SubscriptionType::from_code(99), SubscriptionType::Notification);
        assert_eq!(ScanMode::from_compat_name("turbo"), ScanMode::LowPower);
        assert_eq!(ConnectionPriority::from_code(17), ConnectionPriority::Balanced);
    }

    #[test]
    fn test_normalize_accepts_both_encodings() {
        assert_eq!(
            AdapterState::normalize(&CompatValue::from(5)),
            AdapterState::PoweredOn
        );
        assert_eq!(
            AdapterState::normalize(&CompatValue::from("PoweredOn")),
            AdapterState::PoweredOn
        );
        assert_eq!(
            SubscriptionType::normalize(&CompatValue::from("indication")),
            SubscriptionType::Indication
        );
        assert_eq!(
            LogLevel::normalize(&CompatValue::from("nonsense")),
            LogLevel::None
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_compat_value_untagged_serde() {
        let code: CompatValue = serde_json::from_str("3").unwrap();
        assert_eq!(code, CompatValue::Code(3));
        let name: CompatValue = serde_json::from_str("\"PoweredOn\"").unwrap();
        assert_eq!(name, CompatValue::Name("PoweredOn".to_string()));
    }

    #[test]
    fn test_service_data_round_trip() {
        let entries = vec![
            ServiceDataEntry::new(canonicalize("180d").unwrap(), vec![1, 2, 3]),
            ServiceDataEntry::new(canonicalize("180f").unwrap(), vec![4]),
        ];
        let map = service_data_to_map(&entries).unwrap();
        assert_eq!(map.len(), 2);

        let back = service_data_to_entries(&map).unwrap();
        let original: HashSet<_> = entries.iter().map(|e| (e.uuid, e.data.clone())).collect();
        let round_tripped: HashSet<_> = back.iter().map(|e| (e.uuid, e.data.clone())).collect();
        assert_eq!(original, round_tripped);
    }

    #[test]
    fn test_empty_service_data_maps_to_none() {
        assert_eq!(service_data_to_map(&[]), None);
        assert_eq!(service_data_to_entries(&HashMap::new()), None);
    }

    #[test]
    fn test_merge_right_hand_precedence() {
        let uuid = canonicalize("180d").unwrap();
        let other = canonicalize("180f").unwrap();
        let base: HashMap<_, _> = [(uuid, vec![1]), (other, vec![2])].into_iter().collect();
        let overlay: HashMap<_, _> = [(uuid, vec![9])].into_iter().collect();

        let merged = merge_service_data(Some(&base), Some(&overlay)).unwrap();
        assert_eq!(merged[&uuid], vec![9]);
        assert_eq!(merged[&other], vec![2]);
    }

    #[test]
    fn test_merge_absent_sides() {
        let uuid = canonicalize("180d").unwrap();
        let map: HashMap<_, _> = [(uuid, vec![1])].into_iter().collect();

        assert_eq!(merge_service_data(None, None), None);
        assert_eq!(merge_service_data(Some(&map), None).unwrap(), map);
        assert_eq!(merge_service_data(None, Some(&map)).unwrap(), map);
    }

    proptest! {
        #[test]
        fn prop_from_code_is_total(code in any::<i32>()) {
            // no panic, and the result round-trips through the compat name
            let state = AdapterState::from_code(code);
            prop_assert_eq!(AdapterState::from_compat_name(state.compat_name()), state);
            let level = LogLevel::from_code(code);
            prop_assert_eq!(LogLevel::from_compat_name(level.compat_name()), level);
            let kind = SubscriptionType::from_code(code);
            prop_assert_eq!(SubscriptionType::from_compat_name(kind.compat_name()), kind);
        }
    }
}
