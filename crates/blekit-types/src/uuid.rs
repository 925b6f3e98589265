//! GATT identifier canonicalization.
//!
//! Peripherals, platforms, and application code spell the same GATT attribute
//! in three encodings: 16-bit ("180d"), 32-bit ("0000180d"), and full 128-bit
//! form. Every identifier that enters the session goes through
//! [`canonicalize`] first, so that equality is only ever decided on the
//! 128-bit lowercase dashed form.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use uuid::{Uuid, uuid};

use crate::error::IdentifierError;

/// Tail shared by every 16- and 32-bit Bluetooth SIG identifier,
/// including the leading group separator.
pub const BLUETOOTH_BASE_TAIL: &str = "-0000-1000-8000-00805f9b34fb";

// --- Standard BLE Service UUIDs ---

/// Generic Access Profile (GAP) service.
pub const GAP_SERVICE: Uuid = uuid!("00001800-0000-1000-8000-00805f9b34fb");

/// Device Information service.
pub const DEVICE_INFO_SERVICE: Uuid = uuid!("0000180a-0000-1000-8000-00805f9b34fb");

/// Heart Rate service.
pub const HEART_RATE_SERVICE: Uuid = uuid!("0000180d-0000-1000-8000-00805f9b34fb");

/// Battery service.
pub const BATTERY_SERVICE: Uuid = uuid!("0000180f-0000-1000-8000-00805f9b34fb");

// --- Standard BLE Characteristic UUIDs ---

/// Heart Rate Measurement characteristic.
pub const HEART_RATE_MEASUREMENT: Uuid = uuid!("00002a37-0000-1000-8000-00805f9b34fb");

/// Battery level characteristic.
pub const BATTERY_LEVEL: Uuid = uuid!("00002a19-0000-1000-8000-00805f9b34fb");

// --- Standard BLE Descriptor UUIDs ---

/// Client Characteristic Configuration descriptor (CCCD).
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid = uuid!("00002902-0000-1000-8000-00805f9b34fb");

/// A GATT UUID normalized to the 128-bit lowercase dashed form.
///
/// Two identifier strings denote the same attribute iff their canonical forms
/// are equal; equality, ordering, and hashing are all defined on the canonical
/// form only. `Display` produces the 36-character lowercase dashed string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct CanonicalUuid(Uuid);

impl CanonicalUuid {
    /// Borrow the underlying 128-bit value.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Consume the wrapper and return the underlying 128-bit value.
    pub fn into_uuid(self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for CanonicalUuid {
    fn from(uuid: Uuid) -> Self {
        // A parsed Uuid is already the full 128-bit value; only the textual
        // form needed normalizing.
        Self(uuid)
    }
}

impl From<CanonicalUuid> for Uuid {
    fn from(canonical: CanonicalUuid) -> Self {
        canonical.0
    }
}

impl fmt::Display for CanonicalUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // uuid's hyphenated form is lowercase, which is exactly the canonical
        // textual encoding.
        write!(f, "{}", self.0)
    }
}

impl FromStr for CanonicalUuid {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        canonicalize(s)
    }
}

/// Normalize a 16-, 32-, or 128-bit GATT identifier to canonical form.
///
/// Accepted inputs are 4-, 8-, or 32-hex-digit tokens, the latter with or
/// without the standard 8-4-4-4-12 dashes. Short forms are left-padded to
/// 8 digits and suffixed with the Bluetooth base UUID tail.
///
/// # Examples
///
/// ```
/// use blekit_types::uuid::canonicalize;
///
/// let hr = canonicalize("180D").unwrap();
/// assert_eq!(hr.to_string(), "0000180d-0000-1000-8000-00805f9b34fb");
///
/// // All three encodings of the same attribute compare equal
/// assert_eq!(hr, canonicalize("0000180d").unwrap());
/// assert_eq!(hr, canonicalize("0000180D-0000-1000-8000-00805F9B34FB").unwrap());
///
/// assert!(canonicalize("garbage").is_err());
/// ```
pub fn canonicalize(input: &str) -> Result<CanonicalUuid, IdentifierError> {
    let compact = if input.len() == 36 {
        // Dashed form: separators must sit at the standard positions.
        for (index, byte) in input.bytes().enumerate() {
            let is_separator_position = matches!(index, 8 | 13 | 18 | 23);
            if is_separator_position != (byte == b'-') {
                return Err(IdentifierError::invalid(input));
            }
        }
        input.replace('-', "")
    } else {
        input.to_string()
    };

    if !compact.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(IdentifierError::invalid(input));
    }

    let lower = compact.to_ascii_lowercase();
    let dashed = match lower.len() {
        4 => format!("0000{lower}{BLUETOOTH_BASE_TAIL}"),
        8 => format!("{lower}{BLUETOOTH_BASE_TAIL}"),
        32 => format!(
            "{}-{}-{}-{}-{}",
            &lower[..8],
            &lower[8..12],
            &lower[12..16],
            &lower[16..20],
            &lower[20..]
        ),
        _ => return Err(IdentifierError::invalid(input)),
    };

    Uuid::parse_str(&dashed)
        .map(CanonicalUuid)
        .map_err(|_| IdentifierError::invalid(input))
}

/// Canonicalize an ordered sequence of identifiers, preserving order.
///
/// Fails on the first invalid element.
pub fn canonicalize_all<I, S>(inputs: I) -> Result<Vec<CanonicalUuid>, IdentifierError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    inputs
        .into_iter()
        .map(|input| canonicalize(input.as_ref()))
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_canonicalize_16_bit() {
        let canonical = canonicalize("180d").unwrap();
        assert_eq!(canonical.to_string(), "0000180d-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_canonicalize_16_bit_uppercase() {
        let canonical = canonicalize("2A37").unwrap();
        assert_eq!(canonical.to_string(), "00002a37-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_canonicalize_32_bit() {
        let canonical = canonicalize("0000180F").unwrap();
        assert_eq!(canonical.to_string(), "0000180f-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_canonicalize_128_bit_compact() {
        let canonical = canonicalize("F0CD140095DA4F4B9AC8AA55D312AF0C").unwrap();
        assert_eq!(canonical.to_string(), "f0cd1400-95da-4f4b-9ac8-aa55d312af0c");
    }

    #[test]
    fn test_canonicalize_128_bit_dashed() {
        let canonical = canonicalize("F0CD1400-95DA-4F4B-9AC8-AA55D312AF0C").unwrap();
        assert_eq!(canonical.to_string(), "f0cd1400-95da-4f4b-9ac8-aa55d312af0c");
    }

    #[test]
    fn test_equality_across_encodings() {
        let short = canonicalize("180d").unwrap();
        let long = canonicalize("0000180d-0000-1000-8000-00805F9B34FB").unwrap();
        assert_eq!(short, long);
        assert_eq!(short, CanonicalUuid::from(HEART_RATE_SERVICE));
    }

    #[test]
    fn test_invalid_lengths_rejected() {
        for input in ["", "1", "123", "12345", "180d0", "0000180d0"] {
            assert!(canonicalize(input).is_err(), "{input:?} should be rejected");
        }
    }

    #[test]
    fn test_invalid_characters_rejected() {
        assert!(canonicalize("xyzw").is_err());
        assert!(canonicalize("0000xyzw").is_err());
    }

    #[test]
    fn test_misplaced_dashes_rejected() {
        // 36 characters, but separators off by one
        assert!(canonicalize("f0cd14009-5da-4f4b-9ac8-aa55d312af0c").is_err());
    }

    #[test]
    fn test_dashes_in_short_form_rejected() {
        assert!(canonicalize("18-0d").is_err());
    }

    #[test]
    fn test_canonicalize_all_preserves_order() {
        let canonical = canonicalize_all(["180d", "2a37", "180f"]).unwrap();
        let rendered: Vec<String> = canonical.iter().map(|u| u.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "0000180d-0000-1000-8000-00805f9b34fb",
                "00002a37-0000-1000-8000-00805f9b34fb",
                "0000180f-0000-1000-8000-00805f9b34fb",
            ]
        );
    }

    #[test]
    fn test_canonicalize_all_fails_on_first_invalid() {
        assert!(canonicalize_all(["180d", "nope"]).is_err());
    }

    #[test]
    fn test_from_str() {
        let canonical: CanonicalUuid = "180d".parse().unwrap();
        assert_eq!(canonical, CanonicalUuid::from(HEART_RATE_SERVICE));
    }

    proptest! {
        #[test]
        fn prop_short_forms_get_base_tail(value in 0u32..=0xFFFF) {
            let input = format!("{value:04x}");
            let canonical = canonicalize(&input).unwrap().to_string();
            prop_assert_eq!(canonical.len(), 36);
            prop_assert!(canonical.ends_with(BLUETOOTH_BASE_TAIL));
            prop_assert_eq!(canonical.clone(), canonical.to_lowercase());
        }

        #[test]
        fn prop_canonical_form_is_a_fixed_point(value in any::<u128>()) {
            let uuid = Uuid::from_u128(value);
            let canonical = canonicalize(&uuid.to_string()).unwrap();
            prop_assert_eq!(canonical, CanonicalUuid::from(uuid));
            prop_assert_eq!(
                canonicalize(&canonical.to_string()).unwrap(),
                canonical
            );
        }

        #[test]
        fn prop_case_is_irrelevant(value in any::<u128>()) {
            let uuid = Uuid::from_u128(value).to_string();
            let upper = canonicalize(&uuid.to_uppercase()).unwrap();
            let lower = canonicalize(&uuid).unwrap();
            prop_assert_eq!(upper, lower);
        }
    }
}
