//! Error types for identifier normalization in blekit-types.

use thiserror::Error;

/// Errors that can occur when normalizing GATT identifiers.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in blekit-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum IdentifierError {
    /// The input was not a 4-, 8-, or 32-hex-digit UUID token.
    #[error("invalid GATT identifier: {input:?}")]
    Invalid {
        /// The rejected input, verbatim.
        input: String,
    },
}

impl IdentifierError {
    /// Create an invalid-identifier error for the given input.
    pub fn invalid(input: impl Into<String>) -> Self {
        Self::Invalid {
            input: input.into(),
        }
    }
}

/// Result type alias using blekit-types' IdentifierError type.
pub type IdentifierResult<T> = std::result::Result<T, IdentifierError>;
