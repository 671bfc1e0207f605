//! Error types for value parsing in headset-types.

use thiserror::Error;

/// Errors that can occur when parsing headset gateway values.
///
/// This error type is transport-agnostic and does not include
/// protocol or connection errors (those belong in headset-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// A Bluetooth device address was not six colon-separated hex octets.
    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    /// A value could not be parsed.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// An indicator index does not exist in the table.
    #[error("Indicator index {index} out of range (table has {len} indicators)")]
    IndicatorIndex { index: usize, len: usize },

    /// An indicator value lies outside the indicator's declared range.
    #[error("Value {value} outside range ({range}) of indicator '{name}'")]
    IndicatorValue {
        name: String,
        value: i32,
        range: String,
    },
}

/// Result type alias using headset-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
