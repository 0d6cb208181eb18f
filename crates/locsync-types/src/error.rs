//! Error types for value parsing in locsync-types.

use thiserror::Error;

/// Errors that can occur when parsing locsync values from text.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// Unknown authorization name.
    #[error("Unknown authorization '{0}'")]
    UnknownAuthorization(String),

    /// Timestamp identifier could not be parsed.
    #[error("Invalid timestamp identifier '{0}'")]
    InvalidTimestampId(String),

    /// Coordinate outside the valid range.
    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),
}

/// Result type alias using locsync-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
