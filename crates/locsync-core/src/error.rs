//! Error types for locsync-core.
//!
//! # Recovery
//!
//! | Error Type | Strategy |
//! |------------|----------|
//! | [`Error::Store`] | Surface to the caller; the local database is unusable |
//! | [`Error::Http`] | Nothing to do; pending records are retried with the next batch |
//! | [`Error::Api`] | Nothing to do; pending records are retried with the next batch |
//! | [`Error::InvalidResponse`] | Nothing to do; pending records are retried with the next batch |
//! | [`Error::NotInitialized`] | Call `initialize` first |
//! | [`Error::InvalidSettings`] | Fix the values passed to `initialize` |
//! | [`Error::Provider`] | Check the location provider (gpsd running, device present) |
//! | [`Error::Geofence`] | Fix the geofence definitions passed to `initialize` |

use thiserror::Error;

/// Errors that can occur while sampling, storing or uploading locations.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Local persistence failed.
    #[error("Store error: {0}")]
    Store(#[from] locsync_store::Error),

    /// Transport-level HTTP failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote API answered with a status other than 200.
    #[error("API returned status {status}")]
    Api {
        /// HTTP status code.
        status: u16,
    },

    /// The remote API answered 200 with a body that is not a valid result.
    #[error("Invalid API response: {0}")]
    InvalidResponse(String),

    /// An operation needs settings that `initialize` has not stored yet.
    #[error("Not initialized: {0}")]
    NotInitialized(&'static str),

    /// Values passed to `initialize` were rejected.
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    /// The location provider failed.
    #[error("Location provider error: {0}")]
    Provider(String),

    /// Geofence definitions could not be parsed.
    #[error("Invalid geofence definitions: {0}")]
    Geofence(#[from] serde_json::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias using locsync-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
