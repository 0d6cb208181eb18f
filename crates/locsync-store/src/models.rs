//! Data models for stored data.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use locsync_types::{LocationSample, Position, timestamp_id};

/// Setting keys used in the `settings` table.
pub mod keys {
    /// Base URL of the remote API.
    pub const API_URL: &str = "api_url";
    /// Access token passed through to the remote API.
    pub const ACCESS_TOKEN: &str = "access_token";
    /// Minimum interval between accepted samples, `-1` when unset.
    pub const TRACKING_FREQUENCY_MS: &str = "tracking_frequency_milliseconds";
    /// Optional `User-Agent` header for API requests.
    pub const USER_AGENT: &str = "user_agent";
    /// Geofence definitions as supplied by the host application.
    pub const GEOFENCES: &str = "geofences";
    /// Last known state of each geofence, as a JSON object.
    pub const GEOFENCE_STATES: &str = "geofence_states";
    /// Capture time (a record identifier) of the last geofence entry, or of
    /// leaving the last fence. Geofence states are reset once it is too old.
    pub const GEOFENCE_CHANGED_AT: &str = "geofence_changed_at";
}

/// A location sample waiting to be uploaded.
///
/// Field names serialize to the remote API's wire format, so a record can be
/// placed in an upload batch as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRecord {
    /// Identifier derived from the capture time.
    #[serde(rename = "client_database_id")]
    pub id: String,
    /// Token active when the sample was captured.
    pub access_token: String,
    /// Latitude in decimal degrees.
    pub latitude: String,
    /// Longitude in decimal degrees.
    pub longitude: String,
    /// Reserved, always empty.
    pub other_data: String,
    /// Capture time, equal to `id`.
    pub create_date: String,
}

impl LocationRecord {
    /// Build a record for a sample, deriving the identifier from its capture time.
    pub fn from_sample(sample: &LocationSample, access_token: &str) -> Self {
        let id = timestamp_id(sample.timestamp);
        Self {
            create_date: id.clone(),
            id,
            access_token: access_token.to_string(),
            latitude: sample.latitude.to_string(),
            longitude: sample.longitude.to_string(),
            other_data: String::new(),
        }
    }

    /// Parse the stored coordinates back into a position.
    pub fn position(&self) -> Option<Position> {
        let latitude = self.latitude.parse().ok()?;
        let longitude = self.longitude.parse().ok()?;
        Some(Position::new(latitude, longitude))
    }
}

/// An audit event waiting to be uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Identifier derived from the creation time.
    #[serde(rename = "client_database_id")]
    pub id: String,
    /// Token active when the event was recorded.
    pub access_token: String,
    /// Subsystem that produced the event.
    pub service: String,
    /// What happened.
    pub action: String,
    /// Event details.
    pub objects: serde_json::Value,
    /// Creation time, equal to `id`.
    pub create_date: String,
}

impl EventRecord {
    /// Create an event stamped with `at`.
    pub fn new(
        access_token: &str,
        service: &str,
        action: &str,
        objects: serde_json::Value,
        at: OffsetDateTime,
    ) -> Self {
        let id = timestamp_id(at);
        Self {
            create_date: id.clone(),
            id,
            access_token: access_token.to_string(),
            service: service.to_string(),
            action: action.to_string(),
            objects,
        }
    }
}

/// Last persisted status string of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Service name.
    pub service: String,
    /// Status string.
    pub status: String,
    /// When the status was written.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}
