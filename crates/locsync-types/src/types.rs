//! Core types for location sampling.

use core::fmt;
use core::str::FromStr;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{ParseError, ParseResult};

/// Authorization the location service has granted to this process.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new authorization
/// levels in future versions without breaking downstream code.
///
/// # Display
///
/// `Display` renders the permission status string reported to the host
/// application:
///
/// ```
/// use locsync_types::Authorization;
///
/// assert_eq!(Authorization::Denied.to_string(), "not granted");
/// assert_eq!(Authorization::AuthorizedAlways.to_string(), "granted, always");
/// assert!(Authorization::AuthorizedWhenInUse.is_granted());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum Authorization {
    /// The user has not been asked yet.
    #[default]
    NotDetermined,
    /// The user refused access.
    Denied,
    /// Access is blocked by policy.
    Restricted,
    /// Access granted without a finer scope.
    Authorized,
    /// Access granted, including in the background.
    AuthorizedAlways,
    /// Access granted while the host application is in use.
    AuthorizedWhenInUse,
}

impl Authorization {
    /// Whether location updates may be requested.
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(
            self,
            Authorization::Authorized
                | Authorization::AuthorizedAlways
                | Authorization::AuthorizedWhenInUse
        )
    }

    /// Permission status string for this authorization.
    #[must_use]
    pub fn status_label(&self) -> &'static str {
        match self {
            Authorization::NotDetermined | Authorization::Denied | Authorization::Restricted => {
                "not granted"
            }
            Authorization::Authorized => "granted",
            Authorization::AuthorizedAlways => "granted, always",
            Authorization::AuthorizedWhenInUse => "granted, always when in use",
        }
    }
}

impl fmt::Display for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status_label())
    }
}

impl FromStr for Authorization {
    type Err = ParseError;

    /// Parse a configuration name (`always`, `when_in_use`, `denied`, ...).
    ///
    /// ```
    /// use locsync_types::Authorization;
    ///
    /// assert_eq!("always".parse(), Ok(Authorization::AuthorizedAlways));
    /// assert_eq!("When-In-Use".parse(), Ok(Authorization::AuthorizedWhenInUse));
    /// assert!("sometimes".parse::<Authorization>().is_err());
    /// ```
    fn from_str(s: &str) -> ParseResult<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "not_determined" => Ok(Authorization::NotDetermined),
            "denied" => Ok(Authorization::Denied),
            "restricted" => Ok(Authorization::Restricted),
            "granted" | "authorized" => Ok(Authorization::Authorized),
            "always" | "authorized_always" => Ok(Authorization::AuthorizedAlways),
            "when_in_use" | "authorized_when_in_use" => Ok(Authorization::AuthorizedWhenInUse),
            _ => Err(ParseError::UnknownAuthorization(s.to_string())),
        }
    }
}

/// Whether the location service can deliver fixes at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum Availability {
    /// The host has no positioning hardware or daemon.
    Unsupported,
    /// Positioning exists but is switched off or unreachable.
    Disabled,
    /// Positioning is on.
    Enabled,
}

impl Availability {
    /// Whether fixes can be delivered.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        matches!(self, Availability::Enabled)
    }

    /// Monitoring status string for this availability.
    #[must_use]
    pub fn status_label(&self) -> &'static str {
        match self {
            Availability::Unsupported => "no gps feature on device",
            Availability::Disabled => "gps not enabled",
            Availability::Enabled => "gps enabled",
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status_label())
    }
}

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Position {
    /// Latitude in decimal degrees (-90 to 90).
    pub latitude: f64,
    /// Longitude in decimal degrees (-180 to 180).
    pub longitude: f64,
}

impl Position {
    /// Create a position without range checks.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Create a position, rejecting out-of-range or non-finite coordinates.
    pub fn checked(latitude: f64, longitude: f64) -> ParseResult<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(ParseError::InvalidCoordinate(format!(
                "latitude {latitude} out of range"
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(ParseError::InvalidCoordinate(format!(
                "longitude {longitude} out of range"
            )));
        }
        Ok(Self::new(latitude, longitude))
    }
}

/// One raw fix as delivered by a location provider.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LocationSample {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Capture time reported by the provider.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    /// Horizontal accuracy in metres, if known.
    #[cfg_attr(feature = "serde", serde(default))]
    pub accuracy: Option<f64>,
}

impl LocationSample {
    /// Create a sample without accuracy information.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64, timestamp: OffsetDateTime) -> Self {
        Self {
            latitude,
            longitude,
            timestamp,
            accuracy: None,
        }
    }

    /// Set the horizontal accuracy.
    #[must_use]
    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    /// The coordinates of this sample.
    #[must_use]
    pub fn position(&self) -> Position {
        Position::new(self.latitude, self.longitude)
    }
}

/// Settings supplied by the host application at initialization.
///
/// Settings are replaced as a whole; individual fields are never updated on
/// their own.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Settings {
    /// Base URL of the remote API, e.g. `https://api.example.com/v1/`.
    pub api_base_url: String,
    /// Access token passed through to the remote API.
    pub access_token: String,
    /// Minimum interval between accepted samples, `None` while unset.
    pub sample_interval_ms: Option<u64>,
}

impl Settings {
    /// Create settings with a known sample interval.
    pub fn new(
        api_base_url: impl Into<String>,
        access_token: impl Into<String>,
        sample_interval_ms: u64,
    ) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            access_token: access_token.into(),
            sample_interval_ms: Some(sample_interval_ms),
        }
    }

    /// The sample interval as a duration, if set.
    #[must_use]
    pub fn sample_interval(&self) -> Option<Duration> {
        self.sample_interval_ms.map(Duration::from_millis)
    }
}

/// Format a capture time as a record identifier.
///
/// Identifiers are seconds since the Unix epoch with millisecond precision.
///
/// ```
/// use locsync_types::timestamp_id;
/// use time::OffsetDateTime;
///
/// let ts = OffsetDateTime::from_unix_timestamp_nanos(1_700_000_000_250_000_000).unwrap();
/// assert_eq!(timestamp_id(ts), "1700000000.250");
/// ```
#[must_use]
pub fn timestamp_id(timestamp: OffsetDateTime) -> String {
    millis_id(unix_millis(timestamp))
}

/// Format milliseconds since the Unix epoch as a record identifier.
#[must_use]
pub fn millis_id(millis: i128) -> String {
    format!("{}.{:03}", millis.div_euclid(1000), millis.rem_euclid(1000))
}

/// Milliseconds since the Unix epoch, rounded down.
#[must_use]
pub fn unix_millis(timestamp: OffsetDateTime) -> i128 {
    timestamp.unix_timestamp_nanos().div_euclid(1_000_000)
}

/// Parse an identifier produced by [`timestamp_id`] (or whole seconds).
pub fn parse_timestamp_id(id: &str) -> ParseResult<OffsetDateTime> {
    let invalid = || ParseError::InvalidTimestampId(id.to_string());

    let (secs, frac) = match id.split_once('.') {
        Some((secs, frac)) => (secs, frac),
        None => (id, ""),
    };
    let secs: i64 = secs.parse().map_err(|_| invalid())?;

    let mut nanos: i128 = 0;
    if !frac.is_empty() {
        if frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let padded = format!("{frac:0<9}");
        nanos = padded.parse().map_err(|_| invalid())?;
    }

    OffsetDateTime::from_unix_timestamp_nanos(i128::from(secs) * 1_000_000_000 + nanos)
        .map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_labels() {
        assert_eq!(Authorization::NotDetermined.status_label(), "not granted");
        assert_eq!(Authorization::Restricted.status_label(), "not granted");
        assert_eq!(Authorization::Authorized.status_label(), "granted");
        assert_eq!(
            Authorization::AuthorizedWhenInUse.status_label(),
            "granted, always when in use"
        );
        assert!(!Authorization::Denied.is_granted());
        assert!(Authorization::Authorized.is_granted());
    }

    #[test]
    fn test_availability_labels() {
        assert_eq!(Availability::Enabled.to_string(), "gps enabled");
        assert_eq!(Availability::Disabled.to_string(), "gps not enabled");
        assert!(!Availability::Unsupported.is_enabled());
    }

    #[test]
    fn test_position_checked() {
        assert!(Position::checked(43.07, -89.4).is_ok());
        assert!(Position::checked(91.0, 0.0).is_err());
        assert!(Position::checked(0.0, -180.5).is_err());
        assert!(Position::checked(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_timestamp_id_whole_seconds() {
        let ts = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        assert_eq!(timestamp_id(ts), "1700000000.000");
    }

    #[test]
    fn test_millis_id() {
        assert_eq!(millis_id(1_700_000_000_001), "1700000000.001");
        assert_eq!(millis_id(-1), "-1.999");
        let ts = OffsetDateTime::from_unix_timestamp_nanos(1_999_999).unwrap();
        assert_eq!(unix_millis(ts), 1);
    }

    #[test]
    fn test_parse_timestamp_id() {
        let parsed = parse_timestamp_id("1700000000.250").unwrap();
        assert_eq!(parsed.unix_timestamp(), 1_700_000_000);
        assert_eq!(parsed.millisecond(), 250);

        let whole = parse_timestamp_id("1700000000").unwrap();
        assert_eq!(whole.unix_timestamp(), 1_700_000_000);

        assert!(parse_timestamp_id("").is_err());
        assert!(parse_timestamp_id("abc").is_err());
        assert!(parse_timestamp_id("1.2x").is_err());
    }

    #[test]
    fn test_settings_interval() {
        let settings = Settings::new("https://api.example.com/", "token", 10_000);
        assert_eq!(settings.sample_interval(), Some(Duration::from_secs(10)));

        let unset = Settings {
            sample_interval_ms: None,
            ..settings
        };
        assert_eq!(unset.sample_interval(), None);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_sample_serde() {
        let ts = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let sample = LocationSample::new(43.07, -89.4, ts).with_accuracy(5.0);
        let json = serde_json::to_string(&sample).unwrap();
        assert!(json.contains("\"timestamp\":\"2023-11-14T22:13:20Z\""));

        let back: LocationSample = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample);
    }
}
