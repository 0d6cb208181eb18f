//! Platform-agnostic types for the locsync location batching agent.
//!
//! This crate provides the value types shared by the store, the sampling
//! core and the service binary.
//!
//! # Features
//!
//! - Location samples and positions
//! - Host-supplied settings
//! - Authorization and availability, with the status strings reported to
//!   the host application
//! - Timestamp-derived record identifiers
//!
//! # Example
//!
//! ```
//! use locsync_types::{Authorization, LocationSample, timestamp_id};
//! use time::OffsetDateTime;
//!
//! let sample = LocationSample::new(43.0731, -89.4012, OffsetDateTime::UNIX_EPOCH);
//! assert_eq!(timestamp_id(sample.timestamp), "0.000");
//! assert_eq!(Authorization::Denied.to_string(), "not granted");
//! ```

pub mod error;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use types::{
    Authorization, Availability, LocationSample, Position, Settings, millis_id, parse_timestamp_id,
    timestamp_id, unix_millis,
};

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use time::OffsetDateTime;

    proptest! {
        #[test]
        fn timestamp_id_parses_back_to_the_same_millisecond(
            millis in 0i64..4_102_444_800_000i64,
        ) {
            let ts = OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).unwrap();
            let parsed = parse_timestamp_id(&timestamp_id(ts)).unwrap();
            prop_assert_eq!(parsed, ts);
        }

        #[test]
        fn timestamp_ids_are_ordered_like_their_timestamps(
            a in 1_000_000_000_000i64..9_999_999_999_999i64,
            b in 1_000_000_000_000i64..9_999_999_999_999i64,
        ) {
            let ta = OffsetDateTime::from_unix_timestamp_nanos(i128::from(a) * 1_000_000).unwrap();
            let tb = OffsetDateTime::from_unix_timestamp_nanos(i128::from(b) * 1_000_000).unwrap();
            prop_assert_eq!(timestamp_id(ta).cmp(&timestamp_id(tb)), a.cmp(&b));
        }
    }
}
