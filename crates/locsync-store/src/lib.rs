//! Local persistence for the locsync location batching agent.
//!
//! This crate provides SQLite-based storage for location records waiting to
//! be uploaded, the settings supplied by the host application, and the audit
//! events produced while monitoring.
//!
//! # Features
//!
//! - Append-only pending record sequence, read in insertion order
//! - Idempotent removal of uploaded records by identifier
//! - Settings replaced as a whole, with an explicit "unset" interval
//! - Pending audit events and per-service status
//!
//! # Example
//!
//! ```no_run
//! use locsync_store::{LocationRecord, Store};
//! use locsync_types::LocationSample;
//! use time::OffsetDateTime;
//!
//! let store = Store::open_default()?;
//!
//! let sample = LocationSample::new(43.0731, -89.4012, OffsetDateTime::now_utc());
//! store.append(&LocationRecord::from_sample(&sample, "token"))?;
//!
//! let batch = store.first_n(30)?;
//! # Ok::<(), locsync_store::Error>(())
//! ```

mod error;
mod models;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::{EventRecord, LocationRecord, ServiceStatus, keys};
pub use store::Store;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/locsync/locsync.db`
/// - macOS: `~/Library/Application Support/locsync/locsync.db`
/// - Windows: `C:\Users\<user>\AppData\Local\locsync\locsync.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("locsync")
        .join("locsync.db")
}
