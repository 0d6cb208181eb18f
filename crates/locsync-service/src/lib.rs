//! Location batching agent with a local REST bridge.
//!
//! This crate provides the `locsync` service, which:
//! - Samples GPS fixes from gpsd at a minimum interval
//! - Keeps pending records in a local SQLite database
//! - Uploads them in batches to the configured remote API
//! - Exposes the monitoring commands to a host application over HTTP
//! - Periodically records status changes, captures a fix and flushes
//!   pending data
//!
//! # REST API Endpoints
//!
//! - `GET /api/health` - Service health check
//! - `GET /api/status` - Activity, pending counts and statuses
//! - `POST /api/initialize` - Store API URL, token, interval and geofences
//! - `POST /api/start` - Start monitoring (`false` without permission)
//! - `POST /api/stop` - Stop monitoring
//! - `POST /api/clear-settings` - Stop and forget settings and pending data
//! - `GET /api/last-position` - Last accepted position or `null`
//! - `GET /api/monitoring-status` - Location service status string
//! - `GET /api/permission-status` - Location permission status string
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/locsync/agent.toml`:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [storage]
//! path = "~/.local/share/locsync/locsync.db"
//!
//! [provider]
//! kind = "gpsd"
//! gpsd_address = "127.0.0.1:2947"
//! authorization = "granted"
//!
//! [upload]
//! batch_threshold = 5
//! max_batch_size = 30
//! # timeout_secs = 30  (no timeout unless set)
//!
//! [monitor]
//! inactivity_flush_secs = 7200
//! maintenance_interval_secs = 900
//! capture_timeout_secs = 30
//! geofence_reset_secs = 86400
//! ```

pub mod api;
pub mod config;
pub mod maintenance;
pub mod state;

pub use config::{
    Config, ConfigError, MonitorConfig, ProviderConfig, ProviderKind, ServerConfig,
    StorageConfig, UploadConfig,
};
pub use maintenance::{Maintenance, MaintenanceReport};
pub use state::AppState;
