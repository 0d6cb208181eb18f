//! Location sampling and batch upload for the locsync agent.
//!
//! This crate turns a stream of raw GPS fixes into batches posted to a
//! remote API. It sits between a [`LocationProvider`] and the
//! [`locsync_store::Store`], and is driven by the [`MonitoringController`].
//!
//! # Features
//!
//! - **Interval gate**: drop fixes closer than 90% of the sample interval
//! - **Sampling loop**: one task consumes fixes and renews them on a timer
//! - **Batch upload**: post pending records and remove what the server confirms
//! - **Geofences**: circles and polygons with entry/exit events
//! - **Providers**: gpsd over TCP, plus a scriptable mock for tests
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use locsync_core::{
//!     ControllerOptions, GpsdOptions, GpsdProvider, InitOptions, MonitoringController,
//!     UploadOptions, Uploader,
//! };
//! use locsync_store::Store;
//! use tokio::sync::Mutex;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(Mutex::new(Store::open_default()?));
//!     let uploader = Uploader::new(store.clone(), UploadOptions::default())?;
//!     let provider = Arc::new(GpsdProvider::new(GpsdOptions::default()));
//!     let controller =
//!         MonitoringController::new(store, uploader, provider, ControllerOptions::default());
//!
//!     controller
//!         .initialize(InitOptions {
//!             api_url: "https://api.example.com/v1/".to_string(),
//!             access_token: "token".to_string(),
//!             tracking_frequency_milliseconds: 10_000,
//!             ..InitOptions::default()
//!         })
//!         .await?;
//!
//!     if controller.start().await? {
//!         println!("Monitoring: {}", controller.monitoring_status().await);
//!     }
//!     Ok(())
//! }
//! ```

pub mod controller;
pub mod error;
pub mod gate;
pub mod geofence;
pub mod gpsd;
pub mod mock;
pub mod sampler;
pub mod traits;
pub mod uploader;

pub use controller::{
    ControllerOptions, InitOptions, MonitoringController, SamplerState, StatusChange,
};
pub use error::{Error, Result};
pub use gate::IntervalGate;
pub use geofence::{GeofenceDefinitions, GeofenceState, GeofenceTracker, Shape, Transitions};
pub use gpsd::{GpsdOptions, GpsdProvider};
pub use mock::MockLocationProvider;
pub use sampler::{SampleOutcome, SampleProcessor, SamplerCommand, SamplerHandle, SamplerOptions};
pub use traits::LocationProvider;
pub use uploader::{SharedStore, UploadOptions, UploadOutcome, Uploader};

// Re-export types crate
pub use locsync_types;
