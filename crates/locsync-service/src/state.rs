//! Application state shared across handlers.
//!
//! The [`MonitoringController`] owns the store, the uploader and the
//! location provider. Handlers go through the controller for every command
//! and only lock `controller.store()` directly for read-only counts.

use std::sync::Arc;

use locsync_core::{
    GpsdProvider, LocationProvider, MockLocationProvider, MonitoringController, SharedStore,
    Uploader,
};
use locsync_store::Store;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::config::{Config, ProviderKind};

/// Shared application state.
pub struct AppState {
    /// Drives monitoring; owns the store and the uploader.
    pub controller: MonitoringController,
    /// Configuration the agent was started with.
    pub config: RwLock<Config>,
}

impl AppState {
    /// Create new application state.
    pub fn new(controller: MonitoringController, config: Config) -> Arc<Self> {
        Arc::new(Self {
            controller,
            config: RwLock::new(config),
        })
    }

    /// Build the controller described by `config` on top of `store`.
    pub fn from_config(store: Store, config: Config) -> locsync_core::Result<Arc<Self>> {
        let provider = build_provider(&config);
        Self::with_provider(store, config, provider)
    }

    /// Like [`AppState::from_config`], with an explicit provider.
    pub fn with_provider(
        store: Store,
        config: Config,
        provider: Arc<dyn LocationProvider>,
    ) -> locsync_core::Result<Arc<Self>> {
        let store: SharedStore = Arc::new(Mutex::new(store));
        let uploader = Uploader::new(Arc::clone(&store), config.upload.options())?;
        let controller =
            MonitoringController::new(store, uploader, provider, config.controller_options());
        Ok(Self::new(controller, config))
    }
}

/// Create the location provider selected in the configuration.
pub fn build_provider(config: &Config) -> Arc<dyn LocationProvider> {
    match config.provider.kind {
        ProviderKind::Gpsd => {
            let provider = GpsdProvider::new(config.provider.gpsd_options());
            info!("Reading fixes from gpsd at {}", provider.address());
            Arc::new(provider)
        }
        ProviderKind::Mock => Arc::new(MockLocationProvider::with_authorization(
            config.provider.authorization(),
        )),
    }
}
