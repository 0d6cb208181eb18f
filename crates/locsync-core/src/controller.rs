//! Monitoring controller.
//!
//! The controller is the one entry point the host bridge talks to. It owns
//! an explicit context (store, uploader, provider, options) plus the handle
//! of the running sampler, so no state lives in globals.
//!
//! ```text
//! Stopped --start (permission granted)--> Starting --provider subscribed--> Active
//!    ^                                                                        |
//!    +------------------------------------stop--------------------------------+
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};

use locsync_store::{EventRecord, keys};
use locsync_types::{Authorization, Availability, LocationSample, Position, Settings};

use crate::error::{Error, Result};
use crate::geofence::{GeofenceDefinitions, GeofenceTracker};
use crate::sampler::{
    self, SAMPLE_CHANNEL_CAPACITY, SampleOutcome, SampleProcessor, SamplerHandle, SamplerOptions,
    TRACKING_SERVICE,
};
use crate::traits::LocationProvider;
use crate::uploader::{SharedStore, Uploader};

/// Service name of the persisted monitoring status row.
pub const MONITORING_SERVICE: &str = "location_monitoring";

/// Service name of the persisted permission status row.
pub const PERMISSION_SERVICE: &str = "location_permission";

/// Arguments of `initialize`, as sent by the host application.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InitOptions {
    /// Base URL of the remote API.
    pub api_url: String,
    /// Access token passed through to the remote API.
    pub access_token: String,
    /// Minimum interval between accepted samples.
    pub tracking_frequency_milliseconds: i64,
    /// Optional `User-Agent` for API requests.
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Optional geofence definitions.
    #[serde(default)]
    pub geofences: Option<serde_json::Value>,
}

impl InitOptions {
    /// Reject empty credentials and negative intervals.
    pub fn validate(&self) -> Result<()> {
        if self.api_url.trim().is_empty() {
            return Err(Error::InvalidSettings("api_url must not be empty".to_string()));
        }
        if self.access_token.trim().is_empty() {
            return Err(Error::InvalidSettings(
                "access_token must not be empty".to_string(),
            ));
        }
        if self.tracking_frequency_milliseconds < 0 {
            return Err(Error::InvalidSettings(format!(
                "tracking_frequency_milliseconds must be >= 0, got {}",
                self.tracking_frequency_milliseconds
            )));
        }
        Ok(())
    }

    fn settings(&self) -> Settings {
        Settings {
            api_base_url: self.api_url.clone(),
            access_token: self.access_token.clone(),
            sample_interval_ms: u64::try_from(self.tracking_frequency_milliseconds).ok(),
        }
    }
}

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Options for each sampler session.
    pub sampler: SamplerOptions,
    /// Pending event count that triggers an upload after a status change.
    pub status_event_threshold: u64,
    /// How long [`MonitoringController::capture_once`] waits for a fix.
    pub capture_timeout: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            sampler: SamplerOptions::default(),
            status_event_threshold: 1,
            capture_timeout: Duration::from_secs(30),
        }
    }
}

/// Lifecycle of the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    /// No sampler is running.
    Stopped,
    /// Permission granted, subscribing to the provider.
    Starting,
    /// The sampler task is consuming samples.
    Active,
}

/// Statuses reported by `record_status_change`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// Current monitoring status string.
    pub monitoring_status: String,
    /// Current permission status string.
    pub permission_status: String,
    /// Whether either differed from the persisted value.
    pub changed: bool,
}

/// Drives monitoring on behalf of the host application.
pub struct MonitoringController {
    store: SharedStore,
    uploader: Uploader,
    provider: Arc<dyn LocationProvider>,
    options: ControllerOptions,
    last_accepted: Arc<RwLock<Option<LocationSample>>>,
    availability: RwLock<Availability>,
    authorization: RwLock<Authorization>,
    state: RwLock<SamplerState>,
    session: Mutex<Option<SamplerHandle>>,
}

impl std::fmt::Debug for MonitoringController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoringController")
            .field("provider", &self.provider.name())
            .field("options", &self.options)
            .finish()
    }
}

impl MonitoringController {
    /// Create a stopped controller.
    pub fn new(
        store: SharedStore,
        uploader: Uploader,
        provider: Arc<dyn LocationProvider>,
        options: ControllerOptions,
    ) -> Self {
        Self {
            store,
            uploader,
            provider,
            options,
            last_accepted: Arc::default(),
            availability: RwLock::new(Availability::Disabled),
            authorization: RwLock::new(Authorization::NotDetermined),
            state: RwLock::new(SamplerState::Stopped),
            session: Mutex::new(None),
        }
    }

    /// The shared store.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// The uploader.
    pub fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    /// Current sampler lifecycle state.
    pub async fn state(&self) -> SamplerState {
        *self.state.read().await
    }

    /// Whether a sampler is running.
    pub async fn is_active(&self) -> bool {
        self.state().await == SamplerState::Active
    }

    /// Store the host-supplied settings.
    ///
    /// A running sampler picks up the new settings immediately.
    pub async fn initialize(&self, options: InitOptions) -> Result<()> {
        options.validate()?;

        let definitions = options
            .geofences
            .clone()
            .map(GeofenceDefinitions::from_value)
            .transpose()?;
        if let Some(definitions) = &definitions {
            // Reject malformed radii before anything is stored
            GeofenceTracker::new(definitions)?;
        }

        let settings = options.settings();
        {
            let store = self.store.lock().await;
            store.save_settings(&settings)?;
            match options.user_agent.as_deref() {
                Some(user_agent) => store.set_setting(keys::USER_AGENT, user_agent)?,
                None => store.remove_setting(keys::USER_AGENT)?,
            }
            match &options.geofences {
                Some(geofences) => {
                    store.set_setting(keys::GEOFENCES, &geofences.to_string())?;
                }
                None => {
                    store.remove_setting(keys::GEOFENCES)?;
                    store.remove_setting(keys::GEOFENCE_STATES)?;
                    store.remove_setting(keys::GEOFENCE_CHANGED_AT)?;
                }
            }
        }
        info!(
            "Initialized (api_url={}, interval={:?} ms, {} geofence(s))",
            settings.api_base_url,
            settings.sample_interval_ms,
            definitions.as_ref().map_or(0, GeofenceDefinitions::len)
        );

        let session = self.session.lock().await;
        if let Some(handle) = session.as_ref().filter(|h| !h.is_finished()) {
            let geofences = self.load_geofences().await?;
            if !handle.reconfigure(settings, geofences).await {
                warn!("Running sampler did not accept new settings");
            }
        }
        Ok(())
    }

    /// Start monitoring.
    ///
    /// Returns `false` when location permission is not granted; nothing is
    /// changed in that case. Returns `true` once the provider subscription is
    /// established, without waiting for a first sample. Starting while
    /// already active re-arms the renewal timer.
    pub async fn start(&self) -> Result<bool> {
        let authorization = self.refresh_authorization().await;
        if !authorization.is_granted() {
            info!("Not starting: location permission is {}", authorization);
            return Ok(false);
        }

        let mut session = self.session.lock().await;
        if let Some(handle) = session.as_ref()
            && !handle.is_finished()
        {
            debug!("Already monitoring, re-arming renewal timer");
            handle.rearm().await;
            return Ok(true);
        }

        let settings = self
            .store
            .lock()
            .await
            .load_settings()?
            .ok_or(Error::NotInitialized("initialize has not been called"))?;
        if settings.sample_interval_ms.is_none() {
            return Err(Error::NotInitialized("sample interval is not set"));
        }

        *self.state.write().await = SamplerState::Starting;
        let availability = self.refresh_availability().await;
        if !availability.is_enabled() {
            warn!("Starting while {}, fixes may not arrive", availability);
        }

        let result = self.start_session(settings).await;
        match result {
            Ok(handle) => {
                *session = Some(handle);
                *self.state.write().await = SamplerState::Active;
                info!("Location monitoring started");
                Ok(true)
            }
            Err(e) => {
                *session = None;
                *self.state.write().await = SamplerState::Stopped;
                Err(e)
            }
        }
    }

    async fn start_session(&self, settings: Settings) -> Result<SamplerHandle> {
        let geofences = self.load_geofences().await?;
        let processor = SampleProcessor::new(
            Arc::clone(&self.store),
            self.uploader.clone(),
            settings,
            geofences,
            self.options.sampler.clone(),
            Arc::clone(&self.last_accepted),
        )?;

        let (tx, rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
        self.provider.start_updates(tx).await?;

        Ok(sampler::spawn(processor, Arc::clone(&self.provider), rx))
    }

    /// Record one fix without starting a session.
    ///
    /// Subscribes to the provider, asks for a fix and unsubscribes once it
    /// arrives or [`ControllerOptions::capture_timeout`] passes. The fix goes
    /// through the same gate, store and geofence path as a session sample.
    ///
    /// Returns `None` without touching the provider while monitoring is
    /// active, when permission is not granted, or when location is
    /// unavailable. Also returns `None` when no fix arrives in time.
    pub async fn capture_once(&self) -> Result<Option<SampleOutcome>> {
        let session = self.session.lock().await;
        if session.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Monitoring is active, skipping one-shot capture");
            return Ok(None);
        }

        let authorization = self.refresh_authorization().await;
        if !authorization.is_granted() {
            debug!("Not capturing: location permission is {}", authorization);
            return Ok(None);
        }
        let availability = self.refresh_availability().await;
        if !availability.is_enabled() {
            debug!("Not capturing: {}", availability);
            return Ok(None);
        }

        let settings = self
            .store
            .lock()
            .await
            .load_settings()?
            .ok_or(Error::NotInitialized("initialize has not been called"))?;
        let geofences = self.load_geofences().await?;
        let mut processor = SampleProcessor::new(
            Arc::clone(&self.store),
            self.uploader.clone(),
            settings,
            geofences,
            self.options.sampler.clone(),
            Arc::clone(&self.last_accepted),
        )?;

        let (tx, mut rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
        self.provider.start_updates(tx).await?;
        let fix = async {
            self.provider.request_fix().await?;
            Ok::<_, Error>(rx.recv().await)
        };
        let received = tokio::time::timeout(self.options.capture_timeout, fix).await;
        if let Err(e) = self.provider.stop_updates().await {
            warn!("Failed to unsubscribe after capture: {}", e);
        }

        let sample = match received {
            Ok(Ok(Some(sample))) => sample,
            Ok(Ok(None)) => return Ok(None),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                info!(
                    "No fix within {:?}, nothing captured",
                    self.options.capture_timeout
                );
                return Ok(None);
            }
        };

        let outcome = processor.on_sample(sample).await?;
        drop(session);
        debug!("One-shot capture at {} (accepted: {})", sample.timestamp, outcome.accepted);
        Ok(Some(outcome))
    }

    /// Stop monitoring.
    ///
    /// Acts regardless of the current permission. An upload already in
    /// flight is allowed to finish.
    pub async fn stop(&self) -> Result<()> {
        let handle = self.session.lock().await.take();
        let Some(handle) = handle else {
            debug!("Stop requested while not monitoring");
            *self.state.write().await = SamplerState::Stopped;
            return Ok(());
        };

        handle.shutdown().await;
        *self.state.write().await = SamplerState::Stopped;
        self.provider.stop_updates().await?;
        info!("Location monitoring stopped");
        Ok(())
    }

    /// Refresh and return the monitoring status string.
    pub async fn monitoring_status(&self) -> String {
        self.refresh_availability().await.to_string()
    }

    /// Refresh and return the permission status string.
    pub async fn permission_status(&self) -> String {
        self.refresh_authorization().await.to_string()
    }

    /// Last accepted position, falling back to the newest pending record.
    pub async fn last_position(&self) -> Result<Option<Position>> {
        if let Some(sample) = self.last_accepted.read().await.as_ref() {
            return Ok(Some(sample.position()));
        }
        let latest = self.store.lock().await.latest()?;
        Ok(latest.and_then(|record| record.position()))
    }

    /// Stop monitoring and forget settings, pending records and geofence state.
    pub async fn clear_settings(&self) -> Result<()> {
        self.stop().await?;
        {
            let store = self.store.lock().await;
            store.clear_settings()?;
            store.clear_locations()?;
        }
        *self.last_accepted.write().await = None;
        info!("Settings and pending records cleared");
        Ok(())
    }

    /// Persist status changes and log them as an event.
    ///
    /// Both statuses are refreshed first. When either differs from the
    /// persisted service status rows, the rows are updated, a
    /// `changing monitoring or permissions status` event is recorded, and an
    /// event upload is triggered once enough events are pending.
    pub async fn record_status_change(&self) -> Result<StatusChange> {
        let monitoring_status = self.monitoring_status().await;
        let permission_status = self.permission_status().await;

        let store = self.store.lock().await;
        let stored_monitoring = store.get_service_status(MONITORING_SERVICE)?;
        let stored_permission = store.get_service_status(PERMISSION_SERVICE)?;

        let changed = stored_monitoring.is_none_or(|s| s.status != monitoring_status)
            || stored_permission.is_none_or(|s| s.status != permission_status);
        if !changed {
            return Ok(StatusChange {
                monitoring_status,
                permission_status,
                changed,
            });
        }

        store.set_service_status(MONITORING_SERVICE, &monitoring_status)?;
        store.set_service_status(PERMISSION_SERVICE, &permission_status)?;

        let settings = store.load_settings()?;
        let token = settings.as_ref().map_or("", |s| s.access_token.as_str());
        store.insert_event(&EventRecord::new(
            token,
            TRACKING_SERVICE,
            "changing monitoring or permissions status",
            serde_json::json!({
                "location_monitoring_status": monitoring_status,
                "location_permission_status": permission_status,
            }),
            OffsetDateTime::now_utc(),
        ))?;
        let pending_events = store.count_events()?;
        drop(store);

        info!(
            "Status changed: monitoring '{}', permission '{}'",
            monitoring_status, permission_status
        );
        if settings.is_some() && pending_events >= self.options.status_event_threshold {
            self.uploader.trigger_events();
        }

        Ok(StatusChange {
            monitoring_status,
            permission_status,
            changed,
        })
    }

    async fn refresh_availability(&self) -> Availability {
        let availability = self.provider.availability().await;
        *self.availability.write().await = availability;
        availability
    }

    async fn refresh_authorization(&self) -> Authorization {
        let authorization = self.provider.authorization().await;
        *self.authorization.write().await = authorization;
        authorization
    }

    /// Build the geofence tracker from stored definitions and states.
    async fn load_geofences(&self) -> Result<GeofenceTracker> {
        let store = self.store.lock().await;
        let Some(json) = store.get_setting(keys::GEOFENCES)? else {
            return Ok(GeofenceTracker::default());
        };

        let mut tracker = GeofenceTracker::new(&GeofenceDefinitions::from_json(&json)?)?;
        if let Some(states) = store.get_setting(keys::GEOFENCE_STATES)? {
            match serde_json::from_str::<BTreeMap<String, String>>(&states) {
                Ok(states) => tracker.restore_states(&states),
                Err(e) => warn!("Ignoring unreadable geofence states: {}", e),
            }
        }
        Ok(tracker)
    }
}
