//! Location sampling loop.
//!
//! A provider pushes raw samples into an `mpsc` channel. One task consumes
//! them serially: each sample goes through the [`IntervalGate`], accepted
//! samples are persisted and evaluated against the geofences, and an upload
//! is triggered once enough records are pending.
//!
//! The same task owns the renewal timer. Every received sample re-arms it;
//! when it fires, the provider is asked for a fresh fix.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use locsync_store::{EventRecord, LocationRecord, keys};
use locsync_types::{
    LocationSample, Settings, millis_id, parse_timestamp_id, timestamp_id, unix_millis,
};

use crate::error::{Error, Result};
use crate::gate::IntervalGate;
use crate::geofence::{GeofenceTracker, Transitions};
use crate::traits::LocationProvider;
use crate::uploader::{SharedStore, Uploader};

/// Service name recorded on location tracking events.
pub const TRACKING_SERVICE: &str = "location tracking";

/// Shortest renewal period, so a zero interval does not spin.
const MIN_RENEWAL_PERIOD: Duration = Duration::from_secs(1);

/// Capacity of the sample channel handed to providers.
pub const SAMPLE_CHANNEL_CAPACITY: usize = 64;

/// Sampler tuning.
#[derive(Debug, Clone)]
pub struct SamplerOptions {
    /// Pending record count that triggers an upload.
    pub batch_threshold: u64,
    /// Force an upload when the previous record is at least this old,
    /// even below the threshold.
    pub inactivity_flush: Option<Duration>,
    /// Pending event count that triggers an event upload.
    pub geofence_event_threshold: u64,
    /// Forget geofence states when the last entry (or the exit from the last
    /// fence) is older than this, so a long stay is reported again.
    pub geofence_reset_after: Option<Duration>,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            batch_threshold: 5,
            inactivity_flush: Some(Duration::from_secs(2 * 60 * 60)),
            geofence_event_threshold: 5,
            geofence_reset_after: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

/// What happened to one sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleOutcome {
    /// The sample passed the gate and was stored.
    pub accepted: bool,
    /// An upload was requested after storing the sample.
    pub upload_triggered: bool,
    /// Geofence transitions caused by the sample.
    pub transitions: Transitions,
}

impl SampleOutcome {
    fn rejected() -> Self {
        Self::default()
    }
}

/// Handles accepted samples: gate, persistence, geofences, upload trigger.
pub struct SampleProcessor {
    store: SharedStore,
    uploader: Uploader,
    settings: Settings,
    gate: IntervalGate,
    geofences: GeofenceTracker,
    options: SamplerOptions,
    last_accepted: Arc<RwLock<Option<LocationSample>>>,
    last_record_millis: Option<i128>,
}

impl SampleProcessor {
    /// Create a processor for the given settings.
    ///
    /// `last_accepted` is shared with the controller, which reports it as the
    /// last known position.
    pub fn new(
        store: SharedStore,
        uploader: Uploader,
        settings: Settings,
        geofences: GeofenceTracker,
        options: SamplerOptions,
        last_accepted: Arc<RwLock<Option<LocationSample>>>,
    ) -> Result<Self> {
        let interval = settings
            .sample_interval()
            .ok_or(Error::NotInitialized("sample interval is not set"))?;

        Ok(Self {
            store,
            uploader,
            gate: IntervalGate::new(interval),
            settings,
            geofences,
            options,
            last_accepted,
            last_record_millis: None,
        })
    }

    /// The active gate.
    pub fn gate(&self) -> IntervalGate {
        self.gate
    }

    /// Replace settings and geofences without restarting.
    pub fn reconfigure(&mut self, settings: Settings, geofences: GeofenceTracker) -> Result<()> {
        let interval = settings
            .sample_interval()
            .ok_or(Error::NotInitialized("sample interval is not set"))?;
        self.gate = IntervalGate::new(interval);
        self.settings = settings;
        self.geofences = geofences;
        info!("Sampler reconfigured, interval {:?}", interval);
        Ok(())
    }

    /// Process one sample from the provider.
    ///
    /// Nothing changes unless the record is stored: a sample that fails to
    /// persist does not count as the last accepted one.
    pub async fn on_sample(&mut self, sample: LocationSample) -> Result<SampleOutcome> {
        let last = self.last_accepted.read().await.as_ref().map(|s| s.timestamp);
        if !self.gate.admits(last, sample.timestamp) {
            debug!(
                "Sample at {} rejected, less than 90% of {:?} since the last one",
                sample.timestamp,
                self.gate.interval()
            );
            return Ok(SampleOutcome::rejected());
        }

        let shared = Arc::clone(&self.store);
        let store = shared.lock().await;

        let previous = store.latest()?;
        let previous_time = previous
            .as_ref()
            .and_then(|record| parse_timestamp_id(&record.create_date).ok());
        let floor = self.last_record_millis.or(previous_time.map(unix_millis));

        let (record, record_millis) = self.record_for(&sample, floor);
        store.append(&record)?;
        self.last_record_millis = Some(record_millis);
        *self.last_accepted.write().await = Some(sample);

        let pending = store.count()?;
        debug!("Stored record {} ({} pending)", record.id, pending);

        let transitions = if self.geofences.is_empty() {
            Transitions::default()
        } else {
            self.update_geofences(&store, &sample)?
        };
        let pending_events = store.count_events()?;
        drop(store);

        if !transitions.is_empty() && pending_events >= self.options.geofence_event_threshold {
            self.uploader.trigger_events();
        }

        let inactive = match (self.options.inactivity_flush, previous_time) {
            (Some(window), Some(previous)) => sample.timestamp - previous >= window,
            _ => false,
        };
        if inactive {
            info!("No record for over {:?}, forcing upload", self.options.inactivity_flush);
        }

        let upload_triggered = pending >= self.options.batch_threshold || inactive;
        if upload_triggered {
            self.uploader.trigger();
        }

        Ok(SampleOutcome {
            accepted: true,
            upload_triggered,
            transitions,
        })
    }

    /// Build the record for an accepted sample.
    ///
    /// Identifiers are capture times in milliseconds; a sample at or before
    /// `floor` is moved one millisecond past it so identifiers stay unique.
    fn record_for(&self, sample: &LocationSample, floor: Option<i128>) -> (LocationRecord, i128) {
        let mut record = LocationRecord::from_sample(sample, &self.settings.access_token);

        let captured = unix_millis(sample.timestamp);
        let millis = match floor {
            Some(previous) if captured <= previous => previous + 1,
            _ => captured,
        };
        if millis != captured {
            record.id = millis_id(millis);
            record.create_date = record.id.clone();
        }
        (record, millis)
    }

    fn update_geofences(
        &mut self,
        store: &locsync_store::Store,
        sample: &LocationSample,
    ) -> Result<Transitions> {
        let changed_at = store
            .get_setting(keys::GEOFENCE_CHANGED_AT)?
            .and_then(|id| parse_timestamp_id(&id).ok());
        if let (Some(window), Some(changed_at)) = (self.options.geofence_reset_after, changed_at)
            && sample.timestamp - changed_at > window
        {
            info!("Geofences unchanged for over {:?}, resetting states", window);
            self.geofences.reset();
            store.remove_setting(keys::GEOFENCE_CHANGED_AT)?;
        }

        let was_inside = self.geofences.is_inside();
        let transitions = self.geofences.update(sample.position());
        let states =
            serde_json::to_string(&self.geofences.states()).map_err(locsync_store::Error::from)?;
        store.set_setting(keys::GEOFENCE_STATES, &states)?;

        let entered = !transitions.activated.is_empty();
        if entered || (was_inside && !self.geofences.is_inside()) {
            store.set_setting(keys::GEOFENCE_CHANGED_AT, &timestamp_id(sample.timestamp))?;
        }
        if entered && let Some(notification) = self.geofences.notification() {
            info!(
                "Entered {}: {}",
                transitions.activated.join(","),
                notification.title
            );
        }

        self.record_transitions(store, &transitions, sample.timestamp)?;
        Ok(transitions)
    }

    fn record_transitions(
        &self,
        store: &locsync_store::Store,
        transitions: &Transitions,
        at: OffsetDateTime,
    ) -> Result<()> {
        let token = &self.settings.access_token;
        if !transitions.activated.is_empty() {
            store.insert_event(&EventRecord::new(
                token,
                TRACKING_SERVICE,
                "entering geofence",
                serde_json::json!({
                    "activated_geofence_place_ids": transitions.activated.join(","),
                }),
                at,
            ))?;
        }
        if !transitions.inactivated.is_empty() {
            store.insert_event(&EventRecord::new(
                token,
                TRACKING_SERVICE,
                "exiting geofence",
                serde_json::json!({
                    "inactivated_geofence_place_ids": transitions.inactivated.join(","),
                }),
                at,
            ))?;
        }
        Ok(())
    }
}

/// Control messages for a running sampler.
#[derive(Debug)]
pub enum SamplerCommand {
    /// Restart the renewal timer.
    Rearm,
    /// Swap in new settings and geofences.
    Reconfigure {
        /// New settings.
        settings: Settings,
        /// New geofence tracker.
        geofences: GeofenceTracker,
    },
}

/// Handle to a running sampler task.
#[derive(Debug)]
pub struct SamplerHandle {
    cancel: CancellationToken,
    commands: mpsc::Sender<SamplerCommand>,
    task: JoinHandle<()>,
}

impl SamplerHandle {
    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Restart the renewal timer.
    pub async fn rearm(&self) -> bool {
        self.commands.send(SamplerCommand::Rearm).await.is_ok()
    }

    /// Swap in new settings and geofences.
    pub async fn reconfigure(&self, settings: Settings, geofences: GeofenceTracker) -> bool {
        self.commands
            .send(SamplerCommand::Reconfigure {
                settings,
                geofences,
            })
            .await
            .is_ok()
    }

    /// Cancel the task and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Sampler task ended abnormally: {}", e);
        }
    }
}

fn renewal_timer(interval: Duration) -> Interval {
    let period = interval.max(MIN_RENEWAL_PERIOD);
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// Spawn the sampling task.
pub fn spawn(
    mut processor: SampleProcessor,
    provider: Arc<dyn LocationProvider>,
    mut samples: mpsc::Receiver<LocationSample>,
) -> SamplerHandle {
    let cancel = CancellationToken::new();
    let (commands, mut command_rx) = mpsc::channel(8);

    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let mut renewal = renewal_timer(processor.gate().interval());
        info!(
            "Sampler started with {}, interval {:?}",
            provider.name(),
            processor.gate().interval()
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                sample = samples.recv() => {
                    let Some(sample) = sample else {
                        debug!("Sample channel closed");
                        break;
                    };
                    renewal.reset();
                    match processor.on_sample(sample).await {
                        Ok(outcome) if outcome.accepted => {
                            debug!("Sample accepted (upload triggered: {})", outcome.upload_triggered)
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Failed to process sample: {}", e),
                    }
                }
                Some(command) = command_rx.recv() => match command {
                    SamplerCommand::Rearm => renewal.reset(),
                    SamplerCommand::Reconfigure { settings, geofences } => {
                        match processor.reconfigure(settings, geofences) {
                            Ok(()) => renewal = renewal_timer(processor.gate().interval()),
                            Err(e) => warn!("Ignoring reconfiguration: {}", e),
                        }
                    }
                },
                _ = renewal.tick() => {
                    debug!("Renewal timer fired, requesting a fix");
                    if let Err(e) = provider.request_fix().await {
                        warn!("Fix request failed: {}", e);
                    }
                }
            }
        }

        info!("Sampler stopped");
    });

    SamplerHandle {
        cancel,
        commands,
        task,
    }
}
