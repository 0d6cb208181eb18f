//! Periodic background maintenance.
//!
//! Each pass persists monitoring and permission status changes, records one
//! fix when monitoring is not running, and flushes whatever location records
//! and events are still pending, so data recorded below the batch threshold
//! does not sit in the store indefinitely.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use locsync_core::{MonitoringController, UploadOutcome};

use crate::state::AppState;

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// A status change was recorded.
    pub status_changed: bool,
    /// A one-shot fix was stored.
    pub location_captured: bool,
    /// Location records confirmed and removed.
    pub locations_removed: usize,
    /// Events confirmed and removed.
    pub events_removed: usize,
}

/// Background task running [`run_once`] on the configured interval.
pub struct Maintenance {
    state: Arc<AppState>,
}

impl Maintenance {
    /// Create a maintenance task.
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Spawn the maintenance loop.
    ///
    /// The first pass runs one interval after start. Returns immediately;
    /// the loop ends when `cancel` fires.
    pub async fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.state.config.read().await.monitor.maintenance_interval();
        info!("Starting maintenance every {}s", period.as_secs());

        tokio::spawn(async move {
            self.run(period, cancel).await;
        })
    }

    async fn run(self, period: Duration, cancel: CancellationToken) {
        let mut timer = interval_at(tokio::time::Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Maintenance stopped");
                    return;
                }
                _ = timer.tick() => {
                    let report = run_once(&self.state.controller).await;
                    debug!("Maintenance pass: {:?}", report);
                }
            }
        }
    }
}

/// Run a single maintenance pass.
///
/// Failures are logged and never abort the pass.
pub async fn run_once(controller: &MonitoringController) -> MaintenanceReport {
    let mut report = MaintenanceReport::default();

    match controller.record_status_change().await {
        Ok(change) => report.status_changed = change.changed,
        Err(e) => warn!("Failed to record status change: {}", e),
    }

    let initialized = match controller.store().lock().await.load_settings() {
        Ok(settings) => settings.is_some(),
        Err(e) => {
            warn!("Failed to load settings: {}", e);
            false
        }
    };
    if !initialized {
        debug!("Not initialized, skipping capture and upload");
        return report;
    }

    match controller.capture_once().await {
        Ok(Some(outcome)) => report.location_captured = outcome.accepted,
        Ok(None) => {}
        Err(e) => warn!("One-shot capture failed: {}", e),
    }

    let (locations, events) = {
        let store = controller.store().lock().await;
        (store.count(), store.count_events())
    };

    if matches!(locations, Ok(n) if n > 0) {
        report.locations_removed = flush("location", controller.uploader().send().await);
    }
    if matches!(events, Ok(n) if n > 0) {
        report.events_removed = flush("event", controller.uploader().send_events().await);
    }

    report
}

fn flush(label: &str, result: locsync_core::Result<UploadOutcome>) -> usize {
    match result {
        Ok(outcome) if outcome.skipped => {
            debug!("{} upload already in flight", label);
            0
        }
        Ok(outcome) => {
            if outcome.removed > 0 {
                info!("Maintenance uploaded {} {}(s)", outcome.removed, label);
            }
            outcome.removed
        }
        Err(e) => {
            warn!("Maintenance {} upload failed: {}", label, e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::Json;
    use axum::Router;
    use axum::routing::post;
    use serde_json::{Value, json};
    use time::OffsetDateTime;

    use locsync_core::{InitOptions, MockLocationProvider};
    use locsync_store::{LocationRecord, Store};
    use locsync_types::LocationSample;

    use crate::config::Config;

    fn create_test_state() -> Arc<AppState> {
        create_test_state_with(Arc::new(MockLocationProvider::authorized()))
    }

    fn create_test_state_with(provider: Arc<MockLocationProvider>) -> Arc<AppState> {
        let store = Store::open_in_memory().unwrap();
        let mut config = Config::default();
        // The mock has no fix unless a track is set
        config.monitor.capture_timeout_secs = 1;
        AppState::with_provider(store, config, provider).unwrap()
    }

    /// Serve an API that confirms every id it receives.
    async fn confirming_server() -> String {
        async fn confirm(Json(body): Json<Value>) -> Json<Value> {
            let ids: Vec<Value> = ["coordinates", "events"]
                .iter()
                .filter_map(|key| body.get(*key))
                .flat_map(|items| items.as_array().cloned().unwrap_or_default())
                .map(|item| item["client_database_id"].clone())
                .collect();
            Json(json!({ "ids_saved": ids }))
        }

        let app = Router::new()
            .route("/v1/gps-coordinates/save-coordinates", post(confirm))
            .route("/v1/logging/save-event", post(confirm));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1/")
    }

    async fn initialize(state: &AppState, api_url: &str) {
        state
            .controller
            .initialize(InitOptions {
                api_url: api_url.to_string(),
                access_token: "token-1".to_string(),
                tracking_frequency_milliseconds: 10_000,
                ..InitOptions::default()
            })
            .await
            .unwrap();
    }

    async fn append_records(state: &AppState, n: usize) {
        let store = state.controller.store().lock().await;
        for i in 0..n {
            let ts = OffsetDateTime::from_unix_timestamp(1_700_000_000 + i as i64).unwrap();
            let sample = LocationSample::new(43.07, -89.40, ts);
            store
                .append(&LocationRecord::from_sample(&sample, "token-1"))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_run_once_records_status_once() {
        let state = create_test_state();

        let first = run_once(&state.controller).await;
        assert!(first.status_changed);
        assert_eq!(first.locations_removed, 0);

        let second = run_once(&state.controller).await;
        assert!(!second.status_changed);
    }

    #[tokio::test]
    async fn test_run_once_skips_upload_when_not_initialized() {
        let state = create_test_state();
        append_records(&state, 2).await;

        let report = run_once(&state.controller).await;
        assert_eq!(report.locations_removed, 0);
        assert_eq!(state.controller.store().lock().await.count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_run_once_flushes_below_threshold() {
        let state = create_test_state();
        let url = confirming_server().await;
        initialize(&state, &url).await;
        append_records(&state, 2).await;

        let report = run_once(&state.controller).await;

        assert!(report.status_changed);
        assert_eq!(report.locations_removed, 2);
        assert_eq!(state.controller.store().lock().await.count().unwrap(), 0);

        // The status change event goes out either here or in the upload
        // triggered by the change itself
        let mut pending_events = 1;
        for _ in 0..50 {
            pending_events = state.controller.store().lock().await.count_events().unwrap();
            if pending_events == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(pending_events, 0);
        assert!(report.events_removed <= 1);
    }

    #[tokio::test]
    async fn test_run_once_keeps_records_on_failure() {
        let state = create_test_state();
        initialize(&state, "http://127.0.0.1:1/v1/").await;
        append_records(&state, 3).await;

        let report = run_once(&state.controller).await;

        assert_eq!(report.locations_removed, 0);
        assert_eq!(state.controller.store().lock().await.count().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_run_once_captures_a_fix() {
        let provider = Arc::new(MockLocationProvider::authorized());
        let state = create_test_state_with(provider.clone());
        initialize(&state, "http://127.0.0.1:1/v1/").await;
        let now = OffsetDateTime::now_utc();
        provider
            .set_track([LocationSample::new(43.07, -89.40, now)])
            .await;

        let report = run_once(&state.controller).await;

        assert!(report.location_captured);
        assert_eq!(report.locations_removed, 0);
        assert_eq!(provider.fix_requests(), 1);
        assert!(!provider.is_streaming().await);
        assert!(!state.controller.is_active().await);

        // Upload fails, so the captured fix stays queued
        let store = state.controller.store().lock().await;
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(
            store.latest().unwrap().unwrap().id,
            locsync_types::timestamp_id(now)
        );
    }

    #[tokio::test]
    async fn test_run_once_does_not_capture_while_monitoring() {
        let provider = Arc::new(MockLocationProvider::authorized());
        let state = create_test_state_with(provider.clone());
        initialize(&state, "http://127.0.0.1:1/v1/").await;
        assert!(state.controller.start().await.unwrap());

        let report = run_once(&state.controller).await;

        assert!(!report.location_captured);
        assert_eq!(provider.start_count(), 1);
        assert_eq!(provider.fix_requests(), 0);
        state.controller.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_loop_stops_on_cancel() {
        let state = create_test_state();
        let cancel = CancellationToken::new();

        let handle = Maintenance::new(Arc::clone(&state))
            .start(cancel.clone())
            .await;
        tokio::time::sleep(Duration::from_secs(15 * 60 + 1)).await;
        tokio::task::yield_now().await;

        cancel.cancel();
        handle.await.unwrap();

        let store = state.controller.store().lock().await;
        assert!(
            store
                .get_service_status(locsync_core::controller::MONITORING_SERVICE)
                .unwrap()
                .is_some()
        );
    }
}
