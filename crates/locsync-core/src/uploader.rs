//! Batch upload of pending records to the remote API.
//!
//! The uploader reads the oldest pending records together with the current
//! settings, posts them as one JSON batch and removes exactly the identifiers
//! the server confirms. Anything other than `200` with an `ids_saved` list
//! leaves the store untouched; those records go out with the next batch.
//!
//! ```text
//! POST {api_url}gps-coordinates/save-coordinates
//! {"coordinates": [{"client_database_id": ..., ...}], "token": "..."}
//!
//! 200 {"ids_saved": ["1700000000.250", ...]}
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::Client;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use locsync_store::{Store, keys};
use locsync_types::Settings;

use crate::error::{Error, Result};

/// Store handle shared between the sampler, the uploader and the controller.
pub type SharedStore = Arc<Mutex<Store>>;

/// Path of the coordinate upload endpoint, relative to the API base URL.
pub const COORDINATES_PATH: &str = "gps-coordinates/save-coordinates";

/// Path of the event upload endpoint, relative to the API base URL.
pub const EVENTS_PATH: &str = "logging/save-event";

/// Upload tuning.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Most records sent in one request.
    pub max_batch_size: usize,
    /// Pending count at which another batch is sent in the same pass.
    pub batch_threshold: u64,
    /// Pending event count at which another event batch is sent.
    pub event_batch_threshold: u64,
    /// Per-request timeout; `None` keeps the HTTP client default.
    pub timeout: Option<Duration>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 30,
            batch_threshold: 5,
            event_batch_threshold: 5,
            timeout: None,
        }
    }
}

/// Result of one upload pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadOutcome {
    /// Another pass was already running, nothing was sent.
    pub skipped: bool,
    /// Requests that completed successfully.
    pub batches: usize,
    /// Items sent in successful requests.
    pub sent: usize,
    /// Items removed from the store.
    pub removed: usize,
}

impl UploadOutcome {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct SaveResponse {
    ids_saved: Vec<SavedId>,
}

/// Servers echo identifiers as strings, some as numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SavedId {
    Text(String),
    Number(f64),
}

impl SavedId {
    fn into_id(self) -> String {
        match self {
            SavedId::Text(id) => id,
            SavedId::Number(n) => format!("{n:.3}"),
        }
    }
}

/// Clears an in-flight flag when dropped.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Coordinates,
    Events,
}

impl Kind {
    fn path(self) -> &'static str {
        match self {
            Kind::Coordinates => COORDINATES_PATH,
            Kind::Events => EVENTS_PATH,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Kind::Coordinates => "location",
            Kind::Events => "event",
        }
    }
}

struct Inner {
    client: Client,
    store: SharedStore,
    options: UploadOptions,
    coordinates_in_flight: AtomicBool,
    events_in_flight: AtomicBool,
}

/// Sends pending records and events to the remote API.
///
/// Cloning is cheap; clones share the HTTP client and the single-flight
/// guards, so at most one coordinate pass and one event pass run at a time.
#[derive(Clone)]
pub struct Uploader {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("options", &self.inner.options)
            .field("in_flight", &self.is_in_flight())
            .finish()
    }
}

impl Uploader {
    /// Create an uploader over a shared store.
    pub fn new(store: SharedStore, options: UploadOptions) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;
        Ok(Self::with_client(store, options, client))
    }

    /// Create an uploader with a custom reqwest Client.
    pub fn with_client(store: SharedStore, options: UploadOptions, client: Client) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                store,
                options,
                coordinates_in_flight: AtomicBool::new(false),
                events_in_flight: AtomicBool::new(false),
            }),
        }
    }

    /// Upload options.
    pub fn options(&self) -> &UploadOptions {
        &self.inner.options
    }

    /// Whether a coordinate upload is running.
    pub fn is_in_flight(&self) -> bool {
        self.inner.coordinates_in_flight.load(Ordering::Acquire)
    }

    /// Upload pending location records.
    ///
    /// Sends the oldest batch; after a successful request, keeps sending
    /// while the pending count stays at or above the batch threshold.
    pub async fn send(&self) -> Result<UploadOutcome> {
        self.run(Kind::Coordinates).await
    }

    /// Upload pending audit events.
    pub async fn send_events(&self) -> Result<UploadOutcome> {
        self.run(Kind::Events).await
    }

    /// Start a coordinate upload in the background.
    ///
    /// Returns `false` without spawning when an upload is already running.
    /// Failures are logged; the records stay pending.
    pub fn trigger(&self) -> bool {
        self.spawn(Kind::Coordinates)
    }

    /// Start an event upload in the background.
    pub fn trigger_events(&self) -> bool {
        self.spawn(Kind::Events)
    }

    fn flag(&self, kind: Kind) -> &AtomicBool {
        match kind {
            Kind::Coordinates => &self.inner.coordinates_in_flight,
            Kind::Events => &self.inner.events_in_flight,
        }
    }

    fn spawn(&self, kind: Kind) -> bool {
        if self.flag(kind).load(Ordering::Acquire) {
            debug!("{} upload already in flight, skipping", kind.label());
            return false;
        }

        let uploader = self.clone();
        tokio::spawn(async move {
            match uploader.run(kind).await {
                Ok(outcome) if outcome.skipped => {
                    debug!("{} upload already in flight, skipped", kind.label())
                }
                Ok(outcome) => info!(
                    "Uploaded {} {} item(s) in {} batch(es)",
                    outcome.removed,
                    kind.label(),
                    outcome.batches
                ),
                Err(e) => warn!("{} upload failed: {}", kind.label(), e),
            }
        });
        true
    }

    async fn run(&self, kind: Kind) -> Result<UploadOutcome> {
        let Some(_guard) = FlightGuard::acquire(self.flag(kind)) else {
            return Ok(UploadOutcome::skipped());
        };

        let threshold = match kind {
            Kind::Coordinates => self.inner.options.batch_threshold,
            Kind::Events => self.inner.options.event_batch_threshold,
        };

        let mut outcome = UploadOutcome::default();
        loop {
            let (settings, user_agent, items, ids) = {
                let store = self.inner.store.lock().await;
                let settings = store
                    .load_settings()?
                    .ok_or(Error::NotInitialized("API settings are not stored"))?;
                let user_agent = store.get_setting(keys::USER_AGENT)?;
                let (items, ids) = self.batch(&store, kind)?;
                (settings, user_agent, items, ids)
            };

            if ids.is_empty() {
                break;
            }

            let body = match kind {
                Kind::Coordinates => serde_json::json!({
                    "coordinates": items,
                    "token": settings.access_token,
                }),
                Kind::Events => serde_json::json!({
                    "events": items,
                    "token": settings.access_token,
                }),
            };

            let saved = self
                .post(&settings, user_agent.as_deref(), kind.path(), &body)
                .await?;

            let (removed, remaining) = {
                let store = self.inner.store.lock().await;
                match kind {
                    Kind::Coordinates => (store.remove_by_ids(&saved)?, store.count()?),
                    Kind::Events => (store.remove_events_by_ids(&saved)?, store.count_events()?),
                }
            };

            outcome.batches += 1;
            outcome.sent += ids.len();
            outcome.removed += removed;
            debug!(
                "{} batch: sent {}, removed {}, {} pending",
                kind.label(),
                ids.len(),
                removed,
                remaining
            );

            // Nothing confirmed means the next pass would resend the same batch
            if removed == 0 || remaining < threshold {
                break;
            }
        }

        Ok(outcome)
    }

    fn batch(&self, store: &Store, kind: Kind) -> Result<(serde_json::Value, Vec<String>)> {
        let max = self.inner.options.max_batch_size;
        Ok(match kind {
            Kind::Coordinates => {
                let records = store.first_n(max)?;
                let ids = records.iter().map(|r| r.id.clone()).collect();
                (serde_json::to_value(records).map_err(locsync_store::Error::from)?, ids)
            }
            Kind::Events => {
                let events = store.first_n_events(max)?;
                let ids = events.iter().map(|e| e.id.clone()).collect();
                (serde_json::to_value(events).map_err(locsync_store::Error::from)?, ids)
            }
        })
    }

    async fn post(
        &self,
        settings: &Settings,
        user_agent: Option<&str>,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<Vec<String>> {
        let url = endpoint(&settings.api_base_url, path);

        let mut request = self
            .inner
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .json(body);
        if let Some(user_agent) = user_agent.filter(|ua| !ua.is_empty()) {
            request = request.header(USER_AGENT, user_agent);
        }

        debug!("POST {}", url);
        let response = request.send().await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::Api {
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await?;
        let parsed: SaveResponse = serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;

        Ok(parsed.ids_saved.into_iter().map(SavedId::into_id).collect())
    }
}

/// Join an API base URL and an endpoint path.
///
/// A separating `/` is added when the base URL lacks one.
pub fn endpoint(base_url: &str, path: &str) -> String {
    if base_url.ends_with('/') {
        format!("{base_url}{path}")
    } else {
        format!("{base_url}/{path}")
    }
}
