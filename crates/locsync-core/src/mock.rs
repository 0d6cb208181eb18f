//! Mock location provider for testing.
//!
//! The [`MockLocationProvider`] implements the [`LocationProvider`] trait,
//! allowing it to stand in for gpsd in controller and sampler tests.
//!
//! # Features
//!
//! - **Scriptable permission**: change authorization and availability at any time
//! - **Manual delivery**: push samples as if the positioning source produced them
//! - **Scripted track**: queue samples that are emitted one per `request_fix`
//! - **Failure injection**: make `start_updates` fail
//! - **Call counters**: assert how the sampler drove the provider

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};

use locsync_types::{Authorization, Availability, LocationSample};

use crate::error::{Error, Result};
use crate::traits::LocationProvider;

/// A mock location provider for testing.
///
/// # Example
///
/// ```
/// use locsync_core::{LocationProvider, MockLocationProvider};
/// use locsync_types::{Authorization, LocationSample};
/// use time::OffsetDateTime;
/// use tokio::sync::mpsc;
///
/// #[tokio::main]
/// async fn main() {
///     let provider = MockLocationProvider::new();
///     provider.set_authorization(Authorization::AuthorizedAlways).await;
///
///     let (tx, mut rx) = mpsc::channel(4);
///     provider.start_updates(tx).await.unwrap();
///     provider.push(LocationSample::new(1.0, 2.0, OffsetDateTime::UNIX_EPOCH)).await;
///
///     assert_eq!(rx.recv().await.unwrap().latitude, 1.0);
/// }
/// ```
pub struct MockLocationProvider {
    authorization: RwLock<Authorization>,
    availability: RwLock<Availability>,
    sink: RwLock<Option<mpsc::Sender<LocationSample>>>,
    track: RwLock<VecDeque<LocationSample>>,
    should_fail: AtomicBool,
    start_count: AtomicU32,
    stop_count: AtomicU32,
    fix_requests: AtomicU32,
}

impl std::fmt::Debug for MockLocationProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLocationProvider")
            .field("start_count", &self.start_count.load(Ordering::Relaxed))
            .field("stop_count", &self.stop_count.load(Ordering::Relaxed))
            .field("fix_requests", &self.fix_requests.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MockLocationProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLocationProvider {
    /// Create a provider that is enabled but not yet authorized.
    pub fn new() -> Self {
        Self {
            authorization: RwLock::new(Authorization::NotDetermined),
            availability: RwLock::new(Availability::Enabled),
            sink: RwLock::new(None),
            track: RwLock::new(VecDeque::new()),
            should_fail: AtomicBool::new(false),
            start_count: AtomicU32::new(0),
            stop_count: AtomicU32::new(0),
            fix_requests: AtomicU32::new(0),
        }
    }

    /// Create a provider that is already authorized.
    pub fn authorized() -> Self {
        Self::with_authorization(Authorization::AuthorizedAlways)
    }

    /// Create a provider reporting the given authorization.
    pub fn with_authorization(authorization: Authorization) -> Self {
        let mut provider = Self::new();
        *provider.authorization.get_mut() = authorization;
        provider
    }

    /// Change the reported authorization.
    pub async fn set_authorization(&self, authorization: Authorization) {
        *self.authorization.write().await = authorization;
    }

    /// Change the reported availability.
    pub async fn set_availability(&self, availability: Availability) {
        *self.availability.write().await = availability;
    }

    /// Make `start_updates` fail.
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    /// Queue samples emitted one at a time on each `request_fix`.
    pub async fn set_track(&self, samples: impl IntoIterator<Item = LocationSample>) {
        *self.track.write().await = samples.into_iter().collect();
    }

    /// Deliver a sample to the current subscriber.
    ///
    /// Returns `false` when no subscription is active or the receiver is gone.
    pub async fn push(&self, sample: LocationSample) -> bool {
        let sink = self.sink.read().await.clone();
        match sink {
            Some(sink) => sink.send(sample).await.is_ok(),
            None => false,
        }
    }

    /// Whether a subscription is active.
    pub async fn is_streaming(&self) -> bool {
        self.sink.read().await.is_some()
    }

    /// Number of `start_updates` calls.
    pub fn start_count(&self) -> u32 {
        self.start_count.load(Ordering::Relaxed)
    }

    /// Number of `stop_updates` calls.
    pub fn stop_count(&self) -> u32 {
        self.stop_count.load(Ordering::Relaxed)
    }

    /// Number of `request_fix` calls.
    pub fn fix_requests(&self) -> u32 {
        self.fix_requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LocationProvider for MockLocationProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn availability(&self) -> Availability {
        *self.availability.read().await
    }

    async fn authorization(&self) -> Authorization {
        *self.authorization.read().await
    }

    async fn start_updates(&self, sink: mpsc::Sender<LocationSample>) -> Result<()> {
        self.start_count.fetch_add(1, Ordering::Relaxed);
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(Error::Provider("mock failure".to_string()));
        }
        *self.sink.write().await = Some(sink);
        Ok(())
    }

    async fn stop_updates(&self) -> Result<()> {
        self.stop_count.fetch_add(1, Ordering::Relaxed);
        *self.sink.write().await = None;
        Ok(())
    }

    async fn request_fix(&self) -> Result<()> {
        self.fix_requests.fetch_add(1, Ordering::Relaxed);
        let next = self.track.write().await.pop_front();
        if let Some(sample) = next {
            self.push(sample).await;
        }
        Ok(())
    }
}
