//! Trait abstractions for location providers.
//!
//! This module provides the [`LocationProvider`] trait that abstracts over
//! real positioning sources (gpsd) and mock providers for testing.

use async_trait::async_trait;
use tokio::sync::mpsc;

use locsync_types::{Authorization, Availability, LocationSample};

use crate::error::Result;

/// Trait abstracting a source of location fixes.
///
/// Providers push samples into the channel handed to
/// [`start_updates`](LocationProvider::start_updates); the sampler consumes
/// them on a single task, so implementations never call back into the
/// sampler directly.
///
/// # Example
///
/// ```ignore
/// use locsync_core::{LocationProvider, Result};
/// use tokio::sync::mpsc;
///
/// async fn first_fix<P: LocationProvider>(provider: &P) -> Result<()> {
///     let (tx, mut rx) = mpsc::channel(16);
///     provider.start_updates(tx).await?;
///     if let Some(sample) = rx.recv().await {
///         println!("{}, {}", sample.latitude, sample.longitude);
///     }
///     provider.stop_updates().await
/// }
/// ```
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Whether the positioning source can deliver fixes.
    async fn availability(&self) -> Availability;

    /// Authorization currently granted to this process.
    async fn authorization(&self) -> Authorization;

    /// Begin delivering samples into `sink`.
    ///
    /// Calling this again replaces the previous subscription.
    async fn start_updates(&self, sink: mpsc::Sender<LocationSample>) -> Result<()>;

    /// Stop delivering samples. Stopping an idle provider is a no-op.
    async fn stop_updates(&self) -> Result<()>;

    /// Ask for a fresh fix outside the provider's own schedule.
    ///
    /// The default implementation does nothing, for providers that stream
    /// continuously.
    async fn request_fix(&self) -> Result<()> {
        Ok(())
    }
}
