//! Bridge endpoints for the host application.
//!
//! Every command of the monitoring controller is exposed as one route and
//! answers with a bare JSON value (`true`, `null`, a string, a position)
//! so host bindings can map results without unwrapping an envelope.
//!
//! # Error Handling
//!
//! Failures return a JSON object `{"error": "..."}` via [`AppError`]:
//!
//! | Cause | Status |
//! |-------|--------|
//! | Invalid settings or geofences | 400 |
//! | Command needs `initialize` first | 409 |
//! | Local database failure | 500 |
//! | Provider or other internal failure | 500 |
//!
//! # Example
//!
//! ```ignore
//! use locsync_service::api;
//!
//! let app = api::router().with_state(state);
//! ```

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;

use locsync_core::InitOptions;
use locsync_types::Position;

use crate::state::AppState;

/// Create the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        // Health and status
        .route("/api/health", get(health))
        .route("/api/status", get(get_status))
        // Commands
        .route("/api/initialize", post(initialize))
        .route("/api/start", post(start))
        .route("/api/stop", post(stop))
        .route("/api/clear-settings", post(clear_settings))
        // Queries
        .route("/api/last-position", get(last_position))
        .route("/api/monitoring-status", get(monitoring_status))
        .route("/api/permission-status", get(permission_status))
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Health check endpoint.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: OffsetDateTime::now_utc(),
    })
}

/// Agent status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Whether a sampler is running.
    pub active: bool,
    /// Location records waiting for upload.
    pub pending_locations: u64,
    /// Audit events waiting for upload.
    pub pending_events: u64,
    /// Monitoring status string.
    pub monitoring_status: String,
    /// Permission status string.
    pub permission_status: String,
}

async fn get_status(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, AppError> {
    let controller = &state.controller;
    let monitoring_status = controller.monitoring_status().await;
    let permission_status = controller.permission_status().await;

    let (pending_locations, pending_events) = {
        let store = controller.store().lock().await;
        (store.count()?, store.count_events()?)
    };

    Ok(Json(StatusResponse {
        active: controller.is_active().await,
        pending_locations,
        pending_events,
        monitoring_status,
        permission_status,
    }))
}

async fn initialize(
    State(state): State<Arc<AppState>>,
    Json(options): Json<InitOptions>,
) -> Result<Json<bool>, AppError> {
    state.controller.initialize(options).await?;
    Ok(Json(true))
}

async fn start(State(state): State<Arc<AppState>>) -> Result<Json<bool>, AppError> {
    let started = state.controller.start().await?;
    if !started {
        debug!("Start refused, location permission not granted");
    }
    Ok(Json(started))
}

async fn stop(State(state): State<Arc<AppState>>) -> Result<Json<()>, AppError> {
    state.controller.stop().await?;
    Ok(Json(()))
}

async fn clear_settings(State(state): State<Arc<AppState>>) -> Result<Json<bool>, AppError> {
    state.controller.clear_settings().await?;
    Ok(Json(true))
}

async fn last_position(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Option<Position>>, AppError> {
    Ok(Json(state.controller.last_position().await?))
}

async fn monitoring_status(State(state): State<Arc<AppState>>) -> Json<String> {
    Json(state.controller.monitoring_status().await)
}

async fn permission_status(State(state): State<Arc<AppState>>) -> Json<String> {
    Json(state.controller.permission_status().await)
}

/// API error type.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Conflict(String),
    Store(locsync_store::Error),
    Internal(String),
}

impl From<locsync_store::Error> for AppError {
    fn from(e: locsync_store::Error) -> Self {
        AppError::Store(e)
    }
}

impl From<locsync_core::Error> for AppError {
    fn from(e: locsync_core::Error) -> Self {
        match e {
            locsync_core::Error::Store(e) => AppError::Store(e),
            locsync_core::Error::InvalidSettings(_) | locsync_core::Error::Geofence(_) => {
                AppError::BadRequest(e.to_string())
            }
            locsync_core::Error::NotInitialized(_) => AppError::Conflict(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use locsync_core::{LocationProvider, MockLocationProvider, SamplerState};
    use locsync_store::{LocationRecord, Store};
    use locsync_types::{Authorization, Availability, LocationSample};

    use crate::config::Config;

    fn create_test_state(provider: Arc<MockLocationProvider>) -> Arc<AppState> {
        let store = Store::open_in_memory().unwrap();
        let provider: Arc<dyn LocationProvider> = provider;
        AppState::with_provider(store, Config::default(), provider).unwrap()
    }

    fn authorized_state() -> Arc<AppState> {
        create_test_state(Arc::new(MockLocationProvider::authorized()))
    }

    fn init_body() -> Value {
        json!({
            "api_url": "http://127.0.0.1:1/v1/",
            "access_token": "token-1",
            "tracking_frequency_milliseconds": 10_000,
        })
    }

    async fn response_body(response: axum::response::Response) -> String {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn call(
        state: &Arc<AppState>,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let app = router().with_state(Arc::clone(state));
        let request = match body {
            Some(body) => Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        };

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = response_body(response).await;
        (status, serde_json::from_str(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let state = authorized_state();
        let (status, json) = call(&state, "GET", "/api/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert!(json["version"].is_string());
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_initialize_returns_true_and_stores_settings() {
        let state = authorized_state();
        let mut body = init_body();
        body["user_agent"] = json!("locsync-test/1.0");

        let (status, json) = call(&state, "POST", "/api/initialize", Some(body)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, json!(true));
        let store = state.controller.store().lock().await;
        let settings = store.load_settings().unwrap().unwrap();
        assert_eq!(settings.api_base_url, "http://127.0.0.1:1/v1/");
        assert_eq!(settings.sample_interval_ms, Some(10_000));
        assert_eq!(
            store.get_setting(locsync_store::keys::USER_AGENT).unwrap(),
            Some("locsync-test/1.0".to_string())
        );
    }

    #[tokio::test]
    async fn test_initialize_rejects_invalid_settings() {
        let state = authorized_state();
        let mut body = init_body();
        body["access_token"] = json!("");

        let (status, json) = call(&state, "POST", "/api/initialize", Some(body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("access_token"));
        assert!(
            state
                .controller
                .store()
                .lock()
                .await
                .load_settings()
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_initialize_rejects_malformed_geofences() {
        let state = authorized_state();
        let mut body = init_body();
        body["geofences"] = json!({
            "circular_geofences": {
                "home": {"center": {"lat": 43.07, "lon": -89.40}, "radius": "far"}
            }
        });

        let (status, json) = call(&state, "POST", "/api/initialize", Some(body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("geofence home"));
    }

    #[tokio::test]
    async fn test_start_before_initialize_conflicts() {
        let state = authorized_state();
        let (status, json) = call(&state, "POST", "/api/start", None).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["error"].as_str().unwrap().contains("Not initialized"));
        assert_eq!(state.controller.state().await, SamplerState::Stopped);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let provider = Arc::new(MockLocationProvider::authorized());
        let state = create_test_state(Arc::clone(&provider));
        call(&state, "POST", "/api/initialize", Some(init_body())).await;

        let (status, json) = call(&state, "POST", "/api/start", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, json!(true));
        assert!(state.controller.is_active().await);
        assert!(provider.is_streaming().await);

        let (status, json) = call(&state, "POST", "/api/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, Value::Null);
        assert!(!state.controller.is_active().await);
        assert_eq!(provider.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_start_without_permission_returns_false() {
        let provider = Arc::new(MockLocationProvider::with_authorization(
            Authorization::Denied,
        ));
        let state = create_test_state(Arc::clone(&provider));
        call(&state, "POST", "/api/initialize", Some(init_body())).await;

        let (status, json) = call(&state, "POST", "/api/start", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, json!(false));
        assert_eq!(provider.start_count(), 0);
        assert!(!state.controller.is_active().await);
    }

    #[tokio::test]
    async fn test_stop_when_idle_returns_null() {
        let state = authorized_state();
        let (status, json) = call(&state, "POST", "/api/stop", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, Value::Null);
    }

    #[tokio::test]
    async fn test_last_position() {
        let state = authorized_state();
        let (status, json) = call(&state, "GET", "/api/last-position", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, Value::Null);

        {
            let ts = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
            let sample = LocationSample::new(43.07, -89.40, ts);
            let store = state.controller.store().lock().await;
            store
                .append(&LocationRecord::from_sample(&sample, "token-1"))
                .unwrap();
        }

        let (status, json) = call(&state, "GET", "/api/last-position", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, json!({"latitude": 43.07, "longitude": -89.40}));
    }

    #[tokio::test]
    async fn test_status_strings() {
        let provider = Arc::new(MockLocationProvider::new());
        let state = create_test_state(Arc::clone(&provider));

        let (_, json) = call(&state, "GET", "/api/monitoring-status", None).await;
        assert_eq!(json, json!("gps enabled"));
        let (_, json) = call(&state, "GET", "/api/permission-status", None).await;
        assert_eq!(json, json!("not granted"));

        provider.set_availability(Availability::Disabled).await;
        provider
            .set_authorization(Authorization::AuthorizedWhenInUse)
            .await;

        let (_, json) = call(&state, "GET", "/api/monitoring-status", None).await;
        assert_eq!(json, json!("gps not enabled"));
        let (_, json) = call(&state, "GET", "/api/permission-status", None).await;
        assert_eq!(json, json!("granted, always when in use"));
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let state = authorized_state();
        {
            let store = state.controller.store().lock().await;
            for i in 0..3 {
                let ts = OffsetDateTime::from_unix_timestamp(1_700_000_000 + i).unwrap();
                let sample = LocationSample::new(43.07, -89.40, ts);
                store
                    .append(&LocationRecord::from_sample(&sample, "token-1"))
                    .unwrap();
            }
        }

        let (status, json) = call(&state, "GET", "/api/status", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["active"], false);
        assert_eq!(json["pending_locations"], 3);
        assert_eq!(json["pending_events"], 0);
        assert_eq!(json["monitoring_status"], "gps enabled");
        assert_eq!(json["permission_status"], "granted, always");
    }

    #[tokio::test]
    async fn test_clear_settings() {
        let state = authorized_state();
        call(&state, "POST", "/api/initialize", Some(init_body())).await;
        call(&state, "POST", "/api/start", None).await;
        {
            let ts = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
            let sample = LocationSample::new(43.07, -89.40, ts);
            let store = state.controller.store().lock().await;
            store
                .append(&LocationRecord::from_sample(&sample, "token-1"))
                .unwrap();
        }

        let (status, json) = call(&state, "POST", "/api/clear-settings", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, json!(true));
        assert!(!state.controller.is_active().await);
        let store = state.controller.store().lock().await;
        assert_eq!(store.count().unwrap(), 0);
        assert!(store.load_settings().unwrap().is_none());
    }

    #[test]
    fn test_app_error_mapping() {
        let cases = [
            (
                AppError::from(locsync_core::Error::InvalidSettings("bad".to_string())),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::from(locsync_core::Error::NotInitialized("no settings")),
                StatusCode::CONFLICT,
            ),
            (
                AppError::from(locsync_core::Error::Provider("gpsd gone".to_string())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                AppError::Internal("boom".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
