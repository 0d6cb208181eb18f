//! Agent configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use locsync_core::{ControllerOptions, GpsdOptions, SamplerOptions, UploadOptions};
use locsync_types::Authorization;

/// Agent configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bridge server settings.
    pub server: ServerConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Location provider settings.
    pub provider: ProviderConfig,
    /// Batch upload settings.
    pub upload: UploadConfig,
    /// Monitoring settings.
    pub monitor: MonitorConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return any errors.
    ///
    /// This checks:
    /// - Bind and gpsd addresses are in `host:port` format
    /// - Storage path is not empty
    /// - The provider authorization is a known name
    /// - Batch sizes and thresholds are at least 1
    /// - The maintenance interval is within bounds (10s - 1 day)
    ///
    /// # Example
    ///
    /// ```
    /// use locsync_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.storage.validate());
        errors.extend(self.provider.validate());
        errors.extend(self.upload.validate());
        errors.extend(self.monitor.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Options for the monitoring controller.
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            sampler: SamplerOptions {
                batch_threshold: self.upload.batch_threshold,
                inactivity_flush: self.monitor.inactivity_flush(),
                geofence_event_threshold: self.monitor.geofence_event_threshold,
                geofence_reset_after: self.monitor.geofence_reset_after(),
            },
            status_event_threshold: self.monitor.status_event_threshold,
            capture_timeout: self.monitor.capture_timeout(),
        }
    }
}

/// Bridge server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl ServerConfig {
    /// Validate server configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        validate_address("server.bind", &self.bind)
            .into_iter()
            .collect()
    }
}

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: locsync_store::default_db_path(),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.path".to_string(),
                message: "database path cannot be empty".to_string(),
            });
        }

        errors
    }
}

/// Source of location fixes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Fixes from a gpsd daemon.
    #[default]
    Gpsd,
    /// Fixes pushed by tests; never produces data on its own.
    Mock,
}

/// Location provider configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Which provider to use.
    pub kind: ProviderKind,
    /// gpsd `host:port`.
    pub gpsd_address: String,
    /// Seconds to wait before reconnecting to gpsd.
    pub reconnect_delay_secs: u64,
    /// Permission reported to the controller (`granted`, `always`,
    /// `when_in_use`, `denied`, ...).
    pub authorization: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            gpsd_address: locsync_core::gpsd::DEFAULT_GPSD_ADDRESS.to_string(),
            reconnect_delay_secs: 5,
            authorization: "granted".to_string(),
        }
    }
}

impl ProviderConfig {
    /// Validate provider configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.kind == ProviderKind::Gpsd {
            errors.extend(validate_address("provider.gpsd_address", &self.gpsd_address));
            if self.reconnect_delay_secs == 0 {
                errors.push(ValidationError {
                    field: "provider.reconnect_delay_secs".to_string(),
                    message: "reconnect delay must be at least 1 second".to_string(),
                });
            }
        }

        if let Err(e) = self.authorization.parse::<Authorization>() {
            errors.push(ValidationError {
                field: "provider.authorization".to_string(),
                message: e.to_string(),
            });
        }

        errors
    }

    /// Parsed authorization, `NotDetermined` if the name is unknown.
    pub fn authorization(&self) -> Authorization {
        self.authorization.parse().unwrap_or_default()
    }

    /// Options for a [`locsync_core::GpsdProvider`].
    pub fn gpsd_options(&self) -> GpsdOptions {
        GpsdOptions {
            address: self.gpsd_address.clone(),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            authorization: self.authorization(),
            ..GpsdOptions::default()
        }
    }
}

/// Batch upload configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Pending record count that triggers an upload.
    pub batch_threshold: u64,
    /// Most records sent in one request.
    pub max_batch_size: usize,
    /// Pending event count that keeps an event upload going.
    pub event_batch_threshold: u64,
    /// Per-request timeout in seconds; omitted means no timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        let options = UploadOptions::default();
        Self {
            batch_threshold: options.batch_threshold,
            max_batch_size: options.max_batch_size,
            event_batch_threshold: options.event_batch_threshold,
            timeout_secs: None,
        }
    }
}

impl UploadConfig {
    /// Validate upload configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.batch_threshold == 0 {
            errors.push(at_least_one("upload.batch_threshold"));
        }
        if self.max_batch_size == 0 {
            errors.push(at_least_one("upload.max_batch_size"));
        }
        if self.event_batch_threshold == 0 {
            errors.push(at_least_one("upload.event_batch_threshold"));
        }
        if self.timeout_secs == Some(0) {
            errors.push(ValidationError {
                field: "upload.timeout_secs".to_string(),
                message: "timeout must be at least 1 second (omit for no timeout)".to_string(),
            });
        }

        errors
    }

    /// Options for the [`locsync_core::Uploader`].
    pub fn options(&self) -> UploadOptions {
        UploadOptions {
            max_batch_size: self.max_batch_size,
            batch_threshold: self.batch_threshold,
            event_batch_threshold: self.event_batch_threshold,
            timeout: self.timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Minimum maintenance interval in seconds.
pub const MIN_MAINTENANCE_INTERVAL: u64 = 10;
/// Maximum maintenance interval in seconds (1 day).
pub const MAX_MAINTENANCE_INTERVAL: u64 = 86_400;

/// Monitoring configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Upload below the threshold when the previous record is this old.
    /// `0` disables the inactivity flush.
    pub inactivity_flush_secs: u64,
    /// Seconds between maintenance passes.
    pub maintenance_interval_secs: u64,
    /// Pending event count that triggers an upload after geofence events.
    pub geofence_event_threshold: u64,
    /// Pending event count that triggers an upload after a status change.
    pub status_event_threshold: u64,
    /// Seconds a maintenance pass waits for its one-shot fix.
    pub capture_timeout_secs: u64,
    /// Reset geofence states when the last entry (or exit from the last
    /// fence) is this old. `0` never resets.
    pub geofence_reset_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            inactivity_flush_secs: 2 * 60 * 60,
            maintenance_interval_secs: 15 * 60,
            geofence_event_threshold: 5,
            status_event_threshold: 1,
            capture_timeout_secs: 30,
            geofence_reset_secs: 24 * 60 * 60,
        }
    }
}

impl MonitorConfig {
    /// Validate monitoring configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.maintenance_interval_secs < MIN_MAINTENANCE_INTERVAL {
            errors.push(ValidationError {
                field: "monitor.maintenance_interval_secs".to_string(),
                message: format!(
                    "maintenance interval {} is too short (minimum {} seconds)",
                    self.maintenance_interval_secs, MIN_MAINTENANCE_INTERVAL
                ),
            });
        } else if self.maintenance_interval_secs > MAX_MAINTENANCE_INTERVAL {
            errors.push(ValidationError {
                field: "monitor.maintenance_interval_secs".to_string(),
                message: format!(
                    "maintenance interval {} is too long (maximum {} seconds / 1 day)",
                    self.maintenance_interval_secs, MAX_MAINTENANCE_INTERVAL
                ),
            });
        }
        if self.geofence_event_threshold == 0 {
            errors.push(at_least_one("monitor.geofence_event_threshold"));
        }
        if self.status_event_threshold == 0 {
            errors.push(at_least_one("monitor.status_event_threshold"));
        }
        if self.capture_timeout_secs == 0 {
            errors.push(at_least_one("monitor.capture_timeout_secs"));
        }

        errors
    }

    /// Inactivity flush, `None` when disabled.
    pub fn inactivity_flush(&self) -> Option<Duration> {
        (self.inactivity_flush_secs > 0).then(|| Duration::from_secs(self.inactivity_flush_secs))
    }

    /// Interval between maintenance passes.
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    /// How long a one-shot capture waits for a fix.
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    /// Geofence state reset window, `None` when disabled.
    pub fn geofence_reset_after(&self) -> Option<Duration> {
        (self.geofence_reset_secs > 0).then(|| Duration::from_secs(self.geofence_reset_secs))
    }
}

fn at_least_one(field: &str) -> ValidationError {
    ValidationError {
        field: field.to_string(),
        message: "must be at least 1".to_string(),
    }
}

fn validate_address(field: &str, address: &str) -> Option<ValidationError> {
    if address.is_empty() {
        return Some(ValidationError {
            field: field.to_string(),
            message: "address cannot be empty".to_string(),
        });
    }

    let Some((_, port)) = address.rsplit_once(':') else {
        return Some(ValidationError {
            field: field.to_string(),
            message: format!("invalid address '{}': expected format 'host:port'", address),
        });
    };

    match port.parse::<u16>() {
        Ok(0) => Some(ValidationError {
            field: field.to_string(),
            message: "port cannot be 0".to_string(),
        }),
        Err(_) => Some(ValidationError {
            field: field.to_string(),
            message: format!("invalid port '{}': must be a number 1-65535", port),
        }),
        Ok(_) => None,
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path (e.g., `server.bind` or `upload.max_batch_size`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("locsync")
        .join("agent.toml")
}
