//! Server settings and validation.
//!
//! Settings are read from an optional JSON file. Every field is optional so
//! a partial file (or none at all) falls back to the defaults below.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default bind address for the control server.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default control server port; engine subprocess ports are offsets from it.
pub const DEFAULT_PORT: u16 = 39281;

const DEFAULT_STREAM_WORKERS: usize = 2;
const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 1000;
const DEFAULT_HEALTH_CHECK_MAX_PROBES: u32 = 60;
const DEFAULT_MAX_PORT_ATTEMPTS: u16 = 100;
const DEFAULT_LIVENESS_INTERVAL_SECS: u64 = 10;
const DEFAULT_UV_PATH: &str = "uv";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,

    /// Streaming relay workers per subprocess engine (2-4).
    pub stream_workers: Option<usize>,

    /// Delay between startup health probes.
    pub health_check_interval_ms: Option<u64>,

    /// Probes before a starting model is declared failed.
    pub health_check_max_probes: Option<u32>,

    /// Upper bound on port offsets scanned per load.
    pub max_port_attempts: Option<u16>,

    /// Period of the background crash sweep.
    pub liveness_interval_secs: Option<u64>,

    /// `uv` executable used by Python-based engines.
    pub uv_path: Option<String>,

    /// Preferred variant per engine name.
    pub default_variants: BTreeMap<String, String>,
}

impl ServerSettings {
    /// Create settings with sensible defaults.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            host: Some(DEFAULT_HOST.to_string()),
            port: Some(DEFAULT_PORT),
            stream_workers: Some(DEFAULT_STREAM_WORKERS),
            health_check_interval_ms: Some(DEFAULT_HEALTH_CHECK_INTERVAL_MS),
            health_check_max_probes: Some(DEFAULT_HEALTH_CHECK_MAX_PROBES),
            max_port_attempts: Some(DEFAULT_MAX_PORT_ATTEMPTS),
            liveness_interval_secs: Some(DEFAULT_LIVENESS_INTERVAL_SECS),
            uv_path: Some(DEFAULT_UV_PATH.to_string()),
            default_variants: BTreeMap::new(),
        }
    }

    pub fn effective_host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    pub const fn effective_port(&self) -> u16 {
        match self.port {
            Some(port) => port,
            None => DEFAULT_PORT,
        }
    }

    /// Stream workers clamped to the supported 2-4 range.
    pub fn effective_stream_workers(&self) -> usize {
        self.stream_workers
            .unwrap_or(DEFAULT_STREAM_WORKERS)
            .clamp(2, 4)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(
            self.health_check_interval_ms
                .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL_MS),
        )
    }

    pub fn effective_health_check_max_probes(&self) -> u32 {
        self.health_check_max_probes
            .unwrap_or(DEFAULT_HEALTH_CHECK_MAX_PROBES)
    }

    pub fn effective_max_port_attempts(&self) -> u16 {
        self.max_port_attempts.unwrap_or(DEFAULT_MAX_PORT_ATTEMPTS)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(
            self.liveness_interval_secs
                .unwrap_or(DEFAULT_LIVENESS_INTERVAL_SECS),
        )
    }

    pub fn effective_uv_path(&self) -> PathBuf {
        PathBuf::from(self.uv_path.as_deref().unwrap_or(DEFAULT_UV_PATH))
    }
}

/// Settings load/validation error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SettingsError {
    #[error("Port should be >= 1024 (privileged ports require root), got {0}")]
    InvalidPort(u16),

    #[error("Stream workers must be between 2 and 4, got {0}")]
    InvalidStreamWorkers(usize),

    #[error("Health check interval must be between 10ms and 60s, got {0}ms")]
    InvalidHealthCheckInterval(u64),

    #[error("Health check probe budget must be at least 1")]
    InvalidProbeBudget,

    #[error("Port attempts must be between 1 and 1000, got {0}")]
    InvalidPortAttempts(u16),

    #[error("Failed to read settings file {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Failed to parse settings file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Validate settings values.
pub fn validate_settings(settings: &ServerSettings) -> Result<(), SettingsError> {
    if let Some(port) = settings.port {
        if port < 1024 {
            return Err(SettingsError::InvalidPort(port));
        }
    }

    if let Some(workers) = settings.stream_workers {
        if !(2..=4).contains(&workers) {
            return Err(SettingsError::InvalidStreamWorkers(workers));
        }
    }

    if let Some(interval) = settings.health_check_interval_ms {
        if !(10..=60_000).contains(&interval) {
            return Err(SettingsError::InvalidHealthCheckInterval(interval));
        }
    }

    if settings.health_check_max_probes == Some(0) {
        return Err(SettingsError::InvalidProbeBudget);
    }

    if let Some(attempts) = settings.max_port_attempts {
        if !(1..=1000).contains(&attempts) {
            return Err(SettingsError::InvalidPortAttempts(attempts));
        }
    }

    Ok(())
}

/// Load settings from `path`, layering file values over the defaults.
///
/// A missing file is not an error; the defaults are returned.
pub fn load_settings(path: Option<&Path>) -> Result<ServerSettings, SettingsError> {
    let mut settings = ServerSettings::with_defaults();
    let Some(path) = path else {
        return Ok(settings);
    };
    if !path.exists() {
        tracing::debug!(path = %path.display(), "Settings file not found, using defaults");
        return Ok(settings);
    }

    let raw = std::fs::read_to_string(path).map_err(|e| SettingsError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let file: ServerSettings = serde_json::from_str(&raw).map_err(|e| SettingsError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    settings.overlay(file);
    validate_settings(&settings)?;
    Ok(settings)
}

impl ServerSettings {
    fn overlay(&mut self, other: Self) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.stream_workers.is_some() {
            self.stream_workers = other.stream_workers;
        }
        if other.health_check_interval_ms.is_some() {
            self.health_check_interval_ms = other.health_check_interval_ms;
        }
        if other.health_check_max_probes.is_some() {
            self.health_check_max_probes = other.health_check_max_probes;
        }
        if other.max_port_attempts.is_some() {
            self.max_port_attempts = other.max_port_attempts;
        }
        if other.liveness_interval_secs.is_some() {
            self.liveness_interval_secs = other.liveness_interval_secs;
        }
        if other.uv_path.is_some() {
            self.uv_path = other.uv_path;
        }
        self.default_variants.extend(other.default_variants);
    }
}
