use std::path::PathBuf;
use std::time::Duration;

use crate::storage::TOKEN_STORAGE_KEY;

pub const DEFAULT_ENDPOINT: &str = "http://localhost:8080";
pub const DEFAULT_API_PREFIX: &str = "/api/v1";
pub const ENV_ENDPOINT: &str = "SITEPOD_ENDPOINT";
pub const ENV_ENDPOINT_LEGACY: &str = "SITEPOD_CONSOLE_ENDPOINT";
pub const ENV_STATE_DIR: &str = "SITEPOD_CONSOLE_HOME";
pub const ENDPOINT_SOURCE_EXPLICIT: &str = "explicit";
pub const ENDPOINT_SOURCE_DEFAULT: &str = "default_local";
const STATE_DIR_NAME: &str = ".sitepod";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("endpoint must not be empty")]
    EmptyEndpoint,
    #[error("endpoint must use http:// or https:// and include a host")]
    InvalidEndpoint,
    #[error("no state directory: set SITEPOD_CONSOLE_HOME or HOME")]
    StateDirUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleClientConfig {
    pub endpoint: String,
    pub api_prefix: String,
    pub token_storage_key: String,
    pub request_timeout_ms: Option<u64>,
}

impl ConsoleClientConfig {
    pub fn new(endpoint: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            endpoint: normalize_endpoint(endpoint)?,
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            token_storage_key: TOKEN_STORAGE_KEY.to_string(),
            request_timeout_ms: None,
        })
    }

    #[must_use]
    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = Some(timeout_ms);
        self
    }

    /// Absolute URL for a server-rooted path such as `/api/v1/auth/info`.
    #[must_use]
    pub fn server_url(&self, path: &str) -> String {
        join_path(&self.endpoint, path)
    }

    /// Base every gateway path is resolved against.
    #[must_use]
    pub fn api_base(&self) -> String {
        join_path(&self.endpoint, &self.api_prefix)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

pub(crate) fn join_path(base: &str, path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        base.to_string()
    } else if trimmed.starts_with('/') {
        format!("{base}{trimmed}")
    } else {
        format!("{base}/{trimmed}")
    }
}

/// Picks the endpoint from an explicit value, then the env vars, then the
/// local default. Returns the winning source alongside the value.
pub fn resolve_endpoint(explicit: Option<&str>) -> Result<(String, &'static str), ConfigError> {
    if let Some(endpoint) = explicit.map(str::trim).filter(|value| !value.is_empty()) {
        return normalize_endpoint(endpoint).map(|normalized| (normalized, ENDPOINT_SOURCE_EXPLICIT));
    }
    if let Some(endpoint) = env_non_empty(ENV_ENDPOINT) {
        return normalize_endpoint(&endpoint).map(|normalized| (normalized, ENV_ENDPOINT));
    }
    if let Some(endpoint) = env_non_empty(ENV_ENDPOINT_LEGACY) {
        return normalize_endpoint(&endpoint).map(|normalized| (normalized, ENV_ENDPOINT_LEGACY));
    }
    normalize_endpoint(DEFAULT_ENDPOINT).map(|normalized| (normalized, ENDPOINT_SOURCE_DEFAULT))
}

pub fn resolve_state_dir(explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    if let Some(dir) = explicit {
        return Ok(dir);
    }
    if let Some(dir) = env_non_empty(ENV_STATE_DIR) {
        return Ok(PathBuf::from(dir));
    }
    env_non_empty("HOME")
        .map(|home| PathBuf::from(home).join(STATE_DIR_NAME))
        .ok_or(ConfigError::StateDirUnavailable)
}

pub fn normalize_endpoint(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyEndpoint);
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ConfigError::InvalidEndpoint);
    }
    let Some((_, remainder)) = trimmed.split_once("://") else {
        return Err(ConfigError::InvalidEndpoint);
    };
    if remainder.trim().is_empty() || remainder.starts_with('/') {
        return Err(ConfigError::InvalidEndpoint);
    }
    Ok(trimmed.to_string())
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
}
