use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::core::client::strip_management_path;
use crate::core::coordinator::{
    clamp_poll_interval, CoordinatorOptions, DEFAULT_POLL_INTERVAL_SECONDS,
    MAX_POLL_INTERVAL_SECONDS, MIN_POLL_INTERVAL_SECONDS,
};

/// Overrides `server.management_key` when set and non-empty.
pub const MANAGEMENT_KEY_ENV: &str = "CPB_MANAGEMENT_KEY";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub management_key: String,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8317".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            management_key: String::new(),
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("base_url", &self.base_url)
            .field("management_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    #[serde(default)]
    pub log_diagnostics: bool,
    #[serde(default)]
    pub request_error_logs: bool,
}

fn default_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECONDS
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            log_diagnostics: false,
            request_error_logs: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub polling: PollingConfig,
}

impl AppConfig {
    /// Get the config file path, respecting XDG_CONFIG_HOME
    pub fn config_path() -> PathBuf {
        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("~"))
                    .join(".config")
            });
        config_dir.join("cpb").join("config.toml")
    }

    /// Load config from the default path, falling back to defaults if not found.
    /// The management key env override is applied afterwards.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        if let Ok(key) = std::env::var(MANAGEMENT_KEY_ENV) {
            config.apply_key_override(&key);
        }
        Ok(config)
    }

    fn apply_key_override(&mut self, key: &str) {
        if !key.trim().is_empty() {
            self.server.management_key = key.trim().to_string();
        }
    }

    /// Serialize and write this config to the config file path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(path)
    }

    pub fn base_url(&self) -> Result<String, ConfigError> {
        normalize_base_url(&self.server.base_url)
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions::new(
            self.polling.interval_seconds,
            self.polling.log_diagnostics,
            self.polling.request_error_logs,
        )
    }

    /// The config as JSON, for the diagnostics dump. Redaction happens there.
    pub fn to_entry(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Validate the config
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if let Err(e) = self.base_url() {
            issues.push(e.to_string());
        }
        if self.server.management_key.trim().is_empty() {
            issues.push(format!(
                "management_key is empty (set it in the config or via {})",
                MANAGEMENT_KEY_ENV
            ));
        }
        let interval = self.polling.interval_seconds;
        if clamp_poll_interval(interval) != interval {
            issues.push(format!(
                "interval_seconds {} is outside {}..={} and will be clamped",
                interval, MIN_POLL_INTERVAL_SECONDS, MAX_POLL_INTERVAL_SECONDS
            ));
        }
        issues
    }
}

/// Reduce user input to `scheme://host[:port]`.
///
/// A missing scheme defaults to `http`, and a pasted `/v0/management` suffix
/// or any other path is dropped.
pub fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidBaseUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let value = raw.trim();
    if value.is_empty() {
        return Err(invalid("empty base url"));
    }
    let value = if value.contains("://") {
        value.to_string()
    } else {
        format!("http://{}", value)
    };
    let value = strip_management_path(&value);

    let url = Url::parse(&value).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("unsupported scheme"));
    }
    let host = match url.host_str() {
        Some(host) if !host.is_empty() => host,
        _ => return Err(invalid("missing host")),
    };

    Ok(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}
