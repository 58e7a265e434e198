use serde::{Deserialize, Serialize};

/// Remote toggles and counters mirrored every cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub debug: bool,
    pub logging_to_file: bool,
    pub usage_statistics_enabled: bool,
    pub request_log: bool,
    pub ws_auth: bool,
    pub switch_project: bool,
    pub switch_preview_model: bool,
    pub request_retry: i64,
    pub max_retry_interval: i64,
}

impl Settings {
    pub fn get(&self, key: SettingKey) -> SettingValue {
        match key {
            SettingKey::Debug => SettingValue::Bool(self.debug),
            SettingKey::LoggingToFile => SettingValue::Bool(self.logging_to_file),
            SettingKey::UsageStatisticsEnabled => {
                SettingValue::Bool(self.usage_statistics_enabled)
            }
            SettingKey::RequestLog => SettingValue::Bool(self.request_log),
            SettingKey::WsAuth => SettingValue::Bool(self.ws_auth),
            SettingKey::SwitchProject => SettingValue::Bool(self.switch_project),
            SettingKey::SwitchPreviewModel => SettingValue::Bool(self.switch_preview_model),
            SettingKey::RequestRetry => SettingValue::Int(self.request_retry),
            SettingKey::MaxRetryInterval => SettingValue::Int(self.max_retry_interval),
        }
    }

    pub fn set(&mut self, key: SettingKey, value: SettingValue) {
        match (key, value) {
            (SettingKey::Debug, SettingValue::Bool(v)) => self.debug = v,
            (SettingKey::LoggingToFile, SettingValue::Bool(v)) => self.logging_to_file = v,
            (SettingKey::UsageStatisticsEnabled, SettingValue::Bool(v)) => {
                self.usage_statistics_enabled = v
            }
            (SettingKey::RequestLog, SettingValue::Bool(v)) => self.request_log = v,
            (SettingKey::WsAuth, SettingValue::Bool(v)) => self.ws_auth = v,
            (SettingKey::SwitchProject, SettingValue::Bool(v)) => self.switch_project = v,
            (SettingKey::SwitchPreviewModel, SettingValue::Bool(v)) => {
                self.switch_preview_model = v
            }
            (SettingKey::RequestRetry, SettingValue::Int(v)) => self.request_retry = v,
            (SettingKey::MaxRetryInterval, SettingValue::Int(v)) => self.max_retry_interval = v,
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
}

impl std::fmt::Display for SettingValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Bool,
    Int,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    Debug,
    LoggingToFile,
    UsageStatisticsEnabled,
    RequestLog,
    WsAuth,
    SwitchProject,
    SwitchPreviewModel,
    RequestRetry,
    MaxRetryInterval,
}

impl SettingKey {
    /// All settings in the order a cycle reads them.
    pub fn all() -> &'static [SettingKey] {
        &[
            SettingKey::Debug,
            SettingKey::LoggingToFile,
            SettingKey::UsageStatisticsEnabled,
            SettingKey::RequestLog,
            SettingKey::WsAuth,
            SettingKey::SwitchProject,
            SettingKey::SwitchPreviewModel,
            SettingKey::RequestRetry,
            SettingKey::MaxRetryInterval,
        ]
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id.to_lowercase().replace('-', "_").as_str() {
            "debug" => Some(Self::Debug),
            "logging_to_file" => Some(Self::LoggingToFile),
            "usage_statistics_enabled" => Some(Self::UsageStatisticsEnabled),
            "request_log" => Some(Self::RequestLog),
            "ws_auth" => Some(Self::WsAuth),
            "switch_project" => Some(Self::SwitchProject),
            "switch_preview_model" => Some(Self::SwitchPreviewModel),
            "request_retry" => Some(Self::RequestRetry),
            "max_retry_interval" => Some(Self::MaxRetryInterval),
            _ => None,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::LoggingToFile => "logging_to_file",
            Self::UsageStatisticsEnabled => "usage_statistics_enabled",
            Self::RequestLog => "request_log",
            Self::WsAuth => "ws_auth",
            Self::SwitchProject => "switch_project",
            Self::SwitchPreviewModel => "switch_preview_model",
            Self::RequestRetry => "request_retry",
            Self::MaxRetryInterval => "max_retry_interval",
        }
    }

    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::Debug => "/debug",
            Self::LoggingToFile => "/logging-to-file",
            Self::UsageStatisticsEnabled => "/usage-statistics-enabled",
            Self::RequestLog => "/request-log",
            Self::WsAuth => "/ws-auth",
            Self::SwitchProject => "/quota-exceeded/switch-project",
            Self::SwitchPreviewModel => "/quota-exceeded/switch-preview-model",
            Self::RequestRetry => "/request-retry",
            Self::MaxRetryInterval => "/max-retry-interval",
        }
    }

    /// Field carrying the value in the endpoint's GET response.
    pub fn field(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::LoggingToFile => "logging-to-file",
            Self::UsageStatisticsEnabled => "usage-statistics-enabled",
            Self::RequestLog => "request-log",
            Self::WsAuth => "ws-auth",
            Self::SwitchProject => "switch-project",
            Self::SwitchPreviewModel => "switch-preview-model",
            Self::RequestRetry => "request-retry",
            Self::MaxRetryInterval => "max-retry-interval",
        }
    }

    pub fn kind(&self) -> SettingKind {
        match self {
            Self::RequestRetry | Self::MaxRetryInterval => SettingKind::Int,
            _ => SettingKind::Bool,
        }
    }

    /// Accepted range for integer settings.
    pub fn range(&self) -> Option<(i64, i64)> {
        match self {
            Self::RequestRetry => Some((0, 10)),
            Self::MaxRetryInterval => Some((1, 600)),
            _ => None,
        }
    }

    /// Parse a user-supplied value for this setting.
    pub fn parse_value(&self, raw: &str) -> Result<SettingValue, String> {
        let raw = raw.trim();
        match self.kind() {
            SettingKind::Bool => match raw.to_lowercase().as_str() {
                "true" | "on" | "1" | "yes" => Ok(SettingValue::Bool(true)),
                "false" | "off" | "0" | "no" => Ok(SettingValue::Bool(false)),
                _ => Err(format!("'{}' expects on/off, got '{}'", self.id(), raw)),
            },
            SettingKind::Int => {
                // Number inputs may arrive as floats; the remote takes whole values.
                let value = raw
                    .parse::<i64>()
                    .ok()
                    .or_else(|| raw.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v as i64))
                    .ok_or_else(|| format!("'{}' expects an integer, got '{}'", self.id(), raw))?;
                if let Some((min, max)) = self.range() {
                    if value < min || value > max {
                        return Err(format!(
                            "'{}' must be between {} and {}, got {}",
                            self.id(),
                            min,
                            max,
                            value
                        ));
                    }
                }
                Ok(SettingValue::Int(value))
            }
        }
    }
}
