//! Presentation points: sensors, switches, numbers and buttons read from the
//! latest snapshot, plus the redacted diagnostics dump.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::core::coordinator::{Coordinator, CoordinatorStatus, UpdateFailure};
use crate::core::error::ApiError;
use crate::core::models::settings::{SettingKey, SettingKind};
use crate::core::models::snapshot::Snapshot;
use crate::core::models::usage::UsageCounters;

/// Keys whose values never leave the process unredacted.
pub const REDACTED_KEYS: &[&str] = &[
    "management_key",
    "Authorization",
    "X-Management-Key",
    "api-key",
    "cookie",
];

pub const REDACTED: &str = "**REDACTED**";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sensor {
    TotalRequests,
    SuccessCount,
    FailureCount,
    FailedRequests,
    ErrorRate,
    TotalTokens,
    LatestVersion,
    KeyUsageEntries,
    LogLineCount,
    LatestLogTimestamp,
    RequestErrorLogFiles,
}

impl Sensor {
    pub fn all() -> &'static [Sensor] {
        &[
            Sensor::TotalRequests,
            Sensor::SuccessCount,
            Sensor::FailureCount,
            Sensor::FailedRequests,
            Sensor::ErrorRate,
            Sensor::TotalTokens,
            Sensor::LatestVersion,
            Sensor::KeyUsageEntries,
            Sensor::LogLineCount,
            Sensor::LatestLogTimestamp,
            Sensor::RequestErrorLogFiles,
        ]
    }

    pub fn key(&self) -> &'static str {
        match self {
            Self::TotalRequests => "total_requests",
            Self::SuccessCount => "success_count",
            Self::FailureCount => "failure_count",
            Self::FailedRequests => "failed_requests",
            Self::ErrorRate => "error_rate",
            Self::TotalTokens => "total_tokens",
            Self::LatestVersion => "latest_version",
            Self::KeyUsageEntries => "key_usage_entries",
            Self::LogLineCount => "log_line_count",
            Self::LatestLogTimestamp => "latest_log_timestamp",
            Self::RequestErrorLogFiles => "request_error_log_files",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::TotalRequests => "Total requests",
            Self::SuccessCount => "Successful",
            Self::FailureCount => "Failures",
            Self::FailedRequests => "Failed requests",
            Self::ErrorRate => "Error rate",
            Self::TotalTokens => "Total tokens",
            Self::LatestVersion => "Latest version",
            Self::KeyUsageEntries => "Keys in use",
            Self::LogLineCount => "Log lines",
            Self::LatestLogTimestamp => "Latest log",
            Self::RequestErrorLogFiles => "Error log files",
        }
    }

    pub fn unit(&self) -> Option<&'static str> {
        match self {
            Self::TotalRequests
            | Self::SuccessCount
            | Self::FailureCount
            | Self::FailedRequests => Some("requests"),
            Self::ErrorRate => Some("%"),
            Self::TotalTokens => Some("tokens"),
            Self::KeyUsageEntries => Some("keys"),
            Self::LogLineCount => Some("lines"),
            Self::RequestErrorLogFiles => Some("files"),
            Self::LatestVersion | Self::LatestLogTimestamp => None,
        }
    }

    pub fn value(&self, snapshot: &Snapshot) -> Value {
        match self {
            Self::TotalRequests => json!(counters(snapshot).total_requests.unwrap_or(0)),
            Self::SuccessCount => json!(counters(snapshot).success_count.unwrap_or(0)),
            Self::FailureCount => json!(counters(snapshot).failure_count.unwrap_or(0)),
            Self::FailedRequests => json!(snapshot.failed_requests),
            Self::ErrorRate => json!(error_rate(snapshot)),
            Self::TotalTokens => json!(counters(snapshot).total_tokens.unwrap_or(0)),
            Self::LatestVersion => snapshot
                .latest_version
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
            Self::KeyUsageEntries => json!(snapshot.key_usage.len()),
            Self::LogLineCount => json!(snapshot.logs.line_count),
            Self::LatestLogTimestamp => latest_log_timestamp(snapshot)
                .map(|ts| Value::String(ts.to_rfc3339()))
                .unwrap_or(Value::Null),
            Self::RequestErrorLogFiles => json!(snapshot.request_error_logs.len()),
        }
    }

    /// Log sensors are only meaningful while their diagnostics flag is on.
    pub fn available(&self, snapshot: &Snapshot) -> bool {
        match self {
            Self::LogLineCount | Self::LatestLogTimestamp => {
                snapshot.diagnostics_enabled.log_diagnostics
            }
            Self::RequestErrorLogFiles => snapshot.diagnostics_enabled.request_error_logs,
            _ => true,
        }
    }
}

fn counters(snapshot: &Snapshot) -> UsageCounters {
    UsageCounters::from_usage(&snapshot.usage)
}

/// Failure percentage over all requests, rounded to two places.
pub fn error_rate(snapshot: &Snapshot) -> f64 {
    let counters = counters(snapshot);
    match (counters.total_requests, counters.failure_count) {
        (Some(total), Some(failures)) if total > 0 => {
            (failures as f64 / total as f64 * 10_000.0).round() / 100.0
        }
        _ => 0.0,
    }
}

pub fn latest_log_timestamp(snapshot: &Snapshot) -> Option<DateTime<Utc>> {
    match snapshot.logs.latest_timestamp {
        ts if ts <= 0 => None,
        ts => DateTime::from_timestamp(ts, 0),
    }
}

/// Stable id fragment for an auth index: runs of anything outside
/// `[A-Za-z0-9_]` become `_`, edges trimmed, lowercased.
pub fn sanitize_unique_fragment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_run = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c.to_ascii_lowercase());
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn key_sensor_id(auth_index: &str) -> String {
    format!("key_usage_{}_requests", sanitize_unique_fragment(auth_index))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PointKind {
    Sensor,
    BinarySensor,
    Switch,
    Number,
}

/// One rendered point value.
#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub key: String,
    pub label: String,
    pub kind: PointKind,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
    pub available: bool,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl Reading {
    fn new(key: impl Into<String>, label: impl Into<String>, kind: PointKind, value: Value) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            kind,
            value,
            unit: None,
            available: true,
            attributes: Map::new(),
        }
    }
}

/// Per-key request sensors, one per auth index in the snapshot.
pub fn key_readings(snapshot: &Snapshot) -> Vec<Reading> {
    snapshot
        .key_usage
        .iter()
        .map(|(auth_index, usage)| {
            let label: String = auth_index.chars().take(8).collect();
            let mut reading = Reading::new(
                key_sensor_id(auth_index),
                format!("Key {} requests", label),
                PointKind::Sensor,
                json!(usage.requests),
            );
            reading.unit = Some("requests");
            reading.attributes.insert("auth_index".into(), json!(auth_index));
            reading.attributes.insert("tokens".into(), json!(usage.tokens));
            reading
                .attributes
                .insert("failed_requests".into(), json!(usage.failed));
            reading
                .attributes
                .insert("success_requests".into(), json!(usage.success_requests()));
            reading
        })
        .collect()
}

/// Every point for the current snapshot. `reachable` reflects the outcome of
/// the latest cycle.
pub fn readings(snapshot: &Snapshot, reachable: bool) -> Vec<Reading> {
    let mut out: Vec<Reading> = Sensor::all()
        .iter()
        .map(|sensor| {
            let mut reading = Reading::new(
                sensor.key(),
                sensor.label(),
                PointKind::Sensor,
                sensor.value(snapshot),
            );
            reading.unit = sensor.unit();
            reading.available = sensor.available(snapshot);
            reading
        })
        .collect();

    out.extend(key_readings(snapshot));
    out.push(Reading::new(
        "reachable",
        "Reachable",
        PointKind::BinarySensor,
        json!(reachable),
    ));

    for key in SettingKey::all() {
        let control = Control(*key);
        let mut reading = Reading::new(
            key.id(),
            control.label(),
            control.kind(),
            serde_json::to_value(snapshot.settings.get(*key)).unwrap_or(Value::Null),
        );
        if let Some((min, max)) = key.range() {
            reading.attributes.insert("min".into(), json!(min));
            reading.attributes.insert("max".into(), json!(max));
            reading.unit = control.unit();
        }
        out.push(reading);
    }
    out
}

/// A writable point bound to one remote setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control(pub SettingKey);

impl Control {
    pub fn from_key(key: &str) -> Option<Self> {
        SettingKey::from_id(key).map(Control)
    }

    pub fn key(&self) -> &'static str {
        self.0.id()
    }

    pub fn kind(&self) -> PointKind {
        match self.0.kind() {
            SettingKind::Bool => PointKind::Switch,
            SettingKind::Int => PointKind::Number,
        }
    }

    pub fn label(&self) -> &'static str {
        match self.0 {
            SettingKey::Debug => "Debug",
            SettingKey::LoggingToFile => "Logging to file",
            SettingKey::UsageStatisticsEnabled => "Usage statistics",
            SettingKey::RequestLog => "Request log",
            SettingKey::WsAuth => "WebSocket auth",
            SettingKey::SwitchProject => "Switch project on quota",
            SettingKey::SwitchPreviewModel => "Switch preview model on quota",
            SettingKey::RequestRetry => "Request retry",
            SettingKey::MaxRetryInterval => "Max retry interval",
        }
    }

    pub fn unit(&self) -> Option<&'static str> {
        match self.0 {
            SettingKey::MaxRetryInterval => Some("s"),
            SettingKey::RequestRetry => Some("retries"),
            _ => None,
        }
    }

    /// Validate `raw`, write it to the remote, and schedule a refresh.
    pub async fn write(&self, coordinator: &Coordinator, raw: &str) -> Result<(), ControlError> {
        let value = self.0.parse_value(raw).map_err(ControlError::Invalid)?;
        coordinator.write_setting(self.0, value).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("Refresh failed: {0}")]
    Refresh(UpdateFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    ClearLogs,
    Refresh,
}

impl Button {
    pub fn all() -> &'static [Button] {
        &[Button::ClearLogs, Button::Refresh]
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key.to_lowercase().replace('-', "_").as_str() {
            "clear_logs" => Some(Self::ClearLogs),
            "refresh" => Some(Self::Refresh),
            _ => None,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            Self::ClearLogs => "clear_logs",
            Self::Refresh => "refresh",
        }
    }

    pub async fn press(&self, coordinator: &Coordinator) -> Result<(), ControlError> {
        match self {
            Self::ClearLogs => coordinator.clear_logs().await?,
            Self::Refresh => {
                coordinator.refresh().await.map_err(ControlError::Refresh)?;
            }
        }
        Ok(())
    }
}

/// Replace the value of every [`REDACTED_KEYS`] entry, at any depth.
pub fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map.iter_mut() {
                if REDACTED_KEYS.contains(&key.as_str()) {
                    *inner = Value::String(REDACTED.to_string());
                } else {
                    redact(inner);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {}
    }
}

/// Config plus coordinator state, safe to paste into a bug report.
pub fn diagnostics(
    entry: Value,
    snapshot: Option<&Snapshot>,
    status: &CoordinatorStatus,
) -> Value {
    let mut payload = json!({
        "entry": entry,
        "coordinator_status": status,
        "coordinator_data": snapshot.map(Snapshot::to_value).unwrap_or(Value::Null),
    });
    redact(&mut payload);
    payload
}
