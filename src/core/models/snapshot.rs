use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::core::models::settings::Settings;
use crate::core::models::usage::{KeyUsage, ModelTokenUsage};

/// Incremental log pull as included in a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogsSection {
    pub lines: Vec<String>,
    #[serde(rename = "line-count")]
    pub line_count: i64,
    #[serde(rename = "latest-timestamp")]
    pub latest_timestamp: i64,
}

impl LogsSection {
    /// Section used when logs were skipped or the pull failed.
    pub fn empty(cursor: i64) -> Self {
        Self {
            lines: Vec::new(),
            line_count: 0,
            latest_timestamp: cursor,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsEnabled {
    pub log_diagnostics: bool,
    pub request_error_logs: bool,
}

/// Immutable result of one polling cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub usage: Map<String, Value>,
    pub failed_requests: i64,
    pub key_usage: BTreeMap<String, KeyUsage>,
    pub model_token_usage: BTreeMap<String, ModelTokenUsage>,
    pub settings: Settings,
    pub latest_version: Option<String>,
    pub logs: LogsSection,
    pub request_error_logs: Vec<Value>,
    pub diagnostics_enabled: DiagnosticsEnabled,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Read a value by dotted path, e.g. `settings.debug` or
    /// `key_usage[k1].requests`.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let root = self.to_value();
        let mut current = &root;
        for segment in parse_path(path)? {
            current = match current {
                Value::Object(map) => map.get(&segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }
}

/// Split `a.b[c].d` into `["a", "b", "c", "d"]`.
fn parse_path(path: &str) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.trim().chars();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                let mut index = String::new();
                loop {
                    match chars.next()? {
                        ']' => break,
                        ch => index.push(ch),
                    }
                }
                let index = index.trim().trim_matches(|ch| ch == '"' || ch == '\'');
                segments.push(index.to_string());
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments)
    }
}
