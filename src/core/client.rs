use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

use crate::core::error::ApiError;
use crate::core::models::settings::{SettingKey, SettingKind, SettingValue};

pub const API_BASE_PATH: &str = "/v0/management";
pub const REQUEST_TIMEOUT_SECONDS: u64 = 15;

const ENDPOINT_USAGE: &str = "/usage";
const ENDPOINT_LATEST_VERSION: &str = "/latest-version";
const ENDPOINT_LOGS: &str = "/logs";
const ENDPOINT_REQUEST_ERROR_LOGS: &str = "/request-error-logs";

/// Operations the coordinator and the write paths need from the remote.
///
/// Only the safe subset of the management API is exposed: there is no way
/// to rotate the management key, change the port, upload auth files or start
/// OAuth logins through this trait.
#[async_trait]
pub trait ManagementApi: Send + Sync {
    async fn get_usage(&self) -> Result<Map<String, Value>, ApiError>;

    async fn get_latest_version(&self) -> Result<Map<String, Value>, ApiError>;

    async fn get_setting(&self, key: SettingKey) -> Result<SettingValue, ApiError>;

    async fn set_setting(&self, key: SettingKey, value: SettingValue) -> Result<(), ApiError>;

    /// Fetch log lines newer than `after`.
    async fn get_logs(&self, after: i64) -> Result<Map<String, Value>, ApiError>;

    /// Clear current and rotated logs.
    async fn clear_logs(&self) -> Result<Map<String, Value>, ApiError>;

    async fn get_request_error_logs(&self) -> Result<Map<String, Value>, ApiError>;

    /// Check that the remote is reachable with the configured key.
    async fn validate(&self) -> Result<(), ApiError> {
        self.get_setting(SettingKey::Debug).await.map(|_| ())
    }
}

/// HTTP client for the CLIProxyAPI management endpoints.
pub struct ManagementClient {
    client: reqwest::Client,
    base_url: String,
    management_key: String,
}

impl std::fmt::Debug for ManagementClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementClient")
            .field("base_url", &self.base_url)
            .field("management_key", &"**REDACTED**")
            .finish()
    }
}

impl ManagementClient {
    pub fn new(base_url: &str, management_key: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_timeout(
            base_url,
            management_key,
            Duration::from_secs(REQUEST_TIMEOUT_SECONDS),
        )
    }

    /// A client whose requests give up after `timeout`, reported as a
    /// connection failure.
    pub fn with_timeout(
        base_url: &str,
        management_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: strip_management_path(base_url),
            management_key: management_key.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}{}", self.base_url, API_BASE_PATH, endpoint)
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        query: Option<String>,
        payload: Option<Value>,
    ) -> Result<Map<String, Value>, ApiError> {
        let mut url = self.url(endpoint);
        if let Some(query) = query {
            url.push('?');
            url.push_str(&query);
        }
        debug!(method = %method, endpoint, "management request");

        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(&self.management_key)
            .header("X-Management-Key", &self.management_key)
            .header(CONTENT_TYPE, "application/json");
        if let Some(payload) = payload {
            request = request.json(&payload);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        let data = parse_body(&body);

        if status.is_success() {
            return Ok(data);
        }

        let message = error_message(&data);
        debug!(status = status.as_u16(), endpoint, %message, "management request rejected");
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ApiError::Authentication(message));
        }
        Err(ApiError::Request {
            status: status.as_u16(),
            message,
        })
    }

    async fn get(&self, endpoint: &str) -> Result<Map<String, Value>, ApiError> {
        self.request(Method::GET, endpoint, None, None).await
    }
}

#[async_trait]
impl ManagementApi for ManagementClient {
    async fn get_usage(&self) -> Result<Map<String, Value>, ApiError> {
        self.get(ENDPOINT_USAGE).await
    }

    async fn get_latest_version(&self) -> Result<Map<String, Value>, ApiError> {
        self.get(ENDPOINT_LATEST_VERSION).await
    }

    async fn get_setting(&self, key: SettingKey) -> Result<SettingValue, ApiError> {
        let payload = self.get(key.endpoint()).await?;
        let field = payload.get(key.field()).unwrap_or(&Value::Null);
        match key.kind() {
            SettingKind::Bool => Ok(SettingValue::Bool(truthy(field))),
            SettingKind::Int => {
                let value = if field.is_null() && !payload.contains_key(key.field()) {
                    Some(0)
                } else {
                    as_int(field)
                };
                value.map(SettingValue::Int).ok_or_else(|| ApiError::Malformed {
                    endpoint: key.endpoint().to_string(),
                    detail: format!("'{}' is not an integer: {}", key.field(), field),
                })
            }
        }
    }

    async fn set_setting(&self, key: SettingKey, value: SettingValue) -> Result<(), ApiError> {
        self.request(
            Method::PATCH,
            key.endpoint(),
            None,
            Some(json!({ "value": value })),
        )
        .await
        .map(|_| ())
    }

    async fn get_logs(&self, after: i64) -> Result<Map<String, Value>, ApiError> {
        self.request(Method::GET, ENDPOINT_LOGS, Some(format!("after={}", after)), None)
            .await
    }

    async fn clear_logs(&self) -> Result<Map<String, Value>, ApiError> {
        self.request(Method::DELETE, ENDPOINT_LOGS, None, None).await
    }

    async fn get_request_error_logs(&self) -> Result<Map<String, Value>, ApiError> {
        self.get(ENDPOINT_REQUEST_ERROR_LOGS).await
    }
}

/// Trim whitespace and trailing slashes, and drop a pasted management path.
pub fn strip_management_path(value: &str) -> String {
    let base_url = value.trim().trim_end_matches('/');
    base_url
        .strip_suffix(API_BASE_PATH)
        .unwrap_or(base_url)
        .to_string()
}

/// Read a response body as a JSON object whenever possible.
///
/// Non-object JSON is wrapped as `{"data": ...}`, plain text as
/// `{"message": ...}`, and a blank body becomes an empty object.
pub fn parse_body(body: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
        Err(_) => {
            let mut map = Map::new();
            if !body.is_empty() {
                map.insert("message".to_string(), Value::String(body.to_string()));
            }
            map
        }
    }
}

fn error_message(data: &Map<String, Value>) -> String {
    ["error", "message"]
        .iter()
        .filter_map(|field| data.get(*field))
        .find(|value| truthy(value))
        .map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// JSON truthiness: null, false, zero and empty containers are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Integer coercion for numeric settings: whole numbers, truncated floats,
/// booleans and integer strings.
pub fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|v| v.is_finite()).map(|v| v.trunc() as i64)),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}
