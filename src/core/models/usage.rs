use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A field that decodes to `None` when it is absent or has the wrong shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Loose<T>(pub Option<T>);

impl<T> Default for Loose<T> {
    fn default() -> Self {
        Self(None)
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Loose<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Self(serde_json::from_value(value).ok()))
    }
}

/// Like [`Loose`], but only a JSON object is accepted as the container shape.
///
/// Derived struct decoders also accept arrays positionally, which would let a
/// list masquerade as a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Node<T>(pub Option<T>);

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self(None)
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Node<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        if !value.is_object() {
            return Ok(Self(None));
        }
        Ok(Self(serde_json::from_value(value).ok()))
    }
}

/// A JSON integer. Values above `i64::MAX` saturate; floats, strings and
/// booleans are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Count(pub i64);

impl<'de> Deserialize<'de> for Count {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_u64().map(|_| i64::MAX))
                .map(Count)
                .ok_or_else(|| D::Error::custom("expected an integer")),
            other => Err(D::Error::custom(format!("expected an integer, got {}", other))),
        }
    }
}

impl Loose<Count> {
    pub fn get(&self) -> Option<i64> {
        self.0.map(|count| count.0)
    }
}

fn count_of(value: &Value) -> Option<i64> {
    Count::deserialize(value).ok().map(|count| count.0)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenCounts {
    #[serde(default)]
    pub input_tokens: Loose<Count>,
    #[serde(default)]
    pub output_tokens: Loose<Count>,
    #[serde(default)]
    pub cached_tokens: Loose<Count>,
    #[serde(default)]
    pub total_tokens: Loose<Count>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Detail {
    #[serde(default)]
    pub auth_index: Loose<String>,
    #[serde(default)]
    pub tokens: Node<TokenCounts>,
    #[serde(default)]
    pub failed: Loose<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelUsage {
    #[serde(default)]
    pub details: Loose<Vec<Node<Detail>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiUsage {
    #[serde(default)]
    pub models: Loose<BTreeMap<String, Node<ModelUsage>>>,
}

/// The `apis` tree of the usage object, decoded defensively.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageDocument {
    #[serde(default)]
    pub apis: Loose<BTreeMap<String, Node<ApiUsage>>>,
}

impl UsageDocument {
    /// Decode any JSON value; anything but an object yields an empty document.
    pub fn decode(value: &Value) -> Self {
        if !value.is_object() {
            return Self::default();
        }
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

/// Top-level counters of the usage object. Missing or non-integer values are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageCounters {
    pub total_requests: Option<i64>,
    pub success_count: Option<i64>,
    pub failure_count: Option<i64>,
    pub total_tokens: Option<i64>,
}

impl UsageCounters {
    pub fn from_usage(usage: &Map<String, Value>) -> Self {
        let pick = |field: &str| usage.get(field).and_then(count_of);
        Self {
            total_requests: pick("total_requests"),
            success_count: pick("success_count"),
            failure_count: pick("failure_count"),
            total_tokens: pick("total_tokens"),
        }
    }
}

/// Raw usage payload split into the pieces a cycle needs.
#[derive(Debug, Clone, Default)]
pub struct UsageResponse {
    /// The `usage` object as received, kept for path reads.
    pub raw: Map<String, Value>,
    pub document: UsageDocument,
    pub failed_requests: i64,
}

impl UsageResponse {
    pub fn from_payload(payload: &Map<String, Value>) -> Self {
        let raw = match payload.get("usage") {
            Some(Value::Object(usage)) => usage.clone(),
            _ => Map::new(),
        };
        let document = UsageDocument::decode(&Value::Object(raw.clone()));

        // Top-level counter first, then the usage block's failure count.
        let failed_requests = payload
            .get("failed_requests")
            .and_then(count_of)
            .or_else(|| UsageCounters::from_usage(&raw).failure_count)
            .unwrap_or(0);

        Self {
            raw,
            document,
            failed_requests,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyUsage {
    pub requests: i64,
    pub tokens: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    pub failed: i64,
}

impl KeyUsage {
    pub fn success_requests(&self) -> i64 {
        (self.requests - self.failed).max(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    pub total_tokens: i64,
    pub requests: i64,
}
