use serde::Serialize;
use thiserror::Error;

/// Failure of a single management API call.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Authentication failed: {0}")]
    Authentication(String),
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Request failed ({status}): {message}")]
    Request { status: u16, message: String },
    #[error("Malformed response from {endpoint}: {detail}")]
    Malformed { endpoint: String, detail: String },
}

impl ApiError {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Authentication(_) => FailureReason::Authentication,
            Self::Connection(_) => FailureReason::Connection,
            Self::Request { .. } | Self::Malformed { .. } => FailureReason::Other,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

/// Classified reason attached to an "update failed" notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Authentication,
    Connection,
    Other,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication"),
            Self::Connection => write!(f, "connection"),
            Self::Other => write!(f, "other"),
        }
    }
}
