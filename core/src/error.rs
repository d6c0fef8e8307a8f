use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

/// Failures surfaced by the transport, the resource client and the chat session.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    /// A 401 that the refresh cycle could not repair.
    #[error("authentication failed: {reason}")]
    Authentication { reason: String },
    #[error("request failed ({status}): {detail}")]
    Request { status: StatusCode, detail: String },
    #[error("network error: {0}")]
    Network(String),
    /// Terminal `error` record sent by the server inside the chat stream.
    #[error("stream error: {0}")]
    Stream(String),
    #[error("stream terminated: {0}")]
    StreamTerminated(String),
    #[error("no data received for {0:?}")]
    Stalled(Duration),
    #[error("unexpected response payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ClientError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Authentication { .. } => "Your session has expired. Please sign in again.".into(),
            Self::Request { detail, .. } => detail.clone(),
            Self::Network(detail) => format!("Network error: {detail}"),
            Self::Stream(detail) => detail.clone(),
            Self::StreamTerminated(detail) => format!("The response was interrupted: {detail}"),
            Self::Stalled(after) => format!(
                "The server stopped responding after {} seconds.",
                after.as_secs()
            ),
            Self::Decode(_) => "The server sent an unexpected response.".into(),
            Self::InvalidInput(detail) => detail.clone(),
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Request { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    detail: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

/// Pull a human readable detail out of an error body.
///
/// `detail` wins over `message`. FastAPI validation failures carry `detail` as a
/// list of objects; the first `msg` is used in that case.
pub(crate) fn error_detail(body: &[u8]) -> Option<String> {
    let payload: ErrorPayload = serde_json::from_slice(body).ok()?;
    let detail = payload.detail.and_then(|value| match value {
        serde_json::Value::String(text) => Some(text),
        serde_json::Value::Array(items) => items
            .iter()
            .find_map(|item| item.get("msg").and_then(|msg| msg.as_str()))
            .map(str::to_owned),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    });
    detail
        .or(payload.message)
        .filter(|text| !text.trim().is_empty())
}
