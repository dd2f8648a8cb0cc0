use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::auth::AuthError;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The backend answered with a non-2xx status.
    #[error("HTTP {status}: {message}")]
    Http {
        status: StatusCode,
        message: String,
        body: Option<Value>,
    },
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Response decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

impl ClientError {
    /// Builds an [`ClientError::Http`] from a failed response body.
    ///
    /// The message is taken from the first of `message`, `detail` or `error` found
    /// in a JSON body, then from a non-empty text body, then from the status reason.
    pub fn from_status(status: StatusCode, raw_body: &str) -> Self {
        let body = serde_json::from_str::<Value>(raw_body).ok();
        let message = body
            .as_ref()
            .and_then(extract_message)
            .or_else(|| {
                let trimmed = raw_body.trim();
                (body.is_none() && !trimmed.is_empty()).then(|| trimmed.to_string())
            })
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("Unknown error")
                    .to_string()
            });

        ClientError::Http {
            status,
            message,
            body,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Http { status, .. } => Some(*status),
            ClientError::Transport(e) => e.status(),
            _ => None,
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Http { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            ClientError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ClientError::Auth(AuthError::RefreshFailed(_)) => true,
            _ => false,
        }
    }
}

fn extract_message(body: &Value) -> Option<String> {
    ["message", "detail", "error"].iter().find_map(|key| match body.get(*key)? {
        Value::String(s) => Some(s.clone()),
        Value::Object(inner) => inner
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    })
}
