//! Common error types for the clone engine.

use serde_json::Value;
use thiserror::Error;

/// Error kinds surfaced at the command boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Provider,
    Transport,
    Io,
    Cancelled,
}

/// Common error type for clone operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{message}")]
    Provider {
        status: Option<u16>,
        code: Option<String>,
        message: String,
        body: Option<Value>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid resource id: {0}")]
    InvalidResourceId(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias using common Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a provider error from an HTTP status and the raw response body.
    ///
    /// The ARM error envelope `{"error": {"code", "message"}}` is unpacked when
    /// present; the body is always kept verbatim.
    pub fn provider(status: u16, body: Option<Value>) -> Self {
        let envelope = body.as_ref().and_then(|b| b.get("error"));
        let code = envelope
            .and_then(|e| e.get("code"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let message = envelope
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Request failed with status {}", status));

        Error::Provider {
            status: Some(status),
            code,
            message,
            body,
        }
    }

    /// Build a provider error for a non-success terminal state.
    pub fn terminal(state: &str, body: Value) -> Self {
        let message = body
            .pointer("/properties/error/message")
            .or_else(|| body.pointer("/error/message"))
            .and_then(Value::as_str)
            .map(|m| format!("Operation reached terminal state {}: {}", state, m))
            .unwrap_or_else(|| format!("Operation reached terminal state {}", state));
        let code = body
            .pointer("/properties/error/code")
            .or_else(|| body.pointer("/error/code"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Error::Provider {
            status: None,
            code,
            message,
            body: Some(body),
        }
    }

    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::InvalidResourceId(_) | Error::Config(_) => {
                ErrorKind::Validation
            }
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Provider { .. } | Error::Json(_) | Error::Other(_) => ErrorKind::Provider,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Io(_) => ErrorKind::Io,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// The provider body, if this error carries one.
    pub fn provider_body(&self) -> Option<&Value> {
        match self {
            Error::Provider { body, .. } => body.as_ref(),
            _ => None,
        }
    }
}
