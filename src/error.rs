//! Error types shared across the driver.
//!
//! Backend failures keep the raw JSON body the server produced so callers can
//! forward it untouched; the `is_oom` flag is derived once, where the error is
//! constructed, and carried along for the driver-level retry policy.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error raised by the backend itself: a non-2xx HTTP response body, an
/// `execution_error` event, or an `execution_interrupted` event.
#[derive(Debug, Clone, Default)]
pub struct BackendError {
    /// Raw JSON payload exactly as the backend produced it.
    pub message: String,
    /// True when the failure was recognized as an out-of-memory condition.
    pub is_oom: bool,
    /// Per-node execution durations accumulated up to the failure.
    pub nodes_time: HashMap<String, Duration>,
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for BackendError {}

/// Main error type for the driver.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("backend error: {0}")]
    Backend(BackendError),

    /// The session wait deadline elapsed before a terminal event arrived.
    #[error("session timeout")]
    Timeout,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("canceled")]
    Canceled,
}

impl Error {
    /// Build a backend error from a raw response or event body. An empty body
    /// falls back to the given status text.
    pub fn backend(body: String, status_text: &str) -> Self {
        if body.is_empty() {
            return Error::Backend(BackendError {
                message: format!(r#"{{"error":"{}"}}"#, status_text),
                ..Default::default()
            });
        }
        Error::Backend(BackendError {
            message: body,
            ..Default::default()
        })
    }

    /// True when this error wraps a backend failure flagged as out-of-memory.
    pub fn is_oom(&self) -> bool {
        matches!(self, Error::Backend(e) if e.is_oom)
    }
}

impl From<BackendError> for Error {
    fn from(e: BackendError) -> Self {
        Error::Backend(e)
    }
}
