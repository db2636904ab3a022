use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SessionState;

/// Broad error category used for user-facing handling and retry decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AppErrorCategory {
    /// An operation that needs a signed-in identity ran without one.
    Unauthenticated,
    /// Malformed input, for example an empty membership element.
    InvalidArgument,
    /// The signed-in identity lacks the role an operation requires.
    Forbidden,
    /// A single remote call failed.
    RemoteUnavailable,
    /// A retried read gave up after exhausting its attempts.
    FetchFailed,
    /// The caller abandoned the operation.
    Cancelled,
    /// A remote document did not decode into the expected record.
    Serialization,
    /// Invariant break or closed channel inside the client.
    Internal,
}

impl AppErrorCategory {
    /// Whether repeating the same operation later may succeed.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::RemoteUnavailable | Self::FetchFailed)
    }
}

/// Stable client error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct AppError {
    /// High-level error category.
    pub category: AppErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl AppError {
    /// Construct a new client error.
    pub fn new(
        category: AppErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn unauthenticated(action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            AppErrorCategory::Unauthenticated,
            "unauthenticated",
            format!("'{action}' requires a signed-in user"),
        )
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(
            AppErrorCategory::InvalidArgument,
            "invalid_argument",
            message,
        )
    }

    pub fn forbidden(action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            AppErrorCategory::Forbidden,
            "forbidden",
            format!("'{action}' requires the admin role"),
        )
    }

    pub fn remote_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            AppErrorCategory::RemoteUnavailable,
            "remote_unavailable",
            message,
        )
    }

    /// Aggregate failure after a retry loop ran out of attempts.
    pub fn fetch_failed(action: &str, attempts: u32, last: Option<&AppError>) -> Self {
        let detail = last
            .map(|err| format!(": {}", err.message))
            .unwrap_or_default();
        Self::new(
            AppErrorCategory::FetchFailed,
            "fetch_failed",
            format!("'{action}' failed after {attempts} attempts{detail}"),
        )
    }

    pub fn cancelled(action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            AppErrorCategory::Cancelled,
            "cancelled",
            format!("'{action}' was cancelled"),
        )
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(
            AppErrorCategory::Serialization,
            "document_decode_failed",
            message,
        )
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: SessionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            AppErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while session is in state {current:?}"),
        )
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
