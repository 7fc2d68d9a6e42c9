use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AccessDenied,
    NetworkDown,
    NetworkIssues,
    NotFound,
    Validation,
    RateLimited,
    Internal,
}

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct BackendError {
    pub code: ErrorCode,
    pub message: String,
}

impl BackendError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AccessDenied, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Terminal for the session; must be surfaced, never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self.code, ErrorCode::AccessDenied)
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::NetworkDown | ErrorCode::NetworkIssues | ErrorCode::RateLimited
        )
    }
}
