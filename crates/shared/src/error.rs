use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Timeouts and disconnects. Retried per the backoff policy; surfaced
    /// only once every transport is exhausted.
    TransientNetwork,
    /// Never retried; surfaced immediately as an auth-required state.
    Auth,
    /// Rejected before any pending send is created.
    Validation,
    /// Idempotent no-op (e.g. retracting an already-retracted message).
    Conflict,
    Internal,
}

impl ErrorCode {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::TransientNetwork)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelError {
    pub code: ErrorCode,
    pub message: String,
}

impl ChannelError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("{code:?}: {message}")]
pub struct ChannelException {
    pub code: ErrorCode,
    pub message: String,
}

impl ChannelException {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<ChannelException> for ChannelError {
    fn from(value: ChannelException) -> Self {
        Self {
            code: value.code,
            message: value.message,
        }
    }
}
