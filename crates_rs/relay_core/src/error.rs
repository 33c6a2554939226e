use crate::gate::DenyReason;
use thiserror::Error;

/// Failure talking to the key/membership store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store call timed out")]
    Timeout,

    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome taxonomy surfaced to callers of the control plane.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("unauthorized: {0}")]
    Unauthorized(DenyReason),

    #[error("duplicate message id")]
    Conflict,

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("store unavailable: {0}")]
    Transient(#[from] StoreError),
}

impl RelayError {
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::Malformed(detail.into())
    }

    /// Stable short code for wire responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Conflict => "duplicate-message-id",
            Self::Malformed(_) => "malformed-envelope",
            Self::NotFound(_) => "not-found",
            Self::Transient(_) => "transient",
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
