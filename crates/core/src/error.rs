//! Billing error kinds shared across every service in this crate.
//!
//! Every fallible operation in this crate returns `CoreResult<T>`. The
//! variants line up one-to-one with a small set of abstract error kinds
//! so a caller at any layer (HTTP, scheduler, tests) can map them to the
//! right surfaced status without re-deriving the policy.

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// VALIDATION_ERROR — input violates schema or invariants.
    #[error("validation error: {0}")]
    Validation(String),

    /// UNIQUENESS_VIOLATION — duplicate code/external_id.
    #[error("uniqueness violation: {0}")]
    Uniqueness(String),

    /// NOT_FOUND — resource missing in tenant scope.
    #[error("not found: {0}")]
    NotFound(String),

    /// INVALID_STATE — operation not permitted in current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// RATE_LIMITED — tenant over limit.
    #[error("rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    /// PROVIDER_ERROR — payment or integration adapter failed.
    #[error("provider error: {0}")]
    Provider(String),

    /// TRANSIENT_ERROR — store/network blip; internal retries bounded.
    #[error("transient error: {0}")]
    Transient(String),

    /// INTEGRITY_ERROR — an invariant would be broken; transaction aborts.
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl CoreError {
    /// Abstract kind name, for correlation-id logging and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::Uniqueness(_) => "UNIQUENESS_VIOLATION",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::InvalidState(_) => "INVALID_STATE",
            CoreError::RateLimited { .. } => "RATE_LIMITED",
            CoreError::Provider(_) => "PROVIDER_ERROR",
            CoreError::Transient(_) => "TRANSIENT_ERROR",
            CoreError::Integrity(_) => "INTEGRITY_ERROR",
            CoreError::Database(_) => "TRANSIENT_ERROR",
        }
    }
}
