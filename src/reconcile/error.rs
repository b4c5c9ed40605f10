//! Reconciliation Error Types

use thiserror::Error;

use crate::store::StoreError;
use crate::trade::InvalidTransition;

/// Failures while reconciling a transfer event.
///
/// Business outcomes (duplicate, unmatched, mismatched) are not errors;
/// they are reported through `ReconciliationResult`.
#[derive(Error, Debug, Clone)]
pub enum ReconcileError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Duplicate transfer event")]
    DuplicateEvent,

    #[error("Reconciliation timed out: {0}")]
    ProviderUnavailable(String),

    #[error("Malformed transfer event: {0}")]
    Malformed(String),
}

impl ReconcileError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            ReconcileError::Storage(_) => "STORAGE_ERROR",
            ReconcileError::InvalidTransition(_) => "INVALID_STATE_TRANSITION",
            ReconcileError::DuplicateEvent => "DUPLICATE_EVENT",
            ReconcileError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            ReconcileError::Malformed(_) => "MALFORMED_EVENT",
        }
    }

    /// Get HTTP status code suggestion.
    ///
    /// 5xx makes the provider redeliver, which is only wanted when the
    /// event could not be applied at all.
    pub fn http_status(&self) -> u16 {
        match self {
            ReconcileError::Malformed(_) => 400,
            ReconcileError::InvalidTransition(_) => 409,
            ReconcileError::DuplicateEvent => 200,
            ReconcileError::Storage(_) => 500,
            ReconcileError::ProviderUnavailable(_) => 503,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status() {
        assert_eq!(ReconcileError::Malformed("x".into()).http_status(), 400);
        assert_eq!(ReconcileError::Storage(StoreError::Database("x".into())).http_status(), 500);
        assert_eq!(ReconcileError::ProviderUnavailable("t".into()).http_status(), 503);
        assert_eq!(ReconcileError::DuplicateEvent.code(), "DUPLICATE_EVENT");
    }
}
