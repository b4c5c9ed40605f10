//! Trade Error Types

use thiserror::Error;

use super::state::TransitionAxis;
use crate::store::StoreError;

/// Transition rejected by the adjacency table. The prior state is retained.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {axis} transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub axis: TransitionAxis,
    pub from: String,
    pub to: String,
}

#[derive(Error, Debug, Clone)]
pub enum TradeError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Trade not found: {0}")]
    NotFound(String),

    #[error("Trade already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid dispute resolution: {0}")]
    InvalidResolution(String),

    #[error("Transition not allowed on request: {0}")]
    ReservedTransition(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl TradeError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TradeError::InvalidTransition(_) => "INVALID_STATE_TRANSITION",
            TradeError::NotFound(_) => "TRADE_NOT_FOUND",
            TradeError::AlreadyExists(_) => "TRADE_EXISTS",
            TradeError::InvalidResolution(_) => "INVALID_RESOLUTION",
            TradeError::ReservedTransition(_) => "RESERVED_TRANSITION",
            TradeError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            TradeError::InvalidTransition(_)
            | TradeError::AlreadyExists(_)
            | TradeError::ReservedTransition(_) => 409,
            TradeError::InvalidResolution(_) => 400,
            TradeError::NotFound(_) => 404,
            TradeError::Storage(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_display() {
        let err = InvalidTransition {
            axis: TransitionAxis::Trade,
            from: "completed".into(),
            to: "accepted".into(),
        };
        assert_eq!(err.to_string(), "Invalid trade transition: completed -> accepted");
        let wrapped: TradeError = err.into();
        assert_eq!(wrapped.code(), "INVALID_STATE_TRANSITION");
        assert_eq!(wrapped.http_status(), 409);
    }
}
