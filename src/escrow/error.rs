//! Escrow Error Types

use thiserror::Error;

use crate::store::StoreError;

/// Custody provider failure, as reported by a `CustodyClient`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CustodyError {
    #[error("Custody provider rejected the request: {0}")]
    Rejected(String),

    #[error("Custody provider unreachable: {0}")]
    Unreachable(String),

    #[error("Malformed custody response: {0}")]
    Malformed(String),

    #[error("No custody wallet configured for {0}")]
    UnsupportedAsset(String),
}

/// Escrow address and release errors
#[derive(Error, Debug, Clone)]
pub enum EscrowError {
    #[error("Address allocation failed: {0}")]
    Allocation(String),

    #[error("Custody provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Release failed: {0}")]
    Release(String),

    #[error("Escrow not releasable: {0}")]
    NotReleasable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Escrow not found: {0}")]
    NotFound(String),

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl EscrowError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            EscrowError::Allocation(_) => "ALLOCATION_FAILED",
            EscrowError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            EscrowError::Release(_) => "RELEASE_FAILED",
            EscrowError::NotReleasable(_) => "NOT_RELEASABLE",
            EscrowError::Storage(_) => "STORAGE_ERROR",
            EscrowError::NotFound(_) => "ESCROW_NOT_FOUND",
            EscrowError::InvalidAmount => "INVALID_AMOUNT",
            EscrowError::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            EscrowError::InvalidAmount | EscrowError::InvalidRequest(_) => 400,
            EscrowError::NotFound(_) => 404,
            EscrowError::NotReleasable(_) => 409,
            EscrowError::Allocation(_) | EscrowError::Release(_) => 502,
            EscrowError::ProviderUnavailable(_) => 503,
            EscrowError::Storage(_) => 500,
        }
    }
}

impl From<StoreError> for EscrowError {
    fn from(e: StoreError) -> Self {
        EscrowError::Storage(e.to_string())
    }
}
