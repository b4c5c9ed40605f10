//! Session Error Types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Stored record failed to parse or validate; it is discarded
    #[error("Corrupt session record: {0}")]
    Corrupt(String),

    /// No recovery mapping exists for this session type
    #[error("Unsupported session type: {0}")]
    UnsupportedType(String),

    #[error("Invalid session step: {0} (must be >= 1)")]
    InvalidStep(i64),

    #[error("Session storage error: {0}")]
    Scope(String),

    #[error("Session not found: {0}")]
    NotFound(String),
}

impl SessionError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Corrupt(_) => "SESSION_CORRUPT",
            SessionError::UnsupportedType(_) => "UNSUPPORTED_SESSION",
            SessionError::InvalidStep(_) => "INVALID_SESSION_STEP",
            SessionError::Scope(_) => "SESSION_STORAGE_ERROR",
            SessionError::NotFound(_) => "SESSION_NOT_FOUND",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            SessionError::Corrupt(_)
            | SessionError::UnsupportedType(_)
            | SessionError::InvalidStep(_) => 400,
            SessionError::NotFound(_) => 404,
            SessionError::Scope(_) => 500,
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Scope(e.to_string())
    }
}
