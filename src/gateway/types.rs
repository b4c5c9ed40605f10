//! API Response types and error codes
//!
//! - `ApiResponse<T>`: Unified response wrapper
//! - `error_codes`: Standard error code constants
//! - `ApiError` / `ApiResult`: handler error plumbing

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::escrow::EscrowError;
use crate::rates::RateError;
use crate::reconcile::ReconcileError;
use crate::session::SessionError;
use crate::trade::TradeError;

/// Unified API response wrapper
///
/// - code: 0 = success, non-zero = error code
/// - msg: short message description
/// - data: actual data (success) or absent (error)
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    /// Create success response
    pub fn success(data: T) -> Self {
        Self {
            code: error_codes::SUCCESS,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    /// Create error response
    pub fn error(code: i32, msg: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

pub mod error_codes {
    pub const SUCCESS: i32 = 0;

    // 1xxx: request errors
    pub const INVALID_PARAMETER: i32 = 1001;

    // 4xxx: resource state
    pub const NOT_FOUND: i32 = 4001;
    pub const CONFLICT: i32 = 4090;

    // 5xxx: server side
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const SERVICE_UNAVAILABLE: i32 = 5001;
    pub const UPSTREAM_ERROR: i32 = 5020;
}

/// Handler error rendered as `ApiResponse::error`
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: i32,
    pub msg: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: i32, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            msg: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error_codes::INVALID_PARAMETER, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error_codes::NOT_FOUND, msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, error_codes::CONFLICT, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::INTERNAL_ERROR,
            msg,
        )
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            error_codes::SERVICE_UNAVAILABLE,
            msg,
        )
    }

    pub fn into_err<T>(self) -> ApiResult<T> {
        Err(self)
    }

    /// Map a domain `http_status()` suggestion onto an API error
    fn from_domain(http_status: u16, domain_code: &str, msg: String) -> Self {
        let status =
            StatusCode::from_u16(http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let code = match status {
            StatusCode::BAD_REQUEST => error_codes::INVALID_PARAMETER,
            StatusCode::NOT_FOUND => error_codes::NOT_FOUND,
            StatusCode::CONFLICT => error_codes::CONFLICT,
            StatusCode::BAD_GATEWAY => error_codes::UPSTREAM_ERROR,
            StatusCode::SERVICE_UNAVAILABLE => error_codes::SERVICE_UNAVAILABLE,
            _ => error_codes::INTERNAL_ERROR,
        };
        Self::new(status, code, format!("{}: {}", domain_code, msg))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::<()>::error(self.code, self.msg))).into_response()
    }
}

impl From<EscrowError> for ApiError {
    fn from(e: EscrowError) -> Self {
        Self::from_domain(e.http_status(), e.code(), e.to_string())
    }
}

impl From<TradeError> for ApiError {
    fn from(e: TradeError) -> Self {
        Self::from_domain(e.http_status(), e.code(), e.to_string())
    }
}

impl From<RateError> for ApiError {
    fn from(e: RateError) -> Self {
        Self::from_domain(e.http_status(), e.code(), e.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        Self::from_domain(e.http_status(), e.code(), e.to_string())
    }
}

impl From<ReconcileError> for ApiError {
    fn from(e: ReconcileError) -> Self {
        Self::from_domain(e.http_status(), e.code(), e.to_string())
    }
}

pub type ApiResult<T> = Result<(StatusCode, Json<ApiResponse<T>>), ApiError>;

/// 200 OK with `data`
pub fn ok<T>(data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(ApiResponse::success(data))))
}
