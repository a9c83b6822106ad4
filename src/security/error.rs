//! Security error types.
//!
//! Every rejection produced by the security core maps to one variant here and
//! is rendered as `{ "error": string, "code": string }`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::db::StoreError;

/// Message returned for blocked IPs. It must not reveal that a block is the cause.
pub const GENERIC_DENIAL: &str = "Access denied. Please try again later.";

/// Why a session failed validation. All map to `SESSION_INVALID` on the
/// wire; the distinction is kept for the attempt log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRejection {
    NotFound,
    Inactive,
    Expired,
    TokenMismatch,
}

impl SessionRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "session_not_found",
            Self::Inactive => "session_inactive",
            Self::Expired => "session_expired",
            Self::TokenMismatch => "token_mismatch",
        }
    }
}

impl std::fmt::Display for SessionRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SecurityError {
    #[error("Authentication required")]
    AuthRequired,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    TokenInvalid,

    #[error("Invalid session ({0})")]
    SessionInvalid(SessionRejection),

    #[error("Malformed encrypted payload")]
    PayloadMalformed,

    #[error("Too many requests")]
    RateLimited,

    #[error("IP blocked")]
    IpBlocked,

    #[error("Request expired")]
    RequestExpired,

    #[error("Duplicate request")]
    DuplicateRequest,

    #[error("Invalid request headers: {0}")]
    RequestInvalid(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Phone number is not authorized")]
    NotWhitelisted,

    #[error("Invalid or expired verification code")]
    OtpInvalid,

    #[error("Admin account is deactivated")]
    AdminDeactivated,

    #[error("Not found")]
    NotFound,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SecurityError {
    /// Machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::SessionInvalid(_) => "SESSION_INVALID",
            Self::PayloadMalformed => "BAD_REQUEST",
            Self::RateLimited => "RATE_LIMITED",
            Self::IpBlocked => "ACCESS_DENIED",
            Self::RequestExpired => "REQUEST_EXPIRED",
            Self::DuplicateRequest => "DUPLICATE_REQUEST",
            Self::RequestInvalid(_) => "REQUEST_INVALID",
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
            Self::NotWhitelisted => "NOT_AUTHORIZED",
            Self::OtpInvalid => "OTP_INVALID",
            Self::AdminDeactivated => "ACCOUNT_DISABLED",
            Self::NotFound => "NOT_FOUND",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::AuthRequired
            | Self::TokenExpired
            | Self::TokenInvalid
            | Self::SessionInvalid(_)
            | Self::OtpInvalid => StatusCode::UNAUTHORIZED,
            Self::IpBlocked | Self::NotWhitelisted | Self::AdminDeactivated => {
                StatusCode::FORBIDDEN
            }
            Self::RateLimited | Self::RequestExpired | Self::DuplicateRequest => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::PayloadMalformed | Self::RequestInvalid(_) | Self::ValidationFailed(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Text safe to show a client. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::IpBlocked => GENERIC_DENIAL.to_string(),
            Self::SessionInvalid(_) => "Invalid or expired session".to_string(),
            Self::TokenExpired => "Token expired, please log in again".to_string(),
            Self::RateLimited => "Too many requests, please try again later".to_string(),
            Self::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<StoreError> for SecurityError {
    fn from(err: StoreError) -> Self {
        tracing::error!("Security store failure: {}", err);
        SecurityError::Internal(err.to_string())
    }
}

/// JSON response body for security errors.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    #[schema(example = "Authentication required")]
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(example = "AUTH_REQUIRED")]
    pub code: Option<&'static str>,
}

impl IntoResponse for SecurityError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.public_message(),
            code: Some(self.code()),
        };
        (self.http_status(), Json(body)).into_response()
    }
}
