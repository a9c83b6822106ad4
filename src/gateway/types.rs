//! API request and response types
//!
//! - `ApiResponse<T>`: Unified success wrapper
//! - Request bodies (validated with `validator`)
//! - Response views. Internal records never leave the server directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use crate::admin::{Admin, AdminRole, LoginEntry};
use crate::realm::Realm;
use crate::security::{BlockedIp, Device, Location, LoginAttempt, SecurityError};
use crate::session::Session;

// ============================================================================
// Unified API Response Format
// ============================================================================

/// Unified API response wrapper
///
/// Successful responses are `{code: 0, msg: "ok", data}`. Errors use the
/// `{error, code}` body produced by `SecurityError`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiResponse<T> {
    #[schema(example = 0)]
    pub code: i32,
    #[schema(example = "ok")]
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }
}

/// Run `validator` rules, mapping failures to `VALIDATION_FAILED`.
pub fn validated<T: Validate>(body: T) -> Result<T, SecurityError> {
    body.validate()
        .map_err(|e| SecurityError::ValidationFailed(e.to_string()))?;
    Ok(body)
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct OtpRequestBody {
    #[validate(length(min = 6, max = 24))]
    #[schema(example = "+91 98765 43210")]
    pub phone: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct OtpVerifyBody {
    #[validate(length(min = 6, max = 24))]
    #[schema(example = "+919876543210")]
    pub phone: String,
    #[validate(length(equal = 6))]
    #[schema(example = "042917")]
    pub code: String,
    /// Display name used when the admin record is created.
    #[validate(length(max = 80))]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct AttemptsQuery {
    /// Defaults to 50, capped at 500.
    pub limit: Option<usize>,
}

// ============================================================================
// Views
// ============================================================================

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OtpRequestedView {
    pub phone: String,
    #[schema(example = 300)]
    pub expires_in_secs: i64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AdminView {
    pub id: Uuid,
    pub phone_number: String,
    pub name: String,
    pub role: AdminRole,
    pub last_login_at: Option<DateTime<Utc>>,
    pub login_history: Vec<LoginEntry>,
}

impl From<&Admin> for AdminView {
    fn from(admin: &Admin) -> Self {
        Self {
            id: admin.id,
            phone_number: admin.phone_number.clone(),
            name: admin.name.clone(),
            role: admin.role,
            last_login_at: admin.last_login_at,
            login_history: admin.login_history.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoginView {
    /// Signed bearer token for `Authorization: Bearer`.
    pub token: String,
    /// Opaque token for `X-Session-Token`.
    pub session_token: String,
    pub token_expires_at: DateTime<Utc>,
    pub session_expires_at: DateTime<Utc>,
    pub realm: Realm,
    pub admin: AdminView,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionView {
    pub admin_id: Uuid,
    pub phone_number: String,
    pub role: AdminRole,
    pub realm: Realm,
    pub ip_address: String,
    pub device: Option<Device>,
    pub location: Option<Location>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionView {
    pub fn new(session: &Session, phone_number: &str, role: AdminRole, realm: Realm) -> Self {
        Self {
            admin_id: session.admin_id,
            phone_number: phone_number.to_string(),
            role,
            realm,
            ip_address: session.ip_address.clone(),
            device: session.device.clone(),
            location: session.location.clone(),
            created_at: session.created_at,
            last_activity: session.last_activity,
            expires_at: session.expires_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LogoutView {
    pub logged_out: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RevokedView {
    pub revoked: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BlockedIpView {
    pub ip_address: String,
    #[schema(example = "rate_limit")]
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
    /// `null` for permanent blocks.
    pub expires_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    pub last_attempt_at: DateTime<Utc>,
    pub attack_type: Option<String>,
    #[schema(value_type = Object)]
    pub metadata: serde_json::Value,
}

impl From<BlockedIp> for BlockedIpView {
    fn from(b: BlockedIp) -> Self {
        Self {
            ip_address: b.ip_address,
            reason: b.reason.as_str().to_string(),
            blocked_at: b.blocked_at,
            expires_at: b.expires_at,
            attempt_count: b.attempt_count,
            last_attempt_at: b.last_attempt_at,
            attack_type: b.attack_type,
            metadata: b.metadata,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UnblockedView {
    pub ip_address: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AttemptView {
    pub id: Uuid,
    pub ip_address: String,
    pub phone_number: Option<String>,
    pub success: bool,
    #[schema(example = "otp_verify")]
    pub stage: String,
    pub failure_reason: Option<String>,
    pub device: Option<Device>,
    pub location: Option<Location>,
    pub admin_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<LoginAttempt> for AttemptView {
    fn from(a: LoginAttempt) -> Self {
        Self {
            id: a.id,
            ip_address: a.ip_address,
            phone_number: a.phone_number,
            success: a.success,
            stage: a.stage.as_str().to_string(),
            failure_reason: a.failure_reason,
            device: a.device,
            location: a.location,
            admin_id: a.admin_id,
            created_at: a.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeactivatedView {
    pub admin_id: Uuid,
    pub phone_number: String,
    pub revoked_sessions: u64,
}
