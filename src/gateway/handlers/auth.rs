//! Login flow: OTP request and verification, logout, session introspection.

use axum::{
    Extension, Json,
    extract::{State, rejection::JsonRejection},
};
use std::sync::Arc;

use super::json_body;
use crate::admin::LoginEntry;
use crate::gateway::auth::AuthContext;
use crate::gateway::state::AppState;
use crate::gateway::types::{
    AdminView, ApiResponse, LoginView, LogoutView, OtpRequestBody, OtpRequestedView,
    OtpVerifyBody, RevokedView, SessionView,
};
use crate::otp::OTP_TTL_MINUTES;
use crate::security::{AttemptStage, ClientInfo, NewAttempt, SecurityError};
use crate::session::{RevokeReason, SessionMetadata};

/// Request a one-time login code
///
/// POST /api/auth/otp/request
#[utoipa::path(
    post,
    path = "/api/auth/otp/request",
    request_body = OtpRequestBody,
    responses(
        (status = 200, description = "Code issued", body = ApiResponse<OtpRequestedView>),
        (status = 400, description = "Invalid phone number", body = crate::security::error::ErrorBody),
        (status = 403, description = "Phone not authorized or access denied", body = crate::security::error::ErrorBody),
        (status = 429, description = "Too many requests", body = crate::security::error::ErrorBody)
    ),
    tag = "Auth"
)]
pub async fn request_otp(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientInfo>,
    payload: Result<Json<OtpRequestBody>, JsonRejection>,
) -> Result<Json<ApiResponse<OtpRequestedView>>, SecurityError> {
    let body = json_body(payload)?;
    let phone = state.credentials.normalize(&body.phone)?;

    if !state.credentials.is_whitelisted(&phone).await? {
        state
            .attempts
            .record(
                NewAttempt::from_client(&client, AttemptStage::OtpRequest, Some("not_whitelisted"))
                    .phone(&phone),
            )
            .await;
        return Err(SecurityError::NotWhitelisted);
    }

    if let Err(err) = state.otp.issue(&phone).await {
        state
            .attempts
            .record(
                NewAttempt::from_client(&client, AttemptStage::OtpRequest, Some("delivery_failed"))
                    .phone(&phone),
            )
            .await;
        return Err(err);
    }

    state
        .attempts
        .record(NewAttempt::from_client(&client, AttemptStage::OtpRequest, None).phone(&phone))
        .await;

    Ok(Json(ApiResponse::success(OtpRequestedView {
        phone,
        expires_in_secs: OTP_TTL_MINUTES * 60,
    })))
}

/// Verify a login code and open a session
///
/// POST /api/auth/otp/verify
///
/// The first successful verification for a whitelisted phone creates the
/// admin record. Any previous session of the admin is revoked.
#[utoipa::path(
    post,
    path = "/api/auth/otp/verify",
    request_body = OtpVerifyBody,
    responses(
        (status = 200, description = "Logged in", body = ApiResponse<LoginView>),
        (status = 401, description = "Invalid or expired code", body = crate::security::error::ErrorBody),
        (status = 403, description = "Not authorized, deactivated, or access denied", body = crate::security::error::ErrorBody),
        (status = 429, description = "Too many requests", body = crate::security::error::ErrorBody)
    ),
    tag = "Auth"
)]
pub async fn verify_otp(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientInfo>,
    payload: Result<Json<OtpVerifyBody>, JsonRejection>,
) -> Result<Json<ApiResponse<LoginView>>, SecurityError> {
    let body = json_body(payload)?;
    let phone = state.credentials.normalize(&body.phone)?;
    let failure = |reason: &str| {
        NewAttempt::from_client(&client, AttemptStage::OtpVerify, Some(reason)).phone(&phone)
    };

    if let Err(err) = state.otp.verify(&phone, &body.code) {
        state.attempts.record(failure("otp_invalid")).await;
        state.escalator.check_suspicious_activity(&client.ip).await;
        return Err(err);
    }

    let mut admin = match state
        .credentials
        .find_or_create(&phone, body.name.as_deref())
        .await
    {
        Ok(admin) => admin,
        Err(err) => {
            let reason = match err {
                SecurityError::NotWhitelisted => "not_whitelisted",
                SecurityError::AdminDeactivated => "admin_deactivated",
                _ => "admin_lookup_failed",
            };
            state.attempts.record(failure(reason)).await;
            return Err(err);
        }
    };

    let now = state.clock.now();
    let entry = LoginEntry {
        at: now,
        ip_address: client.ip.clone(),
        device: client
            .device
            .as_ref()
            .map(|d| format!("{} on {}", d.browser, d.os)),
    };
    state.credentials.record_login(&mut admin, entry).await?;

    let token = state.tokens.issue(&admin)?;
    let session = state
        .sessions
        .create_session(
            admin.id,
            &token,
            SessionMetadata {
                ip_address: client.ip.clone(),
                device: client.device.clone(),
                location: client.location.clone(),
            },
        )
        .await?;

    let realm = state.tokens.realm_for(&admin.phone_number);
    let stage = if realm.is_development() {
        AttemptStage::DevLogin
    } else {
        AttemptStage::AdminLogin
    };
    state
        .attempts
        .record(
            NewAttempt::from_client(&client, stage, None)
                .phone(&phone)
                .admin(admin.id)
                .session(&session.session_token),
        )
        .await;
    tracing::info!(admin_id = %admin.id, realm = %realm, "Admin logged in");

    Ok(Json(ApiResponse::success(LoginView {
        token,
        session_token: session.session_token.clone(),
        token_expires_at: now + state.tokens.ttl(),
        session_expires_at: session.expires_at,
        realm,
        admin: AdminView::from(&admin),
    })))
}

/// Revoke the current session
///
/// POST /api/auth/logout
#[utoipa::path(
    post,
    path = "/api/auth/logout",
    responses(
        (status = 200, description = "Session revoked", body = ApiResponse<LogoutView>),
        (status = 401, description = "Not authenticated", body = crate::security::error::ErrorBody)
    ),
    security(("bearer_token" = [], "session_token" = [])),
    tag = "Auth"
)]
pub async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Extension(client): Extension<ClientInfo>,
) -> Result<Json<ApiResponse<LogoutView>>, SecurityError> {
    let revoked = state
        .sessions
        .revoke_session(&auth.session_token, RevokeReason::Logout)
        .await?;
    state
        .attempts
        .record(
            NewAttempt::from_client(&client, AttemptStage::Logout, None)
                .phone(&auth.phone_number)
                .admin(auth.admin_id)
                .session(&auth.session_token),
        )
        .await;
    Ok(Json(ApiResponse::success(LogoutView { logged_out: revoked })))
}

/// Current identity and session
///
/// GET /api/auth/session
#[utoipa::path(
    get,
    path = "/api/auth/session",
    responses(
        (status = 200, description = "Session details", body = ApiResponse<SessionView>),
        (status = 401, description = "Not authenticated", body = crate::security::error::ErrorBody)
    ),
    security(("bearer_token" = [], "session_token" = [])),
    tag = "Auth"
)]
pub async fn current_session(
    Extension(auth): Extension<AuthContext>,
) -> Json<ApiResponse<SessionView>> {
    Json(ApiResponse::success(SessionView::new(
        &auth.session,
        &auth.phone_number,
        auth.role,
        auth.realm,
    )))
}

/// Revoke every session of the caller, including this one
///
/// POST /api/auth/revoke-all
#[utoipa::path(
    post,
    path = "/api/auth/revoke-all",
    responses(
        (status = 200, description = "Sessions revoked", body = ApiResponse<RevokedView>),
        (status = 401, description = "Not authenticated", body = crate::security::error::ErrorBody)
    ),
    security(("bearer_token" = [], "session_token" = [])),
    tag = "Auth"
)]
pub async fn revoke_all(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<ApiResponse<RevokedView>>, SecurityError> {
    let revoked = state
        .sessions
        .revoke_all_sessions(auth.admin_id, RevokeReason::SecurityRevocation)
        .await?;
    Ok(Json(ApiResponse::success(RevokedView { revoked })))
}
