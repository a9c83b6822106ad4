//! Security administration: IP blocks, attempt log, admin deactivation.

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use std::sync::Arc;

use crate::gateway::auth::AuthContext;
use crate::gateway::state::AppState;
use crate::gateway::types::{
    ApiResponse, AttemptView, AttemptsQuery, BlockedIpView, DeactivatedView, UnblockedView,
};
use crate::security::SecurityError;
use crate::session::RevokeReason;

const DEFAULT_ATTEMPTS_LIMIT: usize = 50;
const MAX_ATTEMPTS_LIMIT: usize = 500;

/// Active IP blocks
///
/// GET /api/security/blocked-ips
#[utoipa::path(
    get,
    path = "/api/security/blocked-ips",
    responses(
        (status = 200, description = "Active blocks, newest first", body = ApiResponse<Vec<BlockedIpView>>),
        (status = 401, description = "Not authenticated", body = crate::security::error::ErrorBody)
    ),
    security(("bearer_token" = [], "session_token" = [])),
    tag = "Security"
)]
pub async fn list_blocked_ips(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<BlockedIpView>>>, SecurityError> {
    let blocks = state.ledger.list_active().await?;
    Ok(Json(ApiResponse::success(
        blocks.into_iter().map(BlockedIpView::from).collect(),
    )))
}

/// Clear the block on an IP
///
/// DELETE /api/security/blocked-ips/{ip}
#[utoipa::path(
    delete,
    path = "/api/security/blocked-ips/{ip}",
    params(("ip" = String, Path, description = "Blocked IP address")),
    responses(
        (status = 200, description = "Block cleared", body = ApiResponse<UnblockedView>),
        (status = 404, description = "No active block for this IP", body = crate::security::error::ErrorBody)
    ),
    security(("bearer_token" = [], "session_token" = [])),
    tag = "Security"
)]
pub async fn unblock_ip(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(ip): Path<String>,
) -> Result<Json<ApiResponse<UnblockedView>>, SecurityError> {
    if !state.ledger.unblock_ip(&ip).await? {
        return Err(SecurityError::NotFound);
    }
    tracing::info!(admin_id = %auth.admin_id, ip = %ip, "IP unblocked by admin");
    Ok(Json(ApiResponse::success(UnblockedView { ip_address: ip })))
}

/// Recent authentication attempts
///
/// GET /api/security/attempts?limit=N
#[utoipa::path(
    get,
    path = "/api/security/attempts",
    params(AttemptsQuery),
    responses(
        (status = 200, description = "Attempts, newest first", body = ApiResponse<Vec<AttemptView>>),
        (status = 401, description = "Not authenticated", body = crate::security::error::ErrorBody)
    ),
    security(("bearer_token" = [], "session_token" = [])),
    tag = "Security"
)]
pub async fn list_attempts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AttemptsQuery>,
) -> Result<Json<ApiResponse<Vec<AttemptView>>>, SecurityError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ATTEMPTS_LIMIT)
        .clamp(1, MAX_ATTEMPTS_LIMIT);
    let attempts = state.attempts.recent(limit).await?;
    Ok(Json(ApiResponse::success(
        attempts.into_iter().map(AttemptView::from).collect(),
    )))
}

/// Deactivate an admin and revoke their sessions
///
/// POST /api/security/admins/{phone}/deactivate
#[utoipa::path(
    post,
    path = "/api/security/admins/{phone}/deactivate",
    params(("phone" = String, Path, description = "Admin phone number")),
    responses(
        (status = 200, description = "Admin deactivated", body = ApiResponse<DeactivatedView>),
        (status = 404, description = "Unknown admin", body = crate::security::error::ErrorBody)
    ),
    security(("bearer_token" = [], "session_token" = [])),
    tag = "Security"
)]
pub async fn deactivate_admin(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(phone): Path<String>,
) -> Result<Json<ApiResponse<DeactivatedView>>, SecurityError> {
    let phone = state.credentials.normalize(&phone)?;
    let admin = state.credentials.deactivate(&phone).await?;
    let revoked_sessions = state
        .sessions
        .revoke_all_sessions(admin.id, RevokeReason::AdminDeactivated)
        .await?;
    tracing::warn!(
        by = %auth.admin_id,
        admin_id = %admin.id,
        revoked_sessions,
        "Admin deactivated by admin"
    );
    Ok(Json(ApiResponse::success(DeactivatedView {
        admin_id: admin.id,
        phone_number: admin.phone_number,
        revoked_sessions,
    })))
}
