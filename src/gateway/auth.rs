//! Request authenticator for protected routes.
//!
//! A request must carry both `Authorization: Bearer <token>` and
//! `X-Session-Token`. The signed token is verified first, then the session it
//! is bound to. On success the handler sees `AuthContext` and `DataContext`
//! in the request extensions. Every rejection is written to the attempt log;
//! only rejections that look like probing are fed to the escalator. An
//! expired token or idle session is a normal client state.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, header},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use uuid::Uuid;

use super::guards::{client_of, open_request, record_payload_failure, seal_response};
use super::state::AppState;
use crate::admin::AdminRole;
use crate::logging::token_prefix;
use crate::realm::Realm;
use crate::security::{AttemptStage, NewAttempt, SecurityError, SessionRejection};
use crate::session::{Session, SessionCheck};
use crate::token::TokenError;

pub const SESSION_HEADER: &str = "x-session-token";

/// Identity attached to an authenticated request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub admin_id: Uuid,
    pub phone_number: String,
    pub role: AdminRole,
    pub session_token: String,
    pub session: Session,
    pub realm: Realm,
}

struct Rejection {
    stage: AttemptStage,
    reason: &'static str,
    error: SecurityError,
    phone: Option<String>,
    session_token: Option<String>,
}

impl Rejection {
    fn token(reason: &'static str, error: SecurityError) -> Self {
        Self {
            stage: AttemptStage::TokenValidation,
            reason,
            error,
            phone: None,
            session_token: None,
        }
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

async fn verify(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, Rejection> {
    let (Some(token), Some(session_token)) = (bearer(headers), session_header(headers)) else {
        return Err(Rejection::token(
            "missing_credentials",
            SecurityError::AuthRequired,
        ));
    };

    let verified = state.tokens.verify(token).map_err(|e| match e {
        TokenError::Expired => Rejection::token("token_expired", SecurityError::TokenExpired),
        TokenError::Invalid(detail) => {
            tracing::debug!("Token rejected: {}", detail);
            Rejection::token("token_invalid", SecurityError::TokenInvalid)
        }
        TokenError::Encoding(detail) => {
            Rejection::token("token_error", SecurityError::Internal(detail))
        }
    })?;
    let claims = verified.claims;

    let session_rejection = |reason: SessionRejection| Rejection {
        stage: AttemptStage::SessionCheck,
        reason: reason.as_str(),
        error: SecurityError::SessionInvalid(reason),
        phone: Some(claims.phone.clone()),
        session_token: Some(session_token.to_string()),
    };

    let session = match state.sessions.validate_session(session_token, token).await {
        Ok(SessionCheck::Valid(session)) => session,
        Ok(SessionCheck::Invalid(reason)) => return Err(session_rejection(reason)),
        Err(e) => {
            tracing::error!(
                session = token_prefix(session_token),
                "Session lookup failed: {}",
                e
            );
            return Err(Rejection {
                stage: AttemptStage::SessionCheck,
                reason: "session_store_error",
                error: SecurityError::Internal(e.to_string()),
                phone: Some(claims.phone.clone()),
                session_token: Some(session_token.to_string()),
            });
        }
    };

    // A session can only be presented by the admin it belongs to.
    if session.admin_id.to_string() != claims.sub {
        return Err(session_rejection(SessionRejection::TokenMismatch));
    }

    // Deactivation revokes sessions, but a login racing it can still hold one.
    let admin = state
        .credentials
        .find_by_id(session.admin_id)
        .await
        .map_err(|e| Rejection {
            stage: AttemptStage::SessionCheck,
            reason: "admin_store_error",
            error: SecurityError::Internal(e.to_string()),
            phone: Some(claims.phone.clone()),
            session_token: Some(session_token.to_string()),
        })?;
    if !admin.is_some_and(|a| a.is_active) {
        return Err(Rejection {
            stage: AttemptStage::SessionCheck,
            reason: "admin_deactivated",
            error: SecurityError::AdminDeactivated,
            phone: Some(claims.phone.clone()),
            session_token: Some(session_token.to_string()),
        });
    }
    let role = claims
        .role
        .parse::<AdminRole>()
        .map_err(|_| Rejection::token("unknown_role", SecurityError::TokenInvalid))?;

    Ok(AuthContext {
        admin_id: session.admin_id,
        phone_number: claims.phone,
        role,
        session_token: session_token.to_string(),
        session,
        realm: verified.realm,
    })
}

/// Rejections a well-behaved client never produces.
fn suggests_attack(reason: &str) -> bool {
    matches!(
        reason,
        "token_invalid" | "unknown_role" | "session_not_found" | "token_mismatch"
    )
}

pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, SecurityError> {
    let client = client_of(&state, &request);

    let ctx = match verify(&state, request.headers()).await {
        Ok(ctx) => ctx,
        Err(rejection) => {
            let mut attempt =
                NewAttempt::from_client(&client, rejection.stage, Some(rejection.reason));
            if let Some(phone) = &rejection.phone {
                attempt = attempt.phone(phone);
            }
            if let Some(session_token) = &rejection.session_token {
                attempt = attempt.session(session_token);
            }
            state.attempts.record(attempt).await;
            if suggests_attack(rejection.reason) {
                state.escalator.check_suspicious_activity(&client.ip).await;
            }
            return Err(rejection.error);
        }
    };

    let (mut request, encrypted) = match open_request(&state, request).await {
        Ok(opened) => opened,
        Err(e) => {
            record_payload_failure(&state, &client, Some(&ctx)).await;
            return Err(e);
        }
    };
    request.extensions_mut().insert(state.data.context(ctx.realm));
    request.extensions_mut().insert(ctx);

    let response = next.run(request).await;
    Ok(if encrypted {
        seal_response(&state, response).await
    } else {
        response
    })
}
