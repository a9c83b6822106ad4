//! Request guards that run before any handler.
//!
//! Order on every route: client context, IP ledger, rate limiter for the
//! route class, replay guard. Protected routes then pass the authenticator.

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{HeaderValue, Request, header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;

use super::auth::AuthContext;
use super::state::AppState;
use crate::security::replay::{NONCE_HEADER, TIMESTAMP_HEADER};
use crate::security::{
    AttemptStage, ClientInfo, EnvelopeError, LimiterKind, NewAttempt, SecurityError,
};

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// The caller's resolved client info, computed on demand if the
/// client-context layer did not run.
pub(crate) fn client_of(state: &AppState, request: &Request<Body>) -> ClientInfo {
    if let Some(client) = request.extensions().get::<ClientInfo>() {
        return client.clone();
    }
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0);
    ClientInfo::resolve(
        request.headers(),
        peer,
        &state.trusted_proxies,
        state.enricher.as_ref(),
    )
}

pub async fn client_context(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let client = client_of(&state, &request);
    request.extensions_mut().insert(client);
    next.run(request).await
}

/// Rejects blocked IPs with a generic 403.
pub async fn ip_guard(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, SecurityError> {
    let client = client_of(&state, &request);
    if state.ledger.is_blocked(&client.ip).await {
        state
            .attempts
            .record(NewAttempt::from_client(
                &client,
                AttemptStage::IpBlocked,
                Some("ip_blocked"),
            ))
            .await;
        return Err(SecurityError::IpBlocked);
    }
    Ok(next.run(request).await)
}

async fn limit(
    state: &AppState,
    kind: LimiterKind,
    request: Request<Body>,
    next: Next,
) -> Result<Response, SecurityError> {
    let client = client_of(state, &request);
    state.limiter.enforce(kind, &client.ip).await?;
    Ok(next.run(request).await)
}

pub async fn otp_rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, SecurityError> {
    limit(&state, LimiterKind::OtpRequest, request, next).await
}

pub async fn login_rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, SecurityError> {
    limit(&state, LimiterKind::LoginVerify, request, next).await
}

pub async fn api_rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, SecurityError> {
    limit(&state, LimiterKind::GeneralApi, request, next).await
}

pub async fn replay_guard(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, SecurityError> {
    let headers = request.headers();
    let timestamp = headers.get(TIMESTAMP_HEADER).and_then(|v| v.to_str().ok());
    let nonce = headers.get(NONCE_HEADER).and_then(|v| v.to_str().ok());

    if let Err(err) = state.replay.check_headers(timestamp, nonce) {
        let client = client_of(&state, &request);
        state
            .attempts
            .record(NewAttempt::from_client(
                &client,
                AttemptStage::ReplayRejected,
                Some(err.code()),
            ))
            .await;
        return Err(err);
    }
    Ok(next.run(request).await)
}

/// Audit an envelope that failed to open.
pub(crate) async fn record_payload_failure(
    state: &AppState,
    client: &ClientInfo,
    auth: Option<&AuthContext>,
) {
    let mut attempt = NewAttempt::from_client(
        client,
        AttemptStage::PayloadDecrypt,
        Some("payload_malformed"),
    );
    if let Some(auth) = auth {
        attempt = attempt
            .phone(&auth.phone_number)
            .admin(auth.admin_id)
            .session(&auth.session_token);
    }
    state.attempts.record(attempt).await;
}

/// Envelope handling for routes outside the authenticator.
pub async fn envelope(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, SecurityError> {
    let client = client_of(&state, &request);
    let (request, encrypted) = match open_request(&state, request).await {
        Ok(opened) => opened,
        Err(e) => {
            record_payload_failure(&state, &client, None).await;
            return Err(e);
        }
    };
    let response = next.run(request).await;
    Ok(if encrypted {
        seal_response(&state, response).await
    } else {
        response
    })
}

/// Replace an enveloped JSON body with its plaintext.
///
/// Returns the request and whether it was enveloped. Bodies that are not
/// JSON objects carrying `_encrypted` pass through untouched.
pub(crate) async fn open_request(
    state: &AppState,
    request: Request<Body>,
) -> Result<(Request<Body>, bool), SecurityError> {
    let (mut parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| SecurityError::PayloadMalformed)?;

    let passthrough = |parts: Parts, bytes: Bytes| -> Result<(Request<Body>, bool), SecurityError> {
        Ok((Request::from_parts(parts, Body::from(bytes)), false))
    };
    if bytes.is_empty() {
        return passthrough(parts, bytes);
    }
    let Ok(value) = serde_json::from_slice::<Value>(&bytes) else {
        return passthrough(parts, bytes);
    };

    match state.envelope.open_json(&value) {
        Ok(None) => passthrough(parts, bytes),
        Ok(Some(plain)) => {
            let plain = serde_json::to_vec(&plain).map_err(|_| SecurityError::PayloadMalformed)?;
            parts.headers.remove(header::CONTENT_LENGTH);
            parts.headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            Ok((Request::from_parts(parts, Body::from(plain)), true))
        }
        Err(e) => {
            tracing::warn!("Rejecting encrypted payload: {}", e);
            Err(SecurityError::PayloadMalformed)
        }
    }
}

/// Encrypt a JSON response into the envelope. Non-JSON responses are
/// returned unchanged.
pub(crate) async fn seal_response(state: &AppState, response: Response) -> Response {
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    if !is_json {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!("Failed to buffer response for sealing: {}", e);
            return SecurityError::Internal("response buffering failed".into()).into_response();
        }
    };
    let sealed = serde_json::from_slice::<Value>(&bytes)
        .map_err(|_| EnvelopeError::Json)
        .and_then(|value| state.envelope.seal_json(&value))
        .and_then(|sealed| {
            serde_json::to_vec(&sealed).map_err(|_| EnvelopeError::Json)
        });

    match sealed {
        Ok(sealed) => {
            parts.headers.remove(header::CONTENT_LENGTH);
            Response::from_parts(parts, Body::from(sealed))
        }
        Err(e) => {
            tracing::error!("Failed to seal response: {}", e);
            SecurityError::Internal("response sealing failed".into()).into_response()
        }
    }
}
