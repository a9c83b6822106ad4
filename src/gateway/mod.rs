pub mod auth;
pub mod guards;
pub mod handlers;
pub mod openapi;
pub mod state;
pub mod types;

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use auth::{AuthContext, SESSION_HEADER};
pub use state::{AppState, Stores};

/// Build the HTTP router.
///
/// Layer order per request: client context, IP ledger, rate limiter for the
/// route class, replay guard, then the envelope (login routes) or the
/// authenticator (protected routes).
pub fn router(state: Arc<AppState>) -> Router {
    // ==========================================================================
    // Login routes (public, own rate limiters)
    // ==========================================================================
    let otp_request = Router::new()
        .route("/api/auth/otp/request", post(handlers::request_otp))
        .layer(from_fn_with_state(state.clone(), guards::envelope))
        .layer(from_fn_with_state(state.clone(), guards::replay_guard))
        .layer(from_fn_with_state(state.clone(), guards::otp_rate_limit));

    let otp_verify = Router::new()
        .route("/api/auth/otp/verify", post(handlers::verify_otp))
        .layer(from_fn_with_state(state.clone(), guards::envelope))
        .layer(from_fn_with_state(state.clone(), guards::replay_guard))
        .layer(from_fn_with_state(state.clone(), guards::login_rate_limit));

    // ==========================================================================
    // Protected routes (bearer token + session token)
    // ==========================================================================
    let protected = Router::new()
        .route("/api/auth/logout", post(handlers::logout))
        .route("/api/auth/session", get(handlers::current_session))
        .route("/api/auth/revoke-all", post(handlers::revoke_all))
        .route("/api/security/blocked-ips", get(handlers::list_blocked_ips))
        .route("/api/security/blocked-ips/{ip}", delete(handlers::unblock_ip))
        .route("/api/security/attempts", get(handlers::list_attempts))
        .route(
            "/api/security/admins/{phone}/deactivate",
            post(handlers::deactivate_admin),
        )
        .layer(from_fn_with_state(state.clone(), auth::authenticate))
        .layer(from_fn_with_state(state.clone(), guards::replay_guard))
        .layer(from_fn_with_state(state.clone(), guards::api_rate_limit));

    let public = Router::new()
        .route("/api/health", get(handlers::health_check))
        .layer(from_fn_with_state(state.clone(), guards::api_rate_limit));

    Router::new()
        .merge(otp_request)
        .merge(otp_verify)
        .merge(protected)
        .merge(public)
        .layer(from_fn_with_state(state.clone(), guards::ip_guard))
        .layer(from_fn_with_state(state.clone(), guards::client_context))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()))
}

/// Start HTTP Gateway server
pub async fn run_server(host: &str, port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = router(state);

    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", addr, e))?;

    tracing::info!("Gateway listening on http://{}", addr);
    tracing::info!("API Docs: http://{}/docs", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
