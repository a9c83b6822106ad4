//! OpenAPI / Swagger UI Documentation
//!
//! - Swagger UI: `http://localhost:8080/docs`
//! - OpenAPI JSON: `http://localhost:8080/api-docs/openapi.json`

use utoipa::openapi::security::{ApiKey, ApiKeyValue, HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::admin::{AdminRole, LoginEntry};
use crate::gateway::handlers::HealthResponse;
use crate::gateway::types::{
    AdminView, AttemptView, BlockedIpView, DeactivatedView, LoginView, LogoutView,
    OtpRequestBody, OtpRequestedView, OtpVerifyBody, RevokedView, SessionView, UnblockedView,
};
use crate::realm::Realm;
use crate::security::error::ErrorBody;
use crate::security::{Device, Location};

/// Both credentials are required on protected routes.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_token",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
            components.add_security_scheme(
                "session_token",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "X-Session-Token",
                    r#"Opaque session token returned by /api/auth/otp/verify.

Optional replay protection on any request:
- X-Request-Timestamp: milliseconds since epoch, within 5 minutes of server time
- X-Request-Nonce: unique per request

Bodies may be sent as {"_encrypted": "<base64(nonce || AES-256-GCM ciphertext)>"};
the response is then encrypted the same way."#,
                ))),
            );
        }
    }
}

/// Main API Documentation struct
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Propdesk Admin Auth API",
        version = "1.0.0",
        description = "Admin authentication and session security for the Propdesk property-management backend."
    ),
    servers(
        (url = "http://localhost:8080", description = "Development"),
    ),
    paths(
        crate::gateway::handlers::health_check,
        crate::gateway::handlers::request_otp,
        crate::gateway::handlers::verify_otp,
        crate::gateway::handlers::logout,
        crate::gateway::handlers::current_session,
        crate::gateway::handlers::revoke_all,
        crate::gateway::handlers::list_blocked_ips,
        crate::gateway::handlers::unblock_ip,
        crate::gateway::handlers::list_attempts,
        crate::gateway::handlers::deactivate_admin,
    ),
    components(
        schemas(
            HealthResponse,
            ErrorBody,
            OtpRequestBody,
            OtpVerifyBody,
            OtpRequestedView,
            LoginView,
            AdminView,
            AdminRole,
            LoginEntry,
            SessionView,
            LogoutView,
            RevokedView,
            BlockedIpView,
            UnblockedView,
            AttemptView,
            DeactivatedView,
            Realm,
            Device,
            Location,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Auth", description = "OTP login, logout and session introspection"),
        (name = "Security", description = "IP blocks, attempt log and admin deactivation (auth required)"),
        (name = "System", description = "Health checks")
    )
)]
pub struct ApiDoc;
