//! Health check handler

use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode};
use utoipa::ToSchema;

use super::super::state::AppState;
use super::super::types::ApiResponse;

/// Health check response data
#[derive(serde::Serialize, serde::Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Server timestamp in milliseconds
    #[schema(example = 1703494800000_i64)]
    pub timestamp_ms: i64,
    /// `postgres` or `memory`
    #[schema(example = "postgres")]
    pub storage: String,
}

/// Health check endpoint
///
/// Pings the auth database when one is configured. Internal details are
/// logged, never returned.
///
/// - Healthy: 200 OK + {code: 0, data: {timestamp_ms, storage}}
/// - Unhealthy: 503 Service Unavailable + {code: 503, msg: "unavailable"}
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service healthy", body = ApiResponse<HealthResponse>, content_type = "application/json"),
        (status = 503, description = "Service unavailable")
    ),
    tag = "System"
)]
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ApiResponse<HealthResponse>>) {
    let storage = match &state.auth_db {
        Some(db) => {
            if let Err(e) = db.health_check().await {
                tracing::error!("[HEALTH] PostgreSQL ping failed: {}", e);
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(ApiResponse {
                        code: 503,
                        msg: "unavailable".to_string(),
                        data: None,
                    }),
                );
            }
            "postgres"
        }
        None => "memory",
    };

    (
        StatusCode::OK,
        Json(ApiResponse::success(HealthResponse {
            timestamp_ms: state.clock.now().timestamp_millis(),
            storage: storage.to_string(),
        })),
    )
}
