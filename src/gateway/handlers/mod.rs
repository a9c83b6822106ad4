pub mod auth;
pub mod health;
pub mod security;

// Glob re-exports carry the `__path_*` types generated by `#[utoipa::path]`.
pub use auth::*;
pub use health::*;
pub use security::*;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use validator::Validate;

use super::types::validated;
use crate::security::SecurityError;

/// Unwrap a JSON body and run its validation rules.
pub(crate) fn json_body<T: Validate>(
    payload: Result<Json<T>, JsonRejection>,
) -> Result<T, SecurityError> {
    let Json(body) = payload.map_err(|e| SecurityError::ValidationFailed(e.body_text()))?;
    validated(body)
}
