//! Audit trail access (admin only).

use axum::extract::{Query, State};
use axum::{Extension, Json};
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::audit::{self, AuditEvent};
use crate::auth::AuthedUser;

#[derive(Deserialize)]
pub struct RangeQuery {
    #[serde(default = "default_from")]
    pub from: i64,
    #[serde(default = "default_to")]
    pub to: i64,
}

fn default_from() -> i64 {
    1
}

fn default_to() -> i64 {
    i64::MAX
}

pub async fn events(
    State(ctx): State<ApiContext>,
    Extension(user): Extension<AuthedUser>,
    Query(range): Query<RangeQuery>,
) -> Result<Json<Vec<AuditEvent>>, ApiError> {
    if !user.role.is_admin() {
        return Err(ApiError::Forbidden);
    }

    let conn = ctx.core.db.open()?;
    let events = audit::query_range(&conn, range.from, range.to)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(events))
}

pub async fn verify(
    State(ctx): State<ApiContext>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !user.role.is_admin() {
        return Err(ApiError::Forbidden);
    }

    let conn = ctx.core.db.open()?;
    match audit::verify(&conn, None) {
        Ok(count) => Ok(Json(serde_json::json!({ "verified": count, "intact": true }))),
        Err(audit::AuditError::IntegrityViolation { seq, reason }) => Ok(Json(serde_json::json!({
            "intact": false,
            "broken_at": seq,
            "reason": reason,
        }))),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}
