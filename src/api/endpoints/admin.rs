//! Administrative operations: model swap.

use axum::extract::State;
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::audit;
use crate::auth::AuthedUser;
use crate::inference::{HttpLlmBackend, LlmBackend};

#[derive(Deserialize)]
pub struct SwapRequest {
    pub url: String,
    pub model: String,
}

/// Drain in-flight inference, swap the primary model handle, verify
/// liveness. The learning memory is not touched: it lives in the
/// relational store, keyed independently of any model.
pub async fn swap_model(
    State(ctx): State<ApiContext>,
    Extension(user): Extension<AuthedUser>,
    Json(request): Json<SwapRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !user.role.is_admin() {
        return Err(ApiError::Forbidden);
    }
    if !request.url.starts_with("http://127.0.0.1") && !request.url.starts_with("http://localhost")
    {
        return Err(ApiError::BadRequest(
            "inference endpoints must be local".into(),
        ));
    }

    let old_model = ctx.core.orchestrator.current_model();
    let new_backend: Arc<dyn LlmBackend> =
        Arc::new(HttpLlmBackend::new(&request.url, &request.model));

    ctx.core
        .orchestrator
        .swap_to(new_backend)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let conn = ctx.core.db.open()?;
    audit::append(
        &conn,
        &user.username,
        audit::kind::MODEL_SWAP,
        &request.model,
        serde_json::json!({ "from": old_model, "to": request.model, "url": request.url }),
    )
    .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(serde_json::json!({
        "swapped_from": old_model,
        "swapped_to": request.model,
    })))
}
