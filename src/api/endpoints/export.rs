//! Export of approved bookings to an ERP target.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::auth::AuthedUser;
use crate::db::repository::ExportReceipt;
use crate::export;

#[derive(Deserialize)]
pub struct ExportRequest {
    pub target: String,
}

pub async fn export_client(
    State(ctx): State<ApiContext>,
    Extension(user): Extension<AuthedUser>,
    Path(client_id): Path<String>,
    Json(request): Json<ExportRequest>,
) -> Result<Json<Vec<ExportReceipt>>, ApiError> {
    if !user.role.can_review() {
        return Err(ApiError::Forbidden);
    }

    let receipts = export::export_client(
        &ctx.core.pipeline,
        &request.target,
        &client_id,
        &user.username,
    )
    .await?;
    Ok(Json(receipts))
}
