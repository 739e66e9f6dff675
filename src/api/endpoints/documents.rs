//! Document upload: stores the blob and starts the booking pipeline.

use axum::extract::State;
use axum::{Extension, Json};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::auth::AuthedUser;
use crate::models::DocClass;

#[derive(Deserialize)]
pub struct UploadRequest {
    pub client_id: String,
    /// Omitted: inferred from the media type.
    pub doc_class: Option<String>,
    pub media_type: String,
    /// Document bytes, base64.
    pub content: String,
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub blob_id: String,
    pub booking_id: String,
    pub status: String,
}

fn default_class_for(media_type: &str) -> DocClass {
    match media_type {
        "text/csv" => DocClass::BankStmt,
        _ => DocClass::InvoiceIn,
    }
}

pub async fn upload(
    State(ctx): State<ApiContext>,
    Extension(user): Extension<AuthedUser>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<UploadResponse>, ApiError> {
    if request.client_id.trim().is_empty() {
        return Err(ApiError::BadRequest("client_id is required".into()));
    }

    let doc_class = match &request.doc_class {
        Some(raw) => DocClass::parse(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown doc_class {raw}")))?,
        None => default_class_for(&request.media_type),
    };

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&request.content)
        .map_err(|_| ApiError::BadRequest("content is not valid base64".into()))?;
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("empty document".into()));
    }

    let (blob_id, booking_id) = ctx
        .core
        .pipeline
        .ingest_document(
            &user.username,
            &request.client_id,
            doc_class,
            &bytes,
            &request.media_type,
        )
        .await?;

    let booking = crate::approval::get(&ctx.core.pipeline, booking_id)?;

    Ok(Json(UploadResponse {
        blob_id,
        booking_id: booking_id.to_string(),
        status: booking.status.as_str().to_string(),
    }))
}
