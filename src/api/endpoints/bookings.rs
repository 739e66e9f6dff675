//! Booking listing, detail, and operator actions.

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::approval::{self, CorrectionPatch};
use crate::auth::AuthedUser;
use crate::db::repository::BookingSummary;
use crate::models::{Booking, BookingStatus};

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub client: Option<String>,
}

pub async fn list(
    State(ctx): State<ApiContext>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<BookingSummary>>, ApiError> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            BookingStatus::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown status {raw}")))?,
        ),
        None => None,
    };
    let client = query.client.as_deref().filter(|c| !c.is_empty());
    let summaries = approval::list(&ctx.core.pipeline, status, client)?;
    Ok(Json(summaries))
}

pub async fn detail(
    State(ctx): State<ApiContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Booking>, ApiError> {
    Ok(Json(approval::get(&ctx.core.pipeline, id)?))
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub id: String,
    pub status: &'static str,
}

pub async fn approve(
    State(ctx): State<ApiContext>,
    Extension(user): Extension<AuthedUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<StatusResponse>, ApiError> {
    let status = approval::approve(&ctx.core.pipeline, id, &user).await?;
    Ok(Json(StatusResponse {
        id: id.to_string(),
        status: status.as_str(),
    }))
}

#[derive(Deserialize)]
pub struct RejectRequest {
    pub reason: String,
}

pub async fn reject(
    State(ctx): State<ApiContext>,
    Extension(user): Extension<AuthedUser>,
    Path(id): Path<Uuid>,
    Json(request): Json<RejectRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let status = approval::reject(&ctx.core.pipeline, id, &user, &request.reason).await?;
    Ok(Json(StatusResponse {
        id: id.to_string(),
        status: status.as_str(),
    }))
}

#[derive(Serialize)]
pub struct CorrectResponse {
    pub new_booking_id: String,
    pub status: &'static str,
}

pub async fn correct(
    State(ctx): State<ApiContext>,
    Extension(user): Extension<AuthedUser>,
    Path(id): Path<Uuid>,
    Json(patch): Json<CorrectionPatch>,
) -> Result<Json<CorrectResponse>, ApiError> {
    let new_id = approval::correct(&ctx.core.pipeline, id, patch, &user).await?;
    let booking = approval::get(&ctx.core.pipeline, new_id)?;
    Ok(Json(CorrectResponse {
        new_booking_id: new_id.to_string(),
        status: booking.status.as_str(),
    }))
}
