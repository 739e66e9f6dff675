//! Legal corpus search and quarantine administration.

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::auth::AuthedUser;
use crate::models::CitationRef;

#[derive(Deserialize)]
pub struct SearchQuery {
    pub query: String,
    /// Business-event date the answer must be valid for.
    pub as_of: chrono::NaiveDate,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    5
}

#[derive(Serialize)]
pub struct SearchHit {
    pub citation: CitationRef,
    pub score: f32,
    pub excerpt: String,
}

pub async fn search(
    State(ctx): State<ApiContext>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<SearchHit>>, ApiError> {
    if query.query.trim().is_empty() {
        return Err(ApiError::BadRequest("query is required".into()));
    }

    let hits = ctx
        .core
        .law_index
        .search(&query.query, query.as_of, query.top_k.min(20))
        .await?;

    Ok(Json(
        hits.into_iter()
            .map(|hit| SearchHit {
                citation: hit.citation,
                score: hit.score,
                excerpt: hit.text.chars().take(400).collect(),
            })
            .collect(),
    ))
}

#[derive(Serialize)]
pub struct QuarantineEntry {
    pub id: String,
    pub law_code: String,
    pub article: String,
    pub gazette_ref: String,
    pub effective_from: String,
}

/// Unconfirmed corpus drops (admin only).
pub async fn quarantine_list(
    State(ctx): State<ApiContext>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Json<Vec<QuarantineEntry>>, ApiError> {
    if !user.role.is_admin() {
        return Err(ApiError::Forbidden);
    }

    let chunks = ctx.core.law_index.quarantine_list()?;
    Ok(Json(
        chunks
            .into_iter()
            .map(|c| QuarantineEntry {
                id: c.id,
                law_code: c.law_code,
                article: c.article,
                gazette_ref: c.gazette_ref,
                effective_from: c.effective_from,
            })
            .collect(),
    ))
}

/// Promote a quarantined chunk to searchable (admin only).
pub async fn confirm(
    State(ctx): State<ApiContext>,
    Extension(user): Extension<AuthedUser>,
    Path(chunk_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !user.role.is_admin() {
        return Err(ApiError::Forbidden);
    }

    ctx.core.law_index.confirm(&chunk_id, &user.username).await?;
    Ok(Json(serde_json::json!({ "confirmed": chunk_id })))
}
