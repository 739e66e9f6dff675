//! Login and WebSocket ticket issuance.

use axum::extract::State;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::audit;
use crate::auth::{self, AuthedUser};

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub role: &'static str,
    pub expires_at: String,
}

pub async fn login(
    State(ctx): State<ApiContext>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let conn = ctx.core.db.open()?;
    let outcome = auth::login(&conn, &request.username, &request.password, chrono::Utc::now());

    match outcome {
        Ok(session) => {
            audit::append(
                &conn,
                &request.username,
                audit::kind::AUTH_LOGIN,
                &request.username,
                json!({ "role": session.role.as_str() }),
            )
            .map_err(|e| ApiError::Internal(e.to_string()))?;

            Ok(Json(LoginResponse {
                token: session.token,
                role: session.role.as_str(),
                expires_at: session.expires_at,
            }))
        }
        Err(err) => {
            let kind = match &err {
                auth::AuthError::Locked(_) => audit::kind::AUTH_LOCKOUT,
                _ => audit::kind::AUTH_FAILED,
            };
            audit::append(&conn, &request.username, kind, &request.username, json!({}))
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            Err(err.into())
        }
    }
}

#[derive(Serialize)]
pub struct WsTicketResponse {
    pub ticket: String,
    pub expires_in: u64,
}

pub async fn ws_ticket(
    State(ctx): State<ApiContext>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Json<WsTicketResponse>, ApiError> {
    let ticket = {
        let mut tickets = ctx
            .ws_tickets
            .lock()
            .map_err(|_| ApiError::Internal("ticket lock".into()))?;
        tickets.issue(user.username.clone())
    };
    Ok(Json(WsTicketResponse {
        ticket,
        expires_in: 30,
    }))
}
