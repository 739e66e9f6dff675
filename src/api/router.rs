//! API router.
//!
//! Middleware stack (outermost → innermost):
//! Extension(ApiContext) → rate limiter → auth → access log → handler.
//! Login and the liveness probe bypass auth; the WebSocket upgrade
//! authenticates through its one-time ticket.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::api::endpoints;
use crate::api::middleware;
use crate::api::types::ApiContext;
use crate::api::websocket;
use crate::core_state::CoreState;

pub fn api_router(core: Arc<CoreState>) -> Router {
    let ctx = ApiContext::new(core);

    let protected = Router::new()
        .route("/documents", post(endpoints::documents::upload))
        .route("/bookings", get(endpoints::bookings::list))
        .route("/bookings/{id}", get(endpoints::bookings::detail))
        .route("/bookings/{id}/approve", post(endpoints::bookings::approve))
        .route("/bookings/{id}/reject", post(endpoints::bookings::reject))
        .route("/bookings/{id}/correct", post(endpoints::bookings::correct))
        .route("/export/{client_id}", post(endpoints::export::export_client))
        .route("/laws/search", get(endpoints::laws::search))
        .route("/laws/quarantine", get(endpoints::laws::quarantine_list))
        .route(
            "/laws/quarantine/{id}/confirm",
            post(endpoints::laws::confirm),
        )
        .route("/audit", get(endpoints::audit::events))
        .route("/audit/verify", get(endpoints::audit::verify))
        .route("/admin/swap-model", post(endpoints::admin::swap_model))
        .route("/auth/ws-ticket", post(endpoints::auth::ws_ticket))
        .with_state(ctx.clone())
        .layer(axum::middleware::from_fn(middleware::access_log::log_access))
        .layer(axum::middleware::from_fn(middleware::auth::require_auth))
        .layer(axum::middleware::from_fn(middleware::rate::limit))
        .layer(axum::Extension(ctx.clone()));

    let unprotected = Router::new()
        .route("/health", get(endpoints::health::check))
        .route("/auth/login", post(endpoints::auth::login))
        .with_state(ctx.clone())
        .layer(axum::middleware::from_fn(middleware::rate::limit))
        .layer(axum::Extension(ctx.clone()));

    let ws_routes = Router::new()
        .route("/ws/chat", get(websocket::ws_upgrade))
        .with_state(ctx.clone())
        .layer(axum::middleware::from_fn(middleware::rate::limit))
        .layer(axum::Extension(ctx));

    Router::new()
        .merge(protected)
        .merge(unprotected)
        .merge(ws_routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use base64::Engine;
    use std::sync::Arc;
    use tower::ServiceExt;

    use crate::auth;
    use crate::config::Config;
    use crate::inference::{InferKind, InferenceError, ScriptedBackend};
    use crate::models::Role;
    use crate::pipeline::rag::HashEmbedder;

    fn test_core(dir: &tempfile::TempDir) -> Arc<CoreState> {
        let config = Arc::new(Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        });
        CoreState::with_parts(
            config,
            Arc::new(
                ScriptedBackend::new("primary")
                    .with_response(InferKind::Classify, r#"{"expense_account": "4000", "vat_class": "25"}"#)
                    .with_response(InferKind::Chat, "konto 4000"),
            ),
            Box::new(|| Err(InferenceError::VisionUnavailable("test".into()))),
            Arc::new(HashEmbedder),
        )
        .unwrap()
    }

    fn login_token(core: &Arc<CoreState>, username: &str, role: Role) -> String {
        let conn = core.db.open().unwrap();
        auth::create_user(&conn, username, "lozinka-123", role).unwrap();
        auth::login(&conn, username, "lozinka-123", chrono::Utc::now())
            .unwrap()
            .token
    }

    fn authed(method: &str, uri: &str, token: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Authorization", format!("Bearer {token}"));
        let body = match body {
            Some(json) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        builder.body(body).unwrap()
    }

    #[tokio::test]
    async fn health_is_open() {
        let dir = tempfile::tempdir().unwrap();
        let app = api_router(test_core(&dir));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bookings_require_auth() {
        let dir = tempfile::tempdir().unwrap();
        let app = api_router(test_core(&dir));

        let response = app
            .oneshot(Request::builder().uri("/bookings").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn login_round_trip_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(&dir);
        let app = api_router(core.clone());

        {
            let conn = core.db.open().unwrap();
            auth::create_user(&conn, "ana", "lozinka-123", Role::Accountant).unwrap();
        }

        let login = Request::builder()
            .method("POST")
            .uri("/auth/login")
            .header("Content-Type", "application/json")
            .body(Body::from(r#"{"username":"ana","password":"lozinka-123"}"#))
            .unwrap();
        let response = app.clone().oneshot(login).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let token = json["token"].as_str().unwrap().to_string();
        assert_eq!(json["role"], "accountant");

        let response = app
            .oneshot(authed("GET", "/bookings", &token, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bad_login_is_unauthorized_and_audited() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(&dir);
        let app = api_router(core.clone());

        {
            let conn = core.db.open().unwrap();
            auth::create_user(&conn, "ana", "lozinka-123", Role::Accountant).unwrap();
        }

        let login = Request::builder()
            .method("POST")
            .uri("/auth/login")
            .header("Content-Type", "application/json")
            .body(Body::from(r#"{"username":"ana","password":"kriva"}"#))
            .unwrap();
        let response = app.oneshot(login).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let conn = core.db.open().unwrap();
        let events = crate::audit::query_range(&conn, 1, i64::MAX).unwrap();
        assert!(events.iter().any(|e| e.kind == crate::audit::kind::AUTH_FAILED));
    }

    #[tokio::test]
    async fn document_upload_creates_booking() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(&dir);
        let app = api_router(core.clone());
        let token = login_token(&core, "ana", Role::Accountant);

        let content = base64::engine::general_purpose::STANDARD
            .encode(crate::pipeline::extraction::ubl::SAMPLE_UBL.as_bytes());
        let body = serde_json::json!({
            "client_id": "K1",
            "doc_class": "invoice_in",
            "media_type": "application/xml",
            "content": content,
        });

        let response = app
            .clone()
            .oneshot(authed("POST", "/documents", &token, Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 65536).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "proposed");
        let booking_id = json["booking_id"].as_str().unwrap();

        // Approve through the API.
        let response = app
            .clone()
            .oneshot(authed(
                "POST",
                &format!("/bookings/{booking_id}/approve"),
                &token,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Second approval attempt conflicts.
        let response = app
            .oneshot(authed(
                "POST",
                &format!("/bookings/{booking_id}/approve"),
                &token,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unsupported_media_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(&dir);
        let app = api_router(core.clone());
        let token = login_token(&core, "ana", Role::Accountant);

        let body = serde_json::json!({
            "client_id": "K1",
            "media_type": "application/zip",
            "content": base64::engine::general_purpose::STANDARD.encode(b"PK"),
        });
        let response = app
            .oneshot(authed("POST", "/documents", &token, Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn audit_endpoint_is_admin_only() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(&dir);
        let app = api_router(core.clone());

        let accountant = login_token(&core, "ana", Role::Accountant);
        let response = app
            .clone()
            .oneshot(authed("GET", "/audit", &accountant, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let admin = login_token(&core, "vlasnik", Role::Admin);
        let response = app
            .oneshot(authed("GET", "/audit", &admin, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn law_search_returns_citations() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(&dir);
        let app = api_router(core.clone());
        let token = login_token(&core, "ana", Role::Accountant);

        let chunk = crate::db::repository::LawChunkRow {
            id: String::new(),
            law_code: "ZPDV".into(),
            article: "38".into(),
            paragraph: None,
            text: "Opća stopa PDV-a iznosi 25%.".into(),
            gazette_ref: "NN 73/13".into(),
            effective_from: "2013-07-01".into(),
            effective_to: None,
            supersedes: None,
            embedding: None,
            keywords: String::new(),
            confirmed: false,
        };
        let id = core.law_index.ingest(chunk, "admin").await.unwrap();
        core.law_index.confirm(&id, "admin").await.unwrap();

        let response = app
            .oneshot(authed(
                "GET",
                "/laws/search?query=stopa%20pdv&as_of=2026-03-02",
                &token,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 65536).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json[0]["citation"]["law_code"], "ZPDV");
    }

    #[tokio::test]
    async fn ws_ticket_issued_for_authed_user() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(&dir);
        let app = api_router(core.clone());
        let token = login_token(&core, "ana", Role::Accountant);

        let response = app
            .oneshot(authed("POST", "/auth/ws-ticket", &token, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(!json["ticket"].as_str().unwrap().is_empty());
        assert_eq!(json["expires_in"], 30);
    }

    #[tokio::test]
    async fn rate_limit_returns_429() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        config.rate_limit_per_user = 2;
        let core = CoreState::with_parts(
            Arc::new(config),
            Arc::new(ScriptedBackend::new("primary")),
            Box::new(|| Err(InferenceError::VisionUnavailable("test".into()))),
            Arc::new(HashEmbedder),
        )
        .unwrap();
        let app = api_router(core.clone());
        let token = login_token(&core, "ana", Role::Accountant);

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(authed("GET", "/bookings", &token, None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app
            .oneshot(authed("GET", "/bookings", &token, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("Retry-After"));
    }
}
