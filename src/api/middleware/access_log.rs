//! Structured access logging. State changes carry their own audit
//! events inside the services; this layer records who touched which
//! route, with ids only.

use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::auth::AuthedUser;

pub async fn log_access(req: Request<axum::body::Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let user = req
        .extensions()
        .get::<AuthedUser>()
        .map(|u| u.username.clone())
        .unwrap_or_else(|| "-".to_string());

    let started = std::time::Instant::now();
    let response = next.run(req).await;

    tracing::info!(
        %method,
        path,
        user,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}
