use crate::AppState;
use axum::{
    body::Body,
    http::{header::AUTHORIZATION, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Requires `Authorization: Bearer <webhook.secret>` when a secret is
/// configured. Without one, requests pass through.
pub async fn secret_middleware(req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

    if let Some(expected) = state.config.webhook.secret.as_deref() {
        let provided = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let accepted = provided.is_some_and(|p| secrets_match(p.as_bytes(), expected.as_bytes()));
        if !accepted {
            tracing::warn!(path = %req.uri().path(), "rejected request with bad webhook secret");
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    Ok(next.run(req).await)
}

/// Byte comparison whose running time depends only on the lengths.
fn secrets_match(provided: &[u8], expected: &[u8]) -> bool {
    if provided.len() != expected.len() {
        return false;
    }
    provided
        .iter()
        .zip(expected)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}
