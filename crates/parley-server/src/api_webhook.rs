//! `POST /api/devices/{device_id}/notify`: push a notification to a device.

use crate::api::{parse_json, ApiError};
use crate::dispatcher::DeliveryRoute;
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parley_types::{DeliveryTarget, NotificationPayload};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct NotifyRequest {
    #[serde(alias = "mac")]
    pub mac_address: String,
    #[serde(default)]
    pub title: String,
    pub content: String,
    #[serde(default, rename = "useLLM", alias = "use_llm")]
    pub use_llm: bool,
}

/// Returns 200 with the result when delivered, 202 when accepted but not
/// delivered.
pub async fn notify_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(device_id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: NotifyRequest = parse_json(&body)?;
    if device_id.trim().is_empty() {
        return Err(ApiError::BadRequest("device_id is required".into()));
    }
    if request.mac_address.trim().is_empty() {
        return Err(ApiError::BadRequest("mac_address is required".into()));
    }
    if request.content.trim().is_empty() {
        return Err(ApiError::BadRequest("content is required".into()));
    }

    let target = DeliveryTarget::new(device_id, request.mac_address);
    let payload = NotificationPayload::new(request.title, request.content, request.use_llm);
    let result = state
        .dispatcher
        .dispatch(&target, DeliveryRoute::Webhook, &payload)
        .await;

    let status = if result.delivered {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(result)).into_response())
}
