use crate::api::ApiError;
use crate::AppState;
use axum::{
    extract::{Extension, Path},
    Json,
};
use parley_types::DeviceStatus;
use serde_json::{json, Value};
use std::sync::Arc;

/// `GET /api/presence`: devices with live presence, plus the ones holding a
/// session on this process.
pub async fn list_online_handler(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let online = state.presence.list_online().await;
    Json(json!({
        "online": online,
        "sessions": state.registry.device_ids(),
    }))
}

/// `GET /api/presence/{device_id}`
pub async fn device_status_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceStatus>, ApiError> {
    state
        .presence
        .status(&device_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("device {device_id} is offline")))
}
