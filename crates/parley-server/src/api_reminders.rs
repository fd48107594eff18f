use crate::api::{parse_json, ApiError};
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parley_reminder::{CreateReminder, Reminder};
use std::sync::Arc;

/// `POST /api/reminders`
pub async fn create_reminder_handler(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: CreateReminder = parse_json(&body)?;
    let reminder = state.reminders.create(request).await?;
    Ok((StatusCode::CREATED, Json(reminder)).into_response())
}

/// `GET /api/reminders/{id}`
pub async fn get_reminder_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Reminder>, ApiError> {
    Ok(Json(state.reminders.get(&id).await?))
}

/// `DELETE /api/reminders/{id}`: cancels the pending job and deletes the row.
pub async fn delete_reminder_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.reminders.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/reminders/{id}/received`
pub async fn mark_received_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Reminder>, ApiError> {
    Ok(Json(state.reminders.mark_received(&id).await?))
}

/// `GET /api/devices/{device_id}/reminders`
pub async fn list_device_reminders_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Result<Json<Vec<Reminder>>, ApiError> {
    Ok(Json(state.reminders.list_for_device(&device_id).await?))
}
