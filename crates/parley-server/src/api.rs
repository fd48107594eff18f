use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parley_reminder::ReminderError;
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;

/// Handler error, rendered as `{"error": message}` with a matching status.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    /// The message is returned to the caller; keep internals out of it.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<ReminderError> for ApiError {
    fn from(e: ReminderError) -> Self {
        match e {
            ReminderError::InvalidSchedule(_)
            | ReminderError::InvalidTime(_)
            | ReminderError::InvalidRequest(_) => ApiError::BadRequest(e.to_string()),
            ReminderError::NotFound(_) => ApiError::NotFound(e.to_string()),
            ReminderError::InvalidTransition { .. } => ApiError::Conflict(e.to_string()),
            ReminderError::Database(_)
            | ReminderError::Pool(_)
            | ReminderError::Json(_)
            | ReminderError::Task(_) => {
                tracing::error!(error = %e, "reminder storage failure");
                ApiError::Internal("reminder storage failure".to_string())
            }
        }
    }
}

/// Parses a JSON body, reporting any syntax or shape problem as 400.
pub(crate) fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
}
