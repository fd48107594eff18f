use parley_types::ReminderStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReminderError {
    /// The requested fire time is not strictly in the future.
    #[error("reminder time must be in the future: {0}")]
    InvalidSchedule(String),

    #[error("invalid reminder time: {0}")]
    InvalidTime(String),

    #[error("invalid reminder request: {0}")]
    InvalidRequest(String),

    #[error("reminder not found: {0}")]
    NotFound(String),

    #[error("reminder {id} cannot move to {to} from its current status")]
    InvalidTransition { id: String, to: ReminderStatus },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("blocking task failed: {0}")]
    Task(#[from] parley_db::TaskError),
}

impl ReminderError {
    /// The reminder row is missing or already past the requested status.
    pub(crate) fn is_row_state(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::InvalidTransition { .. })
    }
}
