//! Runs synchronous SQLite work off the async runtime.

use crate::DbPool;
use rusqlite::Connection;
use thiserror::Error;

/// The blocking task panicked or was cancelled before returning.
#[derive(Debug, Error)]
#[error("database task did not complete: {0}")]
pub struct TaskError(String);

/// Checks a connection out of `pool` on the blocking thread pool and runs
/// `f` with it.
///
/// Callers pick their own error type; it only has to absorb pool checkout
/// failures and [`TaskError`].
pub async fn with_conn<T, E, F>(pool: &DbPool, f: F) -> Result<T, E>
where
    T: Send + 'static,
    E: From<r2d2::Error> + From<TaskError> + Send + 'static,
    F: FnOnce(&Connection) -> Result<T, E> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        f(&conn)
    })
    .await
    .map_err(|e| E::from(TaskError(e.to_string())))?
}
