//! SQLite pool construction.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{ffi, Connection, OpenFlags};
use std::time::Duration;
use thiserror::Error;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Path that selects a private in-memory database instead of a file.
pub const MEMORY_PATH: &str = ":memory:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// How long a connection waits on a locked database before failing.
    pub busy_timeout: Duration,
    pub max_size: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            max_size: 8,
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to open database pool: {0}")]
    Open(#[from] r2d2::Error),
}

/// Opens a pool over `path`, or over one shared in-memory database when
/// `path` is [`MEMORY_PATH`].
///
/// File databases run in WAL mode with `synchronous = NORMAL`. Every
/// `:memory:` connection is a database of its own, so an in-memory pool is
/// capped at a single connection whatever `settings.max_size` says.
///
/// # Errors
///
/// Returns `PoolError::Open` if the first connection cannot be initialised,
/// including when the file refuses WAL mode.
pub fn create_pool(path: &str, settings: PoolSettings) -> Result<DbPool, PoolError> {
    let in_memory = path == MEMORY_PATH;
    let busy_timeout = settings.busy_timeout;

    let manager = if in_memory {
        SqliteConnectionManager::memory()
    } else {
        SqliteConnectionManager::file(path).with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
    };
    let manager = manager.with_init(move |conn| configure(conn, busy_timeout, !in_memory));

    let max_size = if in_memory { 1 } else { settings.max_size };
    let pool = Pool::builder().max_size(max_size).build(manager)?;

    tracing::debug!(path, max_size, "opened database pool");
    Ok(pool)
}

fn configure(conn: &mut Connection, busy_timeout: Duration, file_backed: bool) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    if !file_backed {
        return Ok(());
    }

    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        return Err(rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_ERROR),
            Some(format!("database refused WAL journal mode (got {mode})")),
        ));
    }
    conn.pragma_update(None, "synchronous", "NORMAL")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_pool_is_single_connection() {
        let settings = PoolSettings {
            busy_timeout: Duration::from_millis(2_500),
            max_size: 4,
        };
        let pool = create_pool(MEMORY_PATH, settings).unwrap();
        assert_eq!(pool.max_size(), 1);

        let conn = pool.get().unwrap();
        let busy_timeout: i64 = conn
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
            .unwrap();
        assert_eq!(busy_timeout, 2_500);
    }

    #[test]
    fn file_pool_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.db");
        let pool = create_pool(path.to_str().unwrap(), PoolSettings::default()).unwrap();
        let conn = pool.get().unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
        // NORMAL is 1.
        let synchronous: i64 = conn
            .query_row("PRAGMA synchronous", [], |row| row.get(0))
            .unwrap();
        assert_eq!(synchronous, 1);
    }
}
