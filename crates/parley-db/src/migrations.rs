//! Schema migrations embedded at compile time.
//!
//! Applied names are recorded in `_parley_migrations`; each pending migration
//! runs inside its own transaction together with its bookkeeping row.

use rusqlite::Connection;
use std::collections::HashSet;
use thiserror::Error;

macro_rules! migration {
    ($name:literal) => {
        ($name, include_str!(concat!("migrations/", $name, ".sql")))
    };
}

/// Ordered `(name, sql)` pairs. Append only.
const MIGRATIONS: &[(&str, &str)] = &[
    migration!("000_init"),
    migration!("001_kv_entries"),
    migration!("002_reminders"),
    migration!("003_reminder_jobs"),
    migration!("004_reminder_job_claims"),
];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("could not read migration history: {0}")]
    History(rusqlite::Error),

    #[error("migration {name} failed: {source}")]
    Apply {
        name: &'static str,
        source: rusqlite::Error,
    },
}

/// Applies every pending migration, returning the names applied in order.
///
/// # Errors
///
/// Stops at the first failing migration; that migration leaves no trace.
pub fn run_migrations(conn: &Connection) -> Result<Vec<&'static str>, MigrationError> {
    apply(conn, MIGRATIONS)
}

fn apply(
    conn: &Connection,
    migrations: &[(&'static str, &'static str)],
) -> Result<Vec<&'static str>, MigrationError> {
    let applied = history(conn).map_err(MigrationError::History)?;
    let mut newly_applied = Vec::new();

    for &(name, sql) in migrations.iter().filter(|(name, _)| !applied.contains(*name)) {
        tracing::info!(migration = name, "applying migration");
        let fail = |source| MigrationError::Apply { name, source };

        let tx = conn.unchecked_transaction().map_err(fail)?;
        tx.execute_batch(sql).map_err(fail)?;
        tx.execute("INSERT INTO _parley_migrations (name) VALUES (?1)", [name])
            .map_err(fail)?;
        tx.commit().map_err(fail)?;

        newly_applied.push(name);
    }

    Ok(newly_applied)
}

fn history(conn: &Connection) -> rusqlite::Result<HashSet<String>> {
    conn.execute_batch(include_str!("migrations/000_init.sql"))?;
    let mut stmt = conn.prepare("SELECT name FROM _parley_migrations")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    Ok(names)
}
