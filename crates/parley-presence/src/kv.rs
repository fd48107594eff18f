//! Key-value store seam used by the presence tracker.

use async_trait::async_trait;
use parley_db::DbPool;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("kv pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("kv task failed: {0}")]
    Task(#[from] parley_db::TaskError),

    #[error("kv store unavailable: {0}")]
    Unavailable(String),
}

/// Minimal key-value operations with optional per-key expiry.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Writes `value`, replacing any previous value and expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Deletes `key`, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Deletes `key` only while it holds exactly `expected`, as one atomic
    /// step. Returns whether the key was removed.
    async fn delete_if_value(&self, key: &str, expected: &str) -> Result<bool, KvError>;

    /// Returns all live keys matching a glob pattern where `*` matches any
    /// run of characters.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError>;
}

/// Matches `key` against a glob pattern supporting only `*`.
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return key.is_empty();
    };
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };

    let segments: Vec<&str> = parts.collect();
    let Some((last, middle)) = segments.split_last() else {
        // No '*' at all: exact match.
        return rest.is_empty();
    };

    for segment in middle {
        match rest.find(segment) {
            Some(idx) => rest = &rest[idx + segment.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

/// In-process store for tests and single-node deployments without SQLite.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> KvError {
        KvError::Unavailable("memory store lock poisoned".to_string())
    }
}

fn is_live(expires_at: Option<Instant>, now: Instant) -> bool {
    expires_at.map_or(true, |at| at > now)
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| is_live(*expires_at, now))
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let removed = self
            .entries
            .write()
            .map_err(|_| Self::poisoned())?
            .remove(key);
        let now = Instant::now();
        Ok(removed.is_some_and(|(_, expires_at)| is_live(expires_at, now)))
    }

    async fn delete_if_value(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        let now = Instant::now();
        let matches = entries
            .get(key)
            .is_some_and(|(value, expires_at)| value == expected && is_live(*expires_at, now));
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| is_live(*expires_at, now));
        Ok(entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect())
    }
}

/// Store backed by the `kv_entries` table.
///
/// Expired rows are invisible to reads and purged lazily on `scan`.
#[derive(Clone)]
pub struct SqliteKvStore {
    pool: DbPool,
}

impl SqliteKvStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, KvError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, KvError> + Send + 'static,
    {
        parley_db::with_conn(&self.pool, f).await
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Converts a `*` glob into a LIKE pattern with `\` as the escape character.
fn glob_to_like(pattern: &str) -> String {
    let mut like = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '*' => like.push('%'),
            '%' | '_' | '\\' => {
                like.push('\\');
                like.push(c);
            }
            other => like.push(other),
        }
    }
    like
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM kv_entries
                     WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                    params![key, now_ms()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let key = key.to_string();
        let value = value.to_string();
        let expires_at = ttl.map(|ttl| now_ms().saturating_add(ttl.as_millis() as i64));
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let live: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM kv_entries
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2))",
                params![key, now_ms()],
                |row| row.get(0),
            )?;
            conn.execute("DELETE FROM kv_entries WHERE key = ?1", [&key])?;
            Ok(live)
        })
        .await
    }

    async fn delete_if_value(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let key = key.to_string();
        let expected = expected.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM kv_entries
                 WHERE key = ?1 AND value = ?2 AND (expires_at IS NULL OR expires_at > ?3)",
                params![key, expected, now_ms()],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let like = glob_to_like(pattern);
        self.with_conn(move |conn| {
            let now = now_ms();
            let purged = conn.execute(
                "DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                [now],
            )?;
            if purged > 0 {
                tracing::debug!(count = purged, "purged expired kv entries");
            }

            let mut stmt = conn.prepare(
                "SELECT key FROM kv_entries WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key",
            )?;
            let rows = stmt.query_map([like], |row| row.get::<_, String>(0))?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row?);
            }
            Ok(keys)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matching() {
        assert!(glob_match("device:*:status", "device:abc:status"));
        assert!(glob_match("device:*:status", "device::status"));
        assert!(!glob_match("device:*:status", "config:device:abc:status"));
        assert!(!glob_match("device:*:status", "device:abc:status:x"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
        assert!(glob_match("a*b*c", "a-x-b-y-c"));
        assert!(!glob_match("ab*ba", "aba"));
    }

    #[test]
    fn like_escaping() {
        assert_eq!(glob_to_like("device:*:status"), "device:%:status");
        assert_eq!(glob_to_like("a_b%*"), "a\\_b\\%%");
    }

    #[tokio::test]
    async fn memory_store_expires_keys() {
        let store = MemoryKvStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.scan("*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_store_delete_reports_existence() {
        let store = MemoryKvStore::new();
        store.set("k", "v", None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn memory_store_conditional_delete_checks_value() {
        let store = MemoryKvStore::new();
        store.set("k", "new", None).await.unwrap();
        assert!(!store.delete_if_value("k", "old").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("new"));
        assert!(store.delete_if_value("k", "new").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.delete_if_value("k", "new").await.unwrap());
    }
}
