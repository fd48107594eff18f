//! Reminder persistence.
//!
//! Plain synchronous functions over a borrowed connection; async callers run
//! them inside `spawn_blocking`. Status transitions are enforced by the
//! `WHERE status = ...` guard on each update so concurrent writers cannot
//! move a reminder backwards.

use crate::error::ReminderError;
use chrono::{DateTime, SecondsFormat, Utc};
use parley_types::{DeliveryTarget, NotificationPayload, ReminderStatus};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// A stored reminder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: String,
    pub agent_id: String,
    pub device_id: String,
    pub mac_address: String,
    /// Fire time, RFC 3339 in UTC.
    pub remind_at: String,
    /// Fire time as the user expressed it, in their time zone.
    pub remind_at_local: String,
    pub title: String,
    pub content: String,
    pub use_llm: bool,
    pub status: ReminderStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub delivered_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Reminder {
    pub fn target(&self) -> DeliveryTarget {
        DeliveryTarget::new(self.device_id.clone(), self.mac_address.clone())
    }

    pub fn notification(&self) -> NotificationPayload {
        NotificationPayload::new(self.title.clone(), self.content.clone(), self.use_llm)
    }
}

/// Parameters for inserting a reminder.
#[derive(Debug, Clone)]
pub struct NewReminder {
    pub id: String,
    pub agent_id: String,
    pub device_id: String,
    pub mac_address: String,
    pub remind_at: String,
    pub remind_at_local: String,
    pub title: String,
    pub content: String,
    pub use_llm: bool,
}

const SELECT_COLUMNS: &str = "id, agent_id, device_id, mac_address, remind_at, remind_at_local,
    title, content, use_llm, status, retry_count, last_error, delivered_at,
    created_at, updated_at";

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Inserts a new `PENDING` reminder.
pub fn create_reminder(conn: &Connection, new: &NewReminder) -> Result<(), ReminderError> {
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO reminders (
            id, agent_id, device_id, mac_address, remind_at, remind_at_local,
            title, content, use_llm, status, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'PENDING', ?10, ?10)",
        params![
            new.id,
            new.agent_id,
            new.device_id,
            new.mac_address,
            new.remind_at,
            new.remind_at_local,
            new.title,
            new.content,
            new.use_llm,
            now,
        ],
    )?;
    Ok(())
}

pub fn get_reminder(conn: &Connection, id: &str) -> Result<Reminder, ReminderError> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM reminders WHERE id = ?1"),
        [id],
        map_row,
    )
    .optional()?
    .ok_or_else(|| ReminderError::NotFound(id.to_string()))
}

/// Lists a device's reminders, earliest fire time first.
pub fn list_reminders_for_device(
    conn: &Connection,
    device_id: &str,
) -> Result<Vec<Reminder>, ReminderError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM reminders WHERE device_id = ?1 ORDER BY remind_at ASC"
    ))?;
    let rows = stmt.query_map([device_id], map_row)?;
    let mut reminders = Vec::new();
    for row in rows {
        reminders.push(row?);
    }
    Ok(reminders)
}

/// `PENDING → DELIVERED`, stamping `delivered_at`.
pub fn mark_delivered(conn: &Connection, id: &str) -> Result<(), ReminderError> {
    let now = now_rfc3339();
    let changed = conn.execute(
        "UPDATE reminders SET status = 'DELIVERED', delivered_at = ?2, updated_at = ?2
         WHERE id = ?1 AND status = 'PENDING'",
        params![id, now],
    )?;
    ensure_transitioned(conn, id, changed, ReminderStatus::Delivered)
}

/// `PENDING → FAILED` after a delivery attempt; counts the attempt.
pub fn mark_failed(conn: &Connection, id: &str, error: &str) -> Result<(), ReminderError> {
    let now = now_rfc3339();
    let changed = conn.execute(
        "UPDATE reminders
         SET status = 'FAILED', retry_count = retry_count + 1, last_error = ?2, updated_at = ?3
         WHERE id = ?1 AND status = 'PENDING'",
        params![id, error, now],
    )?;
    ensure_transitioned(conn, id, changed, ReminderStatus::Failed)
}

/// `PENDING → FAILED` for a job that was never attempted.
pub fn mark_missed(conn: &Connection, id: &str, reason: &str) -> Result<(), ReminderError> {
    let now = now_rfc3339();
    let changed = conn.execute(
        "UPDATE reminders SET status = 'FAILED', last_error = ?2, updated_at = ?3
         WHERE id = ?1 AND status = 'PENDING'",
        params![id, reason, now],
    )?;
    ensure_transitioned(conn, id, changed, ReminderStatus::Failed)
}

/// `PENDING → FAILED` for every reminder due before `before` that has no job
/// left to fire it. Returns how many rows moved.
pub fn mark_orphans_missed(
    conn: &Connection,
    before: DateTime<Utc>,
    reason: &str,
) -> Result<usize, ReminderError> {
    // remind_at is always written in this exact form, so text order is time order.
    let cutoff = before.to_rfc3339_opts(SecondsFormat::Secs, true);
    let changed = conn.execute(
        "UPDATE reminders SET status = 'FAILED', last_error = ?2, updated_at = ?3
         WHERE status = 'PENDING' AND remind_at < ?1
           AND id NOT IN (SELECT id FROM reminder_jobs)",
        params![cutoff, reason, now_rfc3339()],
    )?;
    Ok(changed)
}

/// `DELIVERED → RECEIVED`, recorded when the device acknowledges.
pub fn mark_received(conn: &Connection, id: &str) -> Result<(), ReminderError> {
    let now = now_rfc3339();
    let changed = conn.execute(
        "UPDATE reminders SET status = 'RECEIVED', updated_at = ?2
         WHERE id = ?1 AND status = 'DELIVERED'",
        params![id, now],
    )?;
    ensure_transitioned(conn, id, changed, ReminderStatus::Received)
}

/// Returns `true` if a row was removed.
pub fn delete_reminder(conn: &Connection, id: &str) -> Result<bool, ReminderError> {
    let removed = conn.execute("DELETE FROM reminders WHERE id = ?1", [id])?;
    Ok(removed > 0)
}

fn ensure_transitioned(
    conn: &Connection,
    id: &str,
    changed: usize,
    to: ReminderStatus,
) -> Result<(), ReminderError> {
    if changed > 0 {
        return Ok(());
    }
    let exists = conn
        .query_row("SELECT 1 FROM reminders WHERE id = ?1", [id], |_| Ok(()))
        .optional()?
        .is_some();
    if exists {
        Err(ReminderError::InvalidTransition {
            id: id.to_string(),
            to,
        })
    } else {
        Err(ReminderError::NotFound(id.to_string()))
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<Reminder> {
    let status: String = row.get(9)?;
    let status = status.parse::<ReminderStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Reminder {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        device_id: row.get(2)?,
        mac_address: row.get(3)?,
        remind_at: row.get(4)?,
        remind_at_local: row.get(5)?,
        title: row.get(6)?,
        content: row.get(7)?,
        use_llm: row.get(8)?,
        status,
        retry_count: row.get(10)?,
        last_error: row.get(11)?,
        delivered_at: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}
